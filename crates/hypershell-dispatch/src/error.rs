use thiserror::Error;

use hypershell_protocol::TransportError;
use hypershell_scheduler::SchedulerError;
use hypershell_store::StoreError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),
}
