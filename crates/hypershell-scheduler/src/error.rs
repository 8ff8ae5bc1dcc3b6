use thiserror::Error;

use hypershell_store::StoreError;
use hypershell_template::TemplateError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ready queue is closed")]
    QueueClosed,
}
