use thiserror::Error;

use hypershell_protocol::TransportError;
use hypershell_template::TemplateError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("server rejected connection: {0}")]
    Rejected(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),
}
