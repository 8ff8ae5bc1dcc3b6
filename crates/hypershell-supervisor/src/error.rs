use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dispatch server error: {0}")]
    Dispatch(#[from] hypershell_dispatch::DispatchError),

    #[error("no client binary found; set HYPERSHELL_EXE or place hyper-shell on PATH")]
    MissingExe,
}
