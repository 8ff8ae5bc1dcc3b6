use thiserror::Error;

use crate::task::TaskState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(u64),

    #[error("task {id} expected state {expected:?} but found {actual:?}")]
    Conflict {
        id: u64,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("task {0} has exhausted its retry budget")]
    AttemptsExhausted(u64),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
