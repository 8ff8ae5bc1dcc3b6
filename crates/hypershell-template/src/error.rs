use thiserror::Error;

/// Structured reason a template failed to expand. Carried on the Task as the
/// FAILED reason per spec section 4.1 ("any substitution failing... marks
/// the Task as FAILED with a structured reason; the command is not
/// executed").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unbalanced delimiter in template at byte {0}")]
    UnbalancedDelimiter(usize),

    #[error("unknown substitution form starting at byte {0}")]
    UnknownForm(usize),

    #[error("whitespace index {index} out of range for {len} tokens")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("invalid slice bounds: {0}")]
    InvalidSlice(String),

    #[error("subshell command exited with status {0:?}")]
    SubshellFailed(Option<i32>),

    #[error("subshell spawn failed: {0}")]
    SubshellSpawnFailed(String),

    #[error("expression error: {0}")]
    ExpressionError(String),
}
