use moira_storage::StorageError;

/// Errors that turn a trigger check into an `EXCEPTION`.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Checker: invalid target {target:?}: {reason}")]
    Target { target: String, reason: String },

    #[error("Checker: invalid expression: {0}")]
    Expression(String),

    #[error("Checker: {0}")]
    InvalidTrigger(String),

    /// A target that must resolve to one series resolved to several.
    #[error("Checker: target {target} returned {count} series, expected at most one")]
    AloneTarget { target: String, count: usize },

    #[error("Checker: remote source: {0}")]
    Remote(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl CheckError {
    pub(crate) fn target(target: &str, reason: impl Into<String>) -> Self {
        CheckError::Target {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for CheckError {
    fn from(e: reqwest::Error) -> Self {
        CheckError::Remote(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CheckError>;
