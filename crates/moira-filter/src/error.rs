use moira_storage::StorageError;

/// Errors raised while ingesting metrics.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// The line does not follow `metric value timestamp`.
    #[error("Filter: malformed line: {0}")]
    MalformedLine(String),

    #[error("Filter: invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Filter: retention config line {line}: {reason}")]
    Retention { line: usize, reason: String },

    #[error("Filter: I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FilterError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        FilterError::MalformedLine(reason.into())
    }

    pub(crate) fn pattern(pattern: &str, reason: impl Into<String>) -> Self {
        FilterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
