/// Errors returned by the retention store.
///
/// # Examples
///
/// ```rust
/// use moira_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "trigger",
///     id: "t-99".to_string(),
/// };
/// assert!(err.to_string().contains("trigger"));
/// assert!(!err.is_transient());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored JSON document could not be encoded or decoded.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend could not be reached. Callers may retry.
    #[error("Storage: unavailable: {0}")]
    Unavailable(String),

    #[error("Storage: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether the same operation may succeed if retried shortly.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Sqlite(e) => matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
