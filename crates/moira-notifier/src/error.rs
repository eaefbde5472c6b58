use moira_storage::StorageError;

/// Errors raised inside the notifier pipeline.
///
/// Senders themselves return `anyhow::Result` so third-party senders can
/// report whatever their transport produces; these variants cover the
/// pipeline around them.
///
/// # Examples
///
/// ```rust
/// use moira_notifier::error::NotifyError;
///
/// let err = NotifyError::InvalidConfig("missing smtp_host".to_string());
/// assert!(err.to_string().contains("smtp_host"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Sender configuration is missing a required field or contains an invalid value.
    #[error("Notify: invalid sender configuration: {0}")]
    InvalidConfig(String),

    /// No plugin is registered for the sender type.
    #[error("Notify: unknown sender type '{0}'")]
    UnknownSenderType(String),

    /// An event references a trigger, subscription or contact that does not exist.
    #[error("Notify: {entity} {id} not found")]
    Missing { entity: &'static str, id: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Convenience `Result` alias for notifier operations.
pub type Result<T> = std::result::Result<T, NotifyError>;
