use crate::error::Result;
use std::future::Future;
use std::time::Duration;

/// Upper bound for a single backoff sleep.
const MAX_DELAY: Duration = Duration::from_secs(5);

/// Runs `op`, retrying transient store failures up to `attempts` times in
/// total with exponential backoff starting at `base`.
///
/// Permanent errors and the last transient error are returned unchanged.
///
/// # Examples
///
/// ```
/// use moira_storage::retry::with_backoff;
/// use std::time::Duration;
///
/// let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
/// let value = rt.block_on(with_backoff("answer", 3, Duration::from_millis(1), || async { Ok(42) }));
/// assert_eq!(value.unwrap(), 42);
/// ```
pub async fn with_backoff<T, F, Fut>(
    op_name: &str,
    attempts: u32,
    base: Duration,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = base
                    .saturating_mul(1u32 << (attempt - 1).min(16))
                    .min(MAX_DELAY);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
