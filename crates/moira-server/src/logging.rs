use crate::config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` directives are kept and the
/// configured level is added for the `moira` crates.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let directive = format!("moira={}", config.level)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid [log].level '{}': {e}", config.level))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}
