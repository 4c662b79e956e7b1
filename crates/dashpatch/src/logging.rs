use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogConfig, LogFormat};
use crate::error::{Error, Result};

pub const LOG_ENV: &str = "DASHPATCH_LOG";

/// Install the global subscriber. `$DASHPATCH_LOG` wins over the configured level; output goes
/// to stderr so stdout stays clean for diffs and listings.
pub fn init(cfg: &LogConfig, format_override: Option<LogFormat>) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .map_err(|e| Error::msg(format!("invalid log filter '{}': {e}", cfg.level)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let res = match format_override.unwrap_or(cfg.format) {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    res.map_err(|e| Error::msg(format!("failed to install log subscriber: {e}")))
}
