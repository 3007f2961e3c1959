use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

/// Fully resolved logging choices: CLI override beats `[logging]` beats the
/// built-in defaults (info, json).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    level: LevelFilter,
    format: LogFormat,
}

pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = resolve_settings(config, cli_level_override)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true);

    match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))
}

fn resolve_settings(
    config: &Config,
    cli_level_override: Option<&str>,
) -> anyhow::Result<LogSettings> {
    let configured = config.logging.as_ref();

    let raw_level = cli_level_override
        .or_else(|| configured.and_then(|logging| logging.level.as_deref()))
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let level = raw_level.trim().to_ascii_lowercase().parse().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })?;

    Ok(LogSettings {
        level,
        format: configured
            .and_then(|logging| logging.format)
            .unwrap_or(LogFormat::Json),
    })
}
