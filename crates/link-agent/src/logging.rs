use std::str::FromStr;

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogConfig;

/// Install the global subscriber described by the `[log]` section
///
/// `RUST_LOG` directives are honored; the configured level is added on top.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let level = Level::from_str(&config.level).map_err(|_| anyhow!("invalid log level: {}", config.level))?;
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let span_events = if config.spans { FmtSpan::ACTIVE } else { FmtSpan::NONE };

    let builder = fmt()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.with_writer(std::io::stdout).json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_level_rejected_before_install() {
        let config = LogConfig {
            level: "chatty".to_string(),
            ..LogConfig::default()
        };
        let err = init_tracing(&config).unwrap_err();
        assert!(err.to_string().contains("invalid log level: chatty"));
    }
}
