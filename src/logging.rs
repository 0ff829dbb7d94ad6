//! Log output for the capture tool.
//!
//! Events go to stderr so stdout stays free for capture summaries. The level
//! comes from `application.log_level`; a `RUST_LOG` directive, when present,
//! replaces it entirely.
//!
//! ```no_run
//! use spectrum_daq::{config::Settings, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_from(None)?;
//! logging::init_from_settings(&settings)?;
//! tracing::info!(center_hz = settings.acquisition.center_freq_hz, "Analyzer configured");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured; for a terminal
    #[default]
    Pretty,
    /// One line per event, no colours
    Compact,
    /// One JSON object per event
    Json,
}

/// Resolved logging options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
}

impl TracingConfig {
    /// Read level and format from the `application` section.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: settings.application.log_format,
        })
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }
}

/// Install the global subscriber described by `settings`.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let base = fmt::layer().with_writer(std::io::stderr).with_thread_names(true);
    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().with_filter(config.filter()).boxed(),
        OutputFormat::Compact => base
            .compact()
            .with_ansi(false)
            .with_filter(config.filter())
            .boxed(),
        OutputFormat::Json => base.json().with_filter(config.filter()).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| format!("failed to install log subscriber: {e}"))
}

/// Parse `trace`, `debug`, `info`, `warn` or `error`, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!("invalid log level '{level}', expected one of trace, debug, info, warn, error")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("warn"), Ok(Level::WARN));
        assert_eq!(parse_log_level("INFO"), Ok(Level::INFO));
        assert!(parse_log_level("verbose").unwrap_err().contains("verbose"));
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.application.log_level = "debug".to_string();
        settings.application.log_format = OutputFormat::Json;

        let config = TracingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);

        settings.application.log_level = "loud".to_string();
        assert!(TracingConfig::from_settings(&settings).is_err());
    }

    #[test]
    fn test_init_twice_is_ok() {
        let mut settings = Settings::default();
        settings.application.log_level = "error".to_string();
        settings.application.log_format = OutputFormat::Compact;
        assert!(init_from_settings(&settings).is_ok());
        assert!(init_from_settings(&settings).is_ok());
    }
}
