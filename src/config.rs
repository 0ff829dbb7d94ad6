//! Configuration System using Figment
//!
//! Strongly-typed settings for a capture run. Values are layered, later
//! sources overriding earlier ones:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. `config/spectrum_daq.toml`, or the file passed with `--config`
//! 3. Environment variables prefixed with `SPECTRUM_DAQ_`, using `__` between
//!    section and key (e.g. `SPECTRUM_DAQ_ACQUISITION__CENTER_FREQ_HZ=1e9`)
//!
//! Durations are written in humantime notation (`"500ms"`, `"2s"`).
//!
//! # Example
//! ```no_run
//! use spectrum_daq::config::Settings;
//!
//! let settings = Settings::load_from(None)?;
//! settings.validate()?;
//! println!("Capturing at {} Hz", settings.acquisition.center_freq_hz);
//! # Ok::<(), spectrum_daq::error::DaqError>(())
//! ```

use crate::data::ring_buffer::OverflowPolicy;
use crate::data::storage::{LineTerminator, RowSchema, WriterOptions};
use crate::error::{AppResult, DaqError};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/spectrum_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SPECTRUM_DAQ_";

/// Streaming mode of the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Raw baseband IQ samples
    #[default]
    Iq,
    /// Real-time spectrum frames with max-hold
    RealTime,
}

impl std::fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureMode::Iq => write!(f, "iq"),
            CaptureMode::RealTime => write!(f, "real_time"),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Analyzer parameters
    pub acquisition: AcquisitionConfig,
    /// Ring buffer and acquisition loop tuning
    pub pipeline: PipelineConfig,
    /// Output file settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "spectrum_daq".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Analyzer configuration applied once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Capture mode
    pub mode: CaptureMode,
    /// Center frequency in Hz
    pub center_freq_hz: f64,
    /// Span in Hz
    pub span_hz: f64,
    /// Reference level in dBm
    pub reference_level_dbm: f64,
    /// Resolution bandwidth in Hz; also the IQ filter bandwidth
    pub rbw_hz: f64,
    /// IQ decimation factor, a power of two
    pub decimation: u32,
    /// Real-time frame rate (frames per second)
    pub frame_rate: u32,
    /// Vertical range of a real-time frame in dB
    pub frame_scale_db: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: CaptureMode::Iq,
            center_freq_hz: 2.45e9,
            span_hz: 200e3,
            reference_level_dbm: -10.0,
            rbw_hz: 1e3,
            decimation: 4,
            frame_rate: 30,
            frame_scale_db: 100.0,
        }
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ring buffer capacity in records
    pub buffer_capacity: usize,
    /// What the producer does when the ring buffer is full
    pub overflow_policy: OverflowPolicy,
    /// Per-pull timeout on the analyzer
    #[serde(with = "humantime_serde")]
    pub pull_timeout: Duration,
    /// Consecutive pull timeouts tolerated before the run fails
    pub max_consecutive_timeouts: u32,
    /// IQ samples fetched per device call
    pub iq_block_size: usize,
    /// How long the writer waits on an empty buffer before re-checking
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 4096,
            overflow_policy: OverflowPolicy::Block,
            pull_timeout: Duration::from_secs(1),
            max_consecutive_timeouts: 3,
            iq_block_size: 512,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Output file configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for generated file names
    pub output_dir: PathBuf,
    /// Field delimiter, a single ASCII character
    pub delimiter: char,
    /// Row terminator
    pub line_terminator: LineTerminator,
    /// Column layout
    pub schema: RowSchema,
    /// Rows per flushed batch
    pub batch_rows: usize,
    /// Maximum time a row may wait in memory
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
    /// `fsync` after every flush
    pub sync_on_flush: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let writer = WriterOptions::default();
        Self {
            output_dir: PathBuf::from("."),
            delimiter: writer.delimiter as char,
            line_terminator: writer.terminator,
            schema: writer.schema,
            batch_rows: writer.batch_rows,
            batch_interval: writer.batch_interval,
            sync_on_flush: writer.sync_on_flush,
        }
    }
}

impl StorageConfig {
    /// Writer options described by this section. Call after `validate`.
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            delimiter: u8::try_from(self.delimiter).unwrap_or(b','),
            terminator: self.line_terminator,
            schema: self.schema,
            batch_rows: self.batch_rows,
            batch_interval: self.batch_interval,
            sync_on_flush: self.sync_on_flush,
        }
    }
}

impl Settings {
    /// Load from the default file (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(None)
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `config/spectrum_daq.toml`
    /// is used when present and silently skipped otherwise.
    pub fn load_from(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(DaqError::Configuration(format!(
                        "config file '{}' does not exist",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                figment = figment.merge(Toml::file(DEFAULT_CONFIG_PATH));
            }
        }

        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        tracing::debug!(?path, "Configuration loaded");
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        crate::logging::parse_log_level(&self.application.log_level)
            .map_err(DaqError::Configuration)?;

        let acq = &self.acquisition;
        if !(acq.center_freq_hz.is_finite() && acq.center_freq_hz > 0.0) {
            return invalid(format!(
                "center_freq_hz must be positive, got {}",
                acq.center_freq_hz
            ));
        }
        if !(acq.span_hz.is_finite() && acq.span_hz > 0.0) {
            return invalid(format!("span_hz must be positive, got {}", acq.span_hz));
        }
        if !acq.reference_level_dbm.is_finite() {
            return invalid("reference_level_dbm must be finite".to_string());
        }
        if !(acq.rbw_hz.is_finite() && acq.rbw_hz > 0.0) {
            return invalid(format!("rbw_hz must be positive, got {}", acq.rbw_hz));
        }
        match acq.mode {
            CaptureMode::Iq => {
                if !acq.decimation.is_power_of_two() {
                    return invalid(format!(
                        "decimation must be a power of two, got {}",
                        acq.decimation
                    ));
                }
            }
            CaptureMode::RealTime => {
                if acq.frame_rate == 0 {
                    return invalid("frame_rate must be at least 1".to_string());
                }
                if !(acq.frame_scale_db.is_finite() && acq.frame_scale_db > 0.0) {
                    return invalid(format!(
                        "frame_scale_db must be positive, got {}",
                        acq.frame_scale_db
                    ));
                }
            }
        }

        let pipe = &self.pipeline;
        if pipe.buffer_capacity == 0 {
            return invalid("buffer_capacity must be at least 1".to_string());
        }
        if pipe.iq_block_size == 0 {
            return invalid("iq_block_size must be at least 1".to_string());
        }
        if pipe.pull_timeout.is_zero() {
            return invalid("pull_timeout must be non-zero".to_string());
        }
        if pipe.poll_interval.is_zero() {
            return invalid("poll_interval must be non-zero".to_string());
        }

        let storage = &self.storage;
        if !storage.delimiter.is_ascii()
            || matches!(storage.delimiter, '"' | '\r' | '\n')
        {
            return invalid(format!(
                "delimiter must be a single ASCII character other than quote or newline, got {:?}",
                storage.delimiter
            ));
        }
        if storage.batch_rows == 0 {
            return invalid("batch_rows must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.acquisition.mode, CaptureMode::Iq);
        assert_eq!(settings.acquisition.center_freq_hz, 2.45e9);
        assert_eq!(settings.storage.delimiter, ',');
        assert_eq!(settings.pipeline.overflow_policy, OverflowPolicy::Block);
    }

    #[test]
    #[serial]
    fn test_load_without_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from(None).expect("defaults");
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_toml_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_dir("config")?;
            jail.create_file(
                "config/spectrum_daq.toml",
                r#"
                [acquisition]
                mode = "real_time"
                center_freq_hz = 915e6
                rbw_hz = 10e3

                [pipeline]
                pull_timeout = "250ms"
                overflow_policy = "drop_oldest"

                [storage]
                delimiter = ";"
                line_terminator = "crlf"
                schema = "extended"
                "#,
            )?;
            jail.set_env("SPECTRUM_DAQ_ACQUISITION__CENTER_FREQ_HZ", "1000000000");
            jail.set_env("SPECTRUM_DAQ_PIPELINE__BUFFER_CAPACITY", "16");

            let settings = Settings::load_from(None).expect("load");
            assert_eq!(settings.acquisition.mode, CaptureMode::RealTime);
            assert_eq!(settings.acquisition.center_freq_hz, 1e9);
            assert_eq!(settings.acquisition.rbw_hz, 10e3);
            assert_eq!(settings.pipeline.pull_timeout, Duration::from_millis(250));
            assert_eq!(settings.pipeline.overflow_policy, OverflowPolicy::DropOldest);
            assert_eq!(settings.pipeline.buffer_capacity, 16);
            // Untouched keys keep their defaults
            assert_eq!(settings.acquisition.span_hz, 200e3);

            let options = settings.storage.writer_options();
            assert_eq!(options.delimiter, b';');
            assert_eq!(options.terminator, LineTerminator::CrLf);
            assert_eq!(options.schema, RowSchema::Extended);
            assert!(settings.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_explicit_missing_file_is_an_error() {
        Jail::expect_with(|_jail| {
            let err = Settings::load_from(Some(Path::new("nope.toml"))).unwrap_err();
            assert!(matches!(err, DaqError::Configuration(_)));
            Ok(())
        });
    }

    #[test]
    #[serial]
    fn test_malformed_value_is_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[pipeline]\nbuffer_capacity = \"lots\"\n")?;
            let err = Settings::load_from(Some(Path::new("custom.toml"))).unwrap_err();
            assert!(matches!(err, DaqError::Config(_)));
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.acquisition.span_hz = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.acquisition.decimation = 3;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.pipeline.buffer_capacity = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.storage.delimiter = '\n';
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.storage.delimiter = 'é';
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.acquisition.mode = CaptureMode::RealTime;
        settings.acquisition.frame_rate = 0;
        assert!(settings.validate().is_err());
    }
}
