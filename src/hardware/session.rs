//! Device session state machine.
//!
//! A `DeviceSession` exclusively owns one `DeviceHandle` and enforces the
//! instrument lifecycle:
//!
//! ```text
//! Closed ──open──▶ Opened ──configure──▶ Configured ──arm──▶ Armed
//!                                            ▲                 │
//!                                            └──────abort──────┘
//! any non-Closed state ──close──▶ Closed
//! ```
//!
//! Every call that violates this table yields `DeviceErrorKind::InvalidState`.
//! The session is move-only; dropping it without `close` aborts (if armed)
//! and closes the handle.

use crate::config::{AcquisitionConfig, CaptureMode};
use crate::error::{DeviceError, DeviceErrorKind};
use crate::hardware::capabilities::{
    AnalyzerDriver, DeviceHandle, DeviceInfo, RealTimeParams, StreamInfo, SweepInfo,
};
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handle released
    Closed,
    /// Handle acquired, not yet configured
    Opened,
    /// Configuration applied, not streaming
    Configured,
    /// Streaming or sweeping
    Armed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Closed => "closed",
            SessionState::Opened => "opened",
            SessionState::Configured => "configured",
            SessionState::Armed => "armed",
        };
        write!(f, "{}", label)
    }
}

/// Owning wrapper around one opened analyzer.
pub struct DeviceSession<D: AnalyzerDriver> {
    driver: Arc<D>,
    handle: Option<DeviceHandle>,
    state: SessionState,
    config: Option<AcquisitionConfig>,
}

impl<D: AnalyzerDriver> DeviceSession<D> {
    /// Open the analyzer behind `driver`.
    pub async fn open(driver: Arc<D>) -> Result<Self, DeviceError> {
        let handle = driver.open_device().await?;
        tracing::info!(handle = %handle, api = %driver.api_version(), "Device opened");
        Ok(Self {
            driver,
            handle: Some(handle),
            state: SessionState::Opened,
            config: None,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Configuration applied by `configure`, if any.
    pub fn config(&self) -> Option<&AcquisitionConfig> {
        self.config.as_ref()
    }

    /// Mode the session is streaming in, when armed.
    pub fn armed_mode(&self) -> Option<CaptureMode> {
        match self.state {
            SessionState::Armed => self.config.as_ref().map(|c| c.mode),
            _ => None,
        }
    }

    fn handle_for(&self, operation: &str) -> Result<&DeviceHandle, DeviceError> {
        match (&self.handle, self.state) {
            (Some(handle), state) if state != SessionState::Closed => Ok(handle),
            _ => Err(DeviceError::invalid_state(operation, self.state)),
        }
    }

    fn require(&self, operation: &str, expected: SessionState) -> Result<(), DeviceError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DeviceError::invalid_state(operation, self.state))
        }
    }

    /// Apply `config`. Allowed exactly once, right after open.
    pub async fn configure(&mut self, config: &AcquisitionConfig) -> Result<(), DeviceError> {
        self.require("configure", SessionState::Opened)?;
        let handle = self.handle_for("configure")?;

        self.driver
            .configure_center_span(handle, config.center_freq_hz, config.span_hz)
            .await?;
        self.driver
            .configure_level(handle, config.reference_level_dbm)
            .await?;
        match config.mode {
            CaptureMode::Iq => {
                self.driver
                    .configure_iq(handle, config.decimation, config.rbw_hz)
                    .await?
            }
            CaptureMode::RealTime => {
                let params = RealTimeParams {
                    rbw_hz: config.rbw_hz,
                    frame_scale_db: config.frame_scale_db,
                    frame_rate: config.frame_rate,
                };
                self.driver.configure_real_time(handle, &params).await?
            }
        }

        tracing::info!(
            mode = %config.mode,
            center_hz = config.center_freq_hz,
            span_hz = config.span_hz,
            ref_dbm = config.reference_level_dbm,
            "Device configured"
        );
        self.config = Some(config.clone());
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Start streaming. `mode` must match the configured mode.
    pub async fn arm(&mut self, mode: CaptureMode) -> Result<(), DeviceError> {
        self.require("arm", SessionState::Configured)?;
        let configured = self.config.as_ref().map(|c| c.mode);
        if configured != Some(mode) {
            return Err(DeviceError::new(
                DeviceErrorKind::UnsupportedMode,
                format!("session is configured for {configured:?}, cannot arm for {mode}"),
            ));
        }

        let handle = self.handle_for("arm")?;
        self.driver.initiate(handle, mode).await?;
        self.state = SessionState::Armed;
        tracing::info!(%mode, "Device armed");
        Ok(())
    }

    /// Stop streaming. A no-op unless armed; only a closed session rejects it.
    ///
    /// Driver failures while stopping are logged, never returned: the session
    /// is considered stopped either way.
    pub fn abort(&mut self) -> Result<(), DeviceError> {
        let handle = self.handle_for("abort")?;
        if self.state != SessionState::Armed {
            return Ok(());
        }
        if let Err(e) = self.driver.abort(handle) {
            tracing::warn!(error = %e, "Device abort reported an error");
        }
        self.state = SessionState::Configured;
        tracing::info!("Device aborted");
        Ok(())
    }

    /// Release the handle, aborting first when armed.
    pub fn close(&mut self) -> Result<(), DeviceError> {
        self.handle_for("close")?;
        self.abort()?;

        self.state = SessionState::Closed;
        match self.handle.take() {
            Some(handle) => {
                let id = handle.id();
                self.driver.close_device(handle)?;
                tracing::info!(handle = id, "Device closed");
                Ok(())
            }
            None => Err(DeviceError::invalid_state("close", SessionState::Closed)),
        }
    }

    /// Model, serial number and health readings.
    pub async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        let handle = self.handle_for("query device info")?;
        self.driver.device_info(handle).await
    }

    /// IQ stream characteristics. Requires an IQ-armed session.
    pub async fn stream_info(&self) -> Result<StreamInfo, DeviceError> {
        self.require_armed("query stream info", CaptureMode::Iq)?;
        let handle = self.handle_for("query stream info")?;
        self.driver.query_stream_info(handle).await
    }

    /// Sweep geometry. Requires a real-time-armed session.
    pub async fn sweep_info(&self) -> Result<SweepInfo, DeviceError> {
        self.require_armed("query sweep info", CaptureMode::RealTime)?;
        let handle = self.handle_for("query sweep info")?;
        self.driver.query_sweep_info(handle).await
    }

    /// Fill `buf` with interleaved IQ pairs.
    pub async fn fetch_iq(&self, buf: &mut [f32]) -> Result<(), DeviceError> {
        self.require_armed("fetch IQ data", CaptureMode::Iq)?;
        let handle = self.handle_for("fetch IQ data")?;
        self.driver.get_iq_data(handle, buf).await
    }

    /// Fill one frame and the max-hold trace.
    pub async fn fetch_frame(
        &self,
        bins: &mut [f32],
        max_hold: &mut [f32],
    ) -> Result<(), DeviceError> {
        self.require_armed("fetch a real-time frame", CaptureMode::RealTime)?;
        let handle = self.handle_for("fetch a real-time frame")?;
        self.driver.get_real_time_frame(handle, bins, max_hold).await
    }

    fn require_armed(&self, operation: &str, mode: CaptureMode) -> Result<(), DeviceError> {
        self.require(operation, SessionState::Armed)?;
        if self.armed_mode() != Some(mode) {
            return Err(DeviceError::new(
                DeviceErrorKind::UnsupportedMode,
                format!("cannot {operation} while streaming in a different mode"),
            ));
        }
        Ok(())
    }
}

impl<D: AnalyzerDriver> fmt::Debug for DeviceSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish()
    }
}

impl<D: AnalyzerDriver> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            tracing::debug!(state = %self.state, "Closing device session on drop");
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "Device close on drop failed");
            }
        }
    }
}
