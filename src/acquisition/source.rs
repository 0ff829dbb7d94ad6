//! Sample source: turns an armed device session into a stream of records.
//!
//! `pull` yields exactly one [`SampleRecord`] per call and never waits longer
//! than the caller's timeout. In IQ mode one device round-trip fills a whole
//! block, which is then handed out sample by sample. In real-time mode frames
//! are paced by an interval at the configured frame rate, so a caller pulling
//! faster than the device produces waits instead of spinning.
//!
//! `pull` is cancel-safe: a timed-out or dropped pull leaves no half-consumed
//! block or skipped index behind.

use crate::config::CaptureMode;
use crate::error::{DeviceError, DeviceErrorKind};
use crate::hardware::{AnalyzerDriver, DeviceSession};
use crate::measurement_types::{IqSample, SampleRecord, SpectralFrame};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior};

/// Failure of a single [`SampleSource::pull`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PullError {
    /// No record arrived in time. Recoverable.
    #[error("no sample within {0:?}")]
    Timeout(Duration),
    /// The device failed. Fatal to the session.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Record producer bound to one armed [`DeviceSession`].
pub struct SampleSource<D: AnalyzerDriver> {
    session: DeviceSession<D>,
    mode: CaptureMode,
    /// Interleaved I/Q pairs of the current block
    iq_block: Vec<f32>,
    iq_valid: usize,
    iq_pos: usize,
    sweep_len: usize,
    frame_clock: Option<Interval>,
    next_index: u64,
}

impl<D: AnalyzerDriver> SampleSource<D> {
    /// Wrap an armed session.
    ///
    /// Queries the stream or sweep geometry once and logs it. `iq_block_size`
    /// is the number of IQ samples fetched per device call.
    pub async fn new(session: DeviceSession<D>, iq_block_size: usize) -> Result<Self, DeviceError> {
        let Some(mode) = session.armed_mode() else {
            return Err(DeviceError::invalid_state(
                "start sampling",
                session.state(),
            ));
        };

        let mut source = Self {
            session,
            mode,
            iq_block: Vec::new(),
            iq_valid: 0,
            iq_pos: 0,
            sweep_len: 0,
            frame_clock: None,
            next_index: 0,
        };

        match mode {
            CaptureMode::Iq => {
                let info = source.session.stream_info().await?;
                tracing::info!(
                    bandwidth_hz = info.bandwidth_hz,
                    sample_rate = info.sample_rate,
                    block_size = iq_block_size,
                    "IQ stream ready"
                );
                source.iq_block = vec![0.0; iq_block_size.max(1) * 2];
            }
            CaptureMode::RealTime => {
                let sweep = source.session.sweep_info().await?;
                if sweep.sweep_len == 0 {
                    return Err(DeviceError::new(
                        DeviceErrorKind::DriverFault,
                        "device reported an empty sweep",
                    ));
                }
                let frame_rate = source
                    .session
                    .config()
                    .map(|c| c.frame_rate)
                    .unwrap_or(1)
                    .max(1);
                tracing::info!(
                    sweep_len = sweep.sweep_len,
                    start_freq_hz = sweep.start_freq_hz,
                    bin_size_hz = sweep.bin_size_hz,
                    frame_rate,
                    "Real-time sweep ready"
                );
                let mut clock =
                    tokio::time::interval(Duration::from_secs(1) / frame_rate);
                clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
                source.sweep_len = sweep.sweep_len;
                source.frame_clock = Some(clock);
            }
        }

        Ok(source)
    }

    /// Records yielded so far.
    pub fn records_yielded(&self) -> u64 {
        self.next_index
    }

    /// Pull the next record, waiting at most `timeout`.
    pub async fn pull(&mut self, timeout: Duration) -> Result<SampleRecord, PullError> {
        match tokio::time::timeout(timeout, self.next_record()).await {
            Ok(result) => result.map_err(PullError::from),
            Err(_) => Err(PullError::Timeout(timeout)),
        }
    }

    /// Give the session back, e.g. for teardown.
    pub fn into_session(self) -> DeviceSession<D> {
        self.session
    }

    async fn next_record(&mut self) -> Result<SampleRecord, DeviceError> {
        match self.mode {
            CaptureMode::Iq => self.next_iq().await.map(SampleRecord::Iq),
            CaptureMode::RealTime => self.next_frame().await.map(SampleRecord::Frame),
        }
    }

    async fn next_iq(&mut self) -> Result<IqSample, DeviceError> {
        if self.iq_pos >= self.iq_valid {
            // Invalidate first: a cancelled fetch must not expose a stale block
            self.iq_valid = 0;
            self.iq_pos = 0;
            self.session.fetch_iq(&mut self.iq_block).await?;
            self.iq_valid = self.iq_block.len() / 2;
        }

        let offset = self.iq_pos * 2;
        let sample = IqSample {
            i: self.iq_block[offset],
            q: self.iq_block[offset + 1],
            index: self.next_index,
        };
        self.iq_pos += 1;
        self.next_index += 1;
        Ok(sample)
    }

    async fn next_frame(&mut self) -> Result<SpectralFrame, DeviceError> {
        if let Some(clock) = self.frame_clock.as_mut() {
            clock.tick().await;
        }

        let mut bins = vec![0.0; self.sweep_len];
        let mut max_hold = vec![0.0; self.sweep_len];
        self.session.fetch_frame(&mut bins, &mut max_hold).await?;

        let frame = SpectralFrame {
            bins,
            max_hold,
            frame_index: self.next_index,
        };
        self.next_index += 1;
        Ok(frame)
    }
}
