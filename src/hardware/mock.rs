//! Mock Analyzer
//!
//! Simulated spectrum analyzer for testing without physical hardware.
//! All waits use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Behaviour
//!
//! - IQ mode: deterministic ramp, sample `k` since the last `initiate` is
//!   `(i, q) = (k, -k)`
//! - Real-time mode: a noise floor around a single tone in the middle bin,
//!   with a running max-hold trace reset on every `initiate`
//! - Configurable per-fetch latency
//! - Fault injection through [`FaultScenario`]
//! - Teardown counters ([`MockCounters`]) so tests can assert every
//!   open/arm was matched by a close/abort

use crate::config::CaptureMode;
use crate::error::{DeviceError, DeviceErrorKind};
use crate::hardware::capabilities::{
    AnalyzerDriver, DeviceHandle, DeviceInfo, DeviceModel, RealTimeParams, StreamInfo, SweepInfo,
};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// IQ sample rate before decimation (samples per second).
pub const IQ_BASE_SAMPLE_RATE: f64 = 486_111.111;

const MOCK_API_VERSION: &str = "3.0.21-mock";
const MAX_SWEEP_LEN: usize = 8192;

/// Injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScenario {
    /// `open_device` fails with the given kind
    OpenFails(DeviceErrorKind),
    /// Configuration calls fail with the given kind
    ConfigureFails(DeviceErrorKind),
    /// `initiate` fails with `InitiationFailed`
    InitiateFails,
    /// Stream and sweep queries fail with the given kind
    QueryFails(DeviceErrorKind),
    /// Every fetch after the first N fails with `DriverFault`
    FailAfterFetches(u64),
    /// Every fetch after the first N never completes
    StallAfterFetches(u64),
}

/// Snapshot of lifecycle call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCounters {
    /// Successful `open_device` calls
    pub opens: usize,
    /// Successful `close_device` calls
    pub closes: usize,
    /// Successful `initiate` calls
    pub initiates: usize,
    /// `abort` calls
    pub aborts: usize,
    /// Fetch calls (IQ blocks and frames), including failed ones
    pub fetches: u64,
}

struct MockState {
    open_handle: Option<i32>,
    next_handle: i32,
    center_hz: f64,
    span_hz: f64,
    ref_dbm: f64,
    iq: Option<(u32, f64)>,
    real_time: Option<RealTimeParams>,
    streaming: Option<CaptureMode>,
    iq_cursor: u64,
    max_hold: Vec<f32>,
    rng: StdRng,
}

/// Simulated analyzer implementing [`AnalyzerDriver`].
///
/// # Example
///
/// ```rust,ignore
/// let mock = Arc::new(
///     MockAnalyzer::new()
///         .with_latency(Duration::from_millis(50))
///         .with_fault(FaultScenario::StallAfterFetches(4)),
/// );
/// let session = DeviceSession::open(mock.clone()).await?;
/// ```
pub struct MockAnalyzer {
    model: DeviceModel,
    serial_number: u32,
    latency: Duration,
    faults: Vec<FaultScenario>,
    state: Mutex<MockState>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    initiates: AtomicUsize,
    aborts: AtomicUsize,
    fetches: AtomicU64,
}

impl MockAnalyzer {
    /// Healthy SA44B with no latency and a fixed noise seed.
    pub fn new() -> Self {
        Self {
            model: DeviceModel::Sa44B,
            serial_number: 16_101_234,
            latency: Duration::ZERO,
            faults: Vec::new(),
            state: Mutex::new(MockState {
                open_handle: None,
                next_handle: 0,
                center_hz: 0.0,
                span_hz: 0.0,
                ref_dbm: 0.0,
                iq: None,
                real_time: None,
                streaming: None,
                iq_cursor: 0,
                max_hold: Vec::new(),
                rng: StdRng::seed_from_u64(0x5a44),
            }),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            initiates: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Report a different hardware model.
    pub fn with_model(mut self, model: DeviceModel) -> Self {
        self.model = model;
        self
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add a fault scenario.
    pub fn with_fault(mut self, fault: FaultScenario) -> Self {
        self.faults.push(fault);
        self
    }

    /// Current lifecycle counters.
    pub fn counters(&self) -> MockCounters {
        MockCounters {
            opens: self.opens.load(Ordering::SeqCst),
            closes: self.closes.load(Ordering::SeqCst),
            initiates: self.initiates.load(Ordering::SeqCst),
            aborts: self.aborts.load(Ordering::SeqCst),
            fetches: self.fetches.load(Ordering::SeqCst),
        }
    }

    /// Whether a handle is currently outstanding.
    pub fn is_open(&self) -> bool {
        self.lock().open_handle.is_some()
    }

    /// Whether the device is streaming.
    pub fn is_streaming(&self) -> bool {
        self.lock().streaming.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked(&self, handle: &DeviceHandle) -> Result<MutexGuard<'_, MockState>, DeviceError> {
        let state = self.lock();
        if state.open_handle != Some(handle.id()) {
            return Err(DeviceError::new(
                DeviceErrorKind::DriverFault,
                format!("invalid device handle {handle}"),
            ));
        }
        Ok(state)
    }

    fn configure_fault(&self) -> Result<(), DeviceError> {
        for fault in &self.faults {
            if let FaultScenario::ConfigureFails(kind) = fault {
                return Err(DeviceError::new(*kind, "parameter rejected by device"));
            }
        }
        Ok(())
    }

    fn query_fault(&self) -> Result<(), DeviceError> {
        for fault in &self.faults {
            if let FaultScenario::QueryFails(kind) = fault {
                return Err(DeviceError::new(*kind, "device did not report its geometry"));
            }
        }
        Ok(())
    }

    /// Count the fetch, apply fetch faults and simulated latency.
    async fn before_fetch(&self) -> Result<(), DeviceError> {
        let done = self.fetches.fetch_add(1, Ordering::SeqCst);
        for fault in &self.faults {
            match *fault {
                FaultScenario::StallAfterFetches(n) if done >= n => {
                    tracing::debug!(fetch = done, "Mock analyzer stalling");
                    std::future::pending::<()>().await;
                }
                FaultScenario::FailAfterFetches(n) if done >= n => {
                    return Err(DeviceError::new(
                        DeviceErrorKind::DriverFault,
                        format!("injected failure after {n} fetches"),
                    ));
                }
                _ => {}
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep_len(span_hz: f64, rbw_hz: f64) -> usize {
    ((span_hz / rbw_hz).round() as usize).clamp(1, MAX_SWEEP_LEN)
}

#[async_trait]
impl AnalyzerDriver for MockAnalyzer {
    fn api_version(&self) -> String {
        MOCK_API_VERSION.to_string()
    }

    async fn open_device(&self) -> Result<DeviceHandle, DeviceError> {
        for fault in &self.faults {
            if let FaultScenario::OpenFails(kind) = fault {
                let message = match kind {
                    DeviceErrorKind::NotFound => "no device found",
                    DeviceErrorKind::Busy => "device already opened by another process",
                    _ => "unable to open device",
                };
                return Err(DeviceError::new(*kind, message));
            }
        }

        let mut state = self.lock();
        if state.open_handle.is_some() {
            return Err(DeviceError::new(
                DeviceErrorKind::Busy,
                "device is already open",
            ));
        }
        let id = state.next_handle;
        state.next_handle += 1;
        state.open_handle = Some(id);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceHandle::new(id))
    }

    fn close_device(&self, handle: DeviceHandle) -> Result<(), DeviceError> {
        let mut state = self.checked(&handle)?;
        state.open_handle = None;
        state.streaming = None;
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn device_info(&self, handle: &DeviceHandle) -> Result<DeviceInfo, DeviceError> {
        let mut state = self.checked(handle)?;
        let temperature_c = 34.0 + state.rng.gen_range(0.0..1.5);
        let voltage_v = 5.0 + state.rng.gen_range(0.0..0.1);
        Ok(DeviceInfo {
            api_version: self.api_version(),
            model: self.model,
            serial_number: self.serial_number,
            temperature_c,
            voltage_v,
        })
    }

    async fn configure_center_span(
        &self,
        handle: &DeviceHandle,
        center_hz: f64,
        span_hz: f64,
    ) -> Result<(), DeviceError> {
        let mut state = self.checked(handle)?;
        self.configure_fault()?;
        if !(center_hz > 0.0 && span_hz > 0.0) {
            return Err(DeviceError::new(
                DeviceErrorKind::InvalidParameter,
                format!("center {center_hz} Hz / span {span_hz} Hz out of range"),
            ));
        }
        state.center_hz = center_hz;
        state.span_hz = span_hz;
        Ok(())
    }

    async fn configure_level(&self, handle: &DeviceHandle, ref_dbm: f64) -> Result<(), DeviceError> {
        let mut state = self.checked(handle)?;
        self.configure_fault()?;
        state.ref_dbm = ref_dbm;
        Ok(())
    }

    async fn configure_iq(
        &self,
        handle: &DeviceHandle,
        decimation: u32,
        bandwidth_hz: f64,
    ) -> Result<(), DeviceError> {
        let mut state = self.checked(handle)?;
        self.configure_fault()?;
        if !decimation.is_power_of_two() || decimation > 128 {
            return Err(DeviceError::new(
                DeviceErrorKind::InvalidParameter,
                format!("decimation {decimation} is not a power of two in 1..=128"),
            ));
        }
        state.iq = Some((decimation, bandwidth_hz));
        Ok(())
    }

    async fn configure_real_time(
        &self,
        handle: &DeviceHandle,
        params: &RealTimeParams,
    ) -> Result<(), DeviceError> {
        let mut state = self.checked(handle)?;
        self.configure_fault()?;
        if params.frame_rate == 0 || params.rbw_hz <= 0.0 {
            return Err(DeviceError::new(
                DeviceErrorKind::InvalidParameter,
                "frame rate and RBW must be positive",
            ));
        }
        state.real_time = Some(*params);
        Ok(())
    }

    async fn initiate(&self, handle: &DeviceHandle, mode: CaptureMode) -> Result<(), DeviceError> {
        let mut state = self.checked(handle)?;
        if self.faults.contains(&FaultScenario::InitiateFails) {
            return Err(DeviceError::new(
                DeviceErrorKind::InitiationFailed,
                "device failed to start streaming",
            ));
        }
        let configured = match mode {
            CaptureMode::Iq => state.iq.is_some(),
            CaptureMode::RealTime => state.real_time.is_some(),
        };
        if !configured {
            return Err(DeviceError::new(
                DeviceErrorKind::UnsupportedMode,
                format!("{mode} mode was not configured"),
            ));
        }

        state.streaming = Some(mode);
        state.iq_cursor = 0;
        state.max_hold.clear();
        self.initiates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self, handle: &DeviceHandle) -> Result<(), DeviceError> {
        let mut state = self.checked(handle)?;
        state.streaming = None;
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_stream_info(&self, handle: &DeviceHandle) -> Result<StreamInfo, DeviceError> {
        let state = self.checked(handle)?;
        self.query_fault()?;
        match (state.streaming, state.iq) {
            (Some(CaptureMode::Iq), Some((decimation, bandwidth_hz))) => Ok(StreamInfo {
                bandwidth_hz,
                sample_rate: IQ_BASE_SAMPLE_RATE / f64::from(decimation),
            }),
            _ => Err(DeviceError::new(
                DeviceErrorKind::InvalidState,
                "device is not streaming IQ data",
            )),
        }
    }

    async fn query_sweep_info(&self, handle: &DeviceHandle) -> Result<SweepInfo, DeviceError> {
        let state = self.checked(handle)?;
        self.query_fault()?;
        match (state.streaming, state.real_time) {
            (Some(CaptureMode::RealTime), Some(params)) => {
                let len = sweep_len(state.span_hz, params.rbw_hz);
                Ok(SweepInfo {
                    sweep_len: len,
                    start_freq_hz: state.center_hz - state.span_hz / 2.0,
                    bin_size_hz: state.span_hz / len as f64,
                })
            }
            _ => Err(DeviceError::new(
                DeviceErrorKind::InvalidState,
                "device is not sweeping in real-time mode",
            )),
        }
    }

    async fn get_iq_data(&self, handle: &DeviceHandle, buf: &mut [f32]) -> Result<(), DeviceError> {
        drop(self.checked(handle)?);
        self.before_fetch().await?;

        let mut state = self.checked(handle)?;
        if state.streaming != Some(CaptureMode::Iq) {
            return Err(DeviceError::new(
                DeviceErrorKind::InvalidState,
                "device is not streaming IQ data",
            ));
        }
        for pair in buf.chunks_exact_mut(2) {
            let k = state.iq_cursor as f32;
            pair[0] = k;
            pair[1] = 0.0 - k;
            state.iq_cursor += 1;
        }
        Ok(())
    }

    async fn get_real_time_frame(
        &self,
        handle: &DeviceHandle,
        bins: &mut [f32],
        max_hold: &mut [f32],
    ) -> Result<(), DeviceError> {
        drop(self.checked(handle)?);
        self.before_fetch().await?;

        let mut state = self.checked(handle)?;
        let params = match (state.streaming, state.real_time) {
            (Some(CaptureMode::RealTime), Some(params)) => params,
            _ => {
                return Err(DeviceError::new(
                    DeviceErrorKind::InvalidState,
                    "device is not sweeping in real-time mode",
                ))
            }
        };
        let len = sweep_len(state.span_hz, params.rbw_hz);
        if bins.len() != len || max_hold.len() != len {
            return Err(DeviceError::new(
                DeviceErrorKind::InvalidParameter,
                format!("frame buffers must hold {len} bins"),
            ));
        }

        let floor = (state.ref_dbm - params.frame_scale_db * 0.8) as f32;
        let tone = (state.ref_dbm - 20.0) as f32;
        let center = len / 2;
        let state = &mut *state;
        if state.max_hold.len() != len {
            state.max_hold = vec![f32::NEG_INFINITY; len];
        }
        for (j, bin) in bins.iter_mut().enumerate() {
            let level = if j == center { tone } else { floor };
            *bin = level + state.rng.gen_range(-3.0f32..3.0);
            state.max_hold[j] = state.max_hold[j].max(*bin);
        }
        max_hold.copy_from_slice(&state.max_hold);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::hardware::session::DeviceSession;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_iq_ramp_continues_across_blocks() {
        let mock = Arc::new(MockAnalyzer::new());
        let mut session = DeviceSession::open(mock.clone()).await.unwrap();
        session.configure(&AcquisitionConfig::default()).await.unwrap();
        session.arm(CaptureMode::Iq).await.unwrap();

        let mut buf = [0.0f32; 6];
        session.fetch_iq(&mut buf).await.unwrap();
        assert_eq!(buf, [0.0, -0.0, 1.0, -1.0, 2.0, -2.0]);
        session.fetch_iq(&mut buf).await.unwrap();
        assert_eq!(buf[0], 3.0);

        let info = session.stream_info().await.unwrap();
        assert_eq!(info.sample_rate, IQ_BASE_SAMPLE_RATE / 4.0);
        assert_eq!(mock.counters().fetches, 2);
    }

    #[tokio::test]
    async fn test_real_time_max_hold_is_running_maximum() {
        let mock = Arc::new(MockAnalyzer::new());
        let mut session = DeviceSession::open(mock).await.unwrap();
        let config = AcquisitionConfig {
            mode: CaptureMode::RealTime,
            ..Default::default()
        };
        session.configure(&config).await.unwrap();
        session.arm(CaptureMode::RealTime).await.unwrap();

        let sweep = session.sweep_info().await.unwrap();
        assert_eq!(sweep.sweep_len, 200);
        assert_eq!(sweep.start_freq_hz, 2.45e9 - 100e3);

        let mut bins = vec![0.0; sweep.sweep_len];
        let mut hold = vec![0.0; sweep.sweep_len];
        let mut previous = vec![f32::NEG_INFINITY; sweep.sweep_len];
        for _ in 0..5 {
            session.fetch_frame(&mut bins, &mut hold).await.unwrap();
            for j in 0..bins.len() {
                assert!(hold[j] >= bins[j]);
                assert!(hold[j] >= previous[j]);
            }
            previous.copy_from_slice(&hold);
        }
        // The tone sits well above the floor
        assert!(bins[100] > bins[0]);
    }

    #[tokio::test]
    async fn test_open_faults() {
        let busy = MockAnalyzer::new().with_fault(FaultScenario::OpenFails(DeviceErrorKind::Busy));
        let err = busy.open_device().await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Busy);
        assert_eq!(busy.counters().opens, 0);

        let healthy = MockAnalyzer::new();
        let _handle = healthy.open_device().await.unwrap();
        let err = healthy.open_device().await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::Busy);
    }

    #[tokio::test]
    async fn test_fail_after_fetches() {
        let mock = Arc::new(MockAnalyzer::new().with_fault(FaultScenario::FailAfterFetches(1)));
        let mut session = DeviceSession::open(mock).await.unwrap();
        session.configure(&AcquisitionConfig::default()).await.unwrap();
        session.arm(CaptureMode::Iq).await.unwrap();

        let mut buf = [0.0f32; 2];
        session.fetch_iq(&mut buf).await.unwrap();
        let err = session.fetch_iq(&mut buf).await.unwrap_err();
        assert_eq!(err.kind, DeviceErrorKind::DriverFault);
    }

    #[tokio::test]
    async fn test_stall_after_fetches_never_completes() {
        let mock = Arc::new(MockAnalyzer::new().with_fault(FaultScenario::StallAfterFetches(0)));
        let mut session = DeviceSession::open(mock).await.unwrap();
        session.configure(&AcquisitionConfig::default()).await.unwrap();
        session.arm(CaptureMode::Iq).await.unwrap();

        let mut buf = [0.0f32; 2];
        let result =
            tokio::time::timeout(Duration::from_millis(50), session.fetch_iq(&mut buf)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_device_info() {
        let mock = Arc::new(MockAnalyzer::new().with_model(DeviceModel::Sa124B));
        let session = DeviceSession::open(mock).await.unwrap();
        let info = session.device_info().await.unwrap();
        assert_eq!(info.model, DeviceModel::Sa124B);
        assert_eq!(info.model.to_string(), "SA124B");
        assert_eq!(info.api_version, MOCK_API_VERSION);
        assert!(info.temperature_c > 30.0);
    }
}
