//! Analyzer driver capability
//!
//! The instrument driver is the only piece of the system that talks to real
//! hardware. Everything above it (session, sample source, controller) depends
//! on the `AnalyzerDriver` trait alone, so any vendor SDK exposing this
//! capability set can be substituted, and tests run against `MockAnalyzer`.
//!
//! # Design Philosophy
//!
//! - Async (uses `#[async_trait]`) for calls that wait on the device
//! - Thread-safe (requires `Send + Sync`), `&self` with interior mutability
//! - `abort` and `close_device` are synchronous so teardown can run from `Drop`
//! - Errors are structured `DeviceError`s; the vendor error string travels in
//!   `DeviceError::message`

use crate::config::CaptureMode;
use crate::error::DeviceError;
use async_trait::async_trait;
use std::fmt;

/// Opaque identifier of an opened instrument.
///
/// Deliberately neither `Clone` nor `Copy`: a handle has exactly one owner and
/// is consumed by `close_device`.
#[derive(Debug, PartialEq, Eq)]
pub struct DeviceHandle(i32);

impl DeviceHandle {
    /// Wrap a driver-issued handle value.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Raw driver handle value.
    pub fn id(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Supported analyzer models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    /// SA44
    Sa44,
    /// SA44B
    Sa44B,
    /// SA124A
    Sa124A,
    /// SA124B
    Sa124B,
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceModel::Sa44 => "SA44",
            DeviceModel::Sa44B => "SA44B",
            DeviceModel::Sa124A => "SA124A",
            DeviceModel::Sa124B => "SA124B",
        };
        write!(f, "{}", name)
    }
}

/// Identity and health of an opened analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Driver API version string
    pub api_version: String,
    /// Hardware model
    pub model: DeviceModel,
    /// Factory serial number
    pub serial_number: u32,
    /// Internal temperature in degrees Celsius
    pub temperature_c: f32,
    /// USB supply voltage in volts
    pub voltage_v: f32,
}

/// IQ stream characteristics reported after arming in IQ mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    /// Filter bandwidth of the IQ stream in Hz
    pub bandwidth_hz: f64,
    /// Samples per second after decimation
    pub sample_rate: f64,
}

/// Sweep geometry reported after arming in real-time mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepInfo {
    /// Number of bins in one sweep
    pub sweep_len: usize,
    /// Frequency of the first bin in Hz
    pub start_freq_hz: f64,
    /// Frequency step between bins in Hz
    pub bin_size_hz: f64,
}

/// Real-time acquisition parameters.
///
/// The analyzer always runs real-time captures with a min/max detector on a
/// log scale and couples RBW and VBW.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RealTimeParams {
    /// Resolution bandwidth in Hz (also used as VBW)
    pub rbw_hz: f64,
    /// Vertical range of a frame in dB
    pub frame_scale_db: f64,
    /// Frames per second
    pub frame_rate: u32,
}

/// Capability: spectrum analyzer driver.
///
/// # Contract
/// - `open_device` hands out a handle that must be returned through
///   `close_device` exactly once
/// - `initiate` starts streaming in the given mode; `abort` stops it and is
///   safe to call when nothing is streaming
/// - `get_iq_data` fills `buf` with interleaved I/Q pairs (`buf.len() / 2`
///   samples) and waits until the device delivers them
/// - `get_real_time_frame` fills one sweep of `bins` plus the running
///   `max_hold` trace, both `sweep_len` long
#[async_trait]
pub trait AnalyzerDriver: Send + Sync {
    /// Driver API version
    fn api_version(&self) -> String;

    /// Open the first available analyzer
    async fn open_device(&self) -> Result<DeviceHandle, DeviceError>;

    /// Release a handle
    fn close_device(&self, handle: DeviceHandle) -> Result<(), DeviceError>;

    /// Model, serial number, temperature and voltage
    async fn device_info(&self, handle: &DeviceHandle) -> Result<DeviceInfo, DeviceError>;

    /// Set center frequency and span
    async fn configure_center_span(
        &self,
        handle: &DeviceHandle,
        center_hz: f64,
        span_hz: f64,
    ) -> Result<(), DeviceError>;

    /// Set the reference level
    async fn configure_level(&self, handle: &DeviceHandle, ref_dbm: f64)
        -> Result<(), DeviceError>;

    /// Set IQ decimation and filter bandwidth
    async fn configure_iq(
        &self,
        handle: &DeviceHandle,
        decimation: u32,
        bandwidth_hz: f64,
    ) -> Result<(), DeviceError>;

    /// Set real-time acquisition parameters
    async fn configure_real_time(
        &self,
        handle: &DeviceHandle,
        params: &RealTimeParams,
    ) -> Result<(), DeviceError>;

    /// Start streaming in `mode`
    async fn initiate(&self, handle: &DeviceHandle, mode: CaptureMode) -> Result<(), DeviceError>;

    /// Stop streaming
    fn abort(&self, handle: &DeviceHandle) -> Result<(), DeviceError>;

    /// IQ stream characteristics (IQ mode only)
    async fn query_stream_info(&self, handle: &DeviceHandle) -> Result<StreamInfo, DeviceError>;

    /// Sweep geometry (real-time mode only)
    async fn query_sweep_info(&self, handle: &DeviceHandle) -> Result<SweepInfo, DeviceError>;

    /// Fetch one block of interleaved IQ data
    async fn get_iq_data(&self, handle: &DeviceHandle, buf: &mut [f32])
        -> Result<(), DeviceError>;

    /// Fetch one real-time frame and the max-hold trace
    async fn get_real_time_frame(
        &self,
        handle: &DeviceHandle,
        bins: &mut [f32],
        max_hold: &mut [f32],
    ) -> Result<(), DeviceError>;
}
