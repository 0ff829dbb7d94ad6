//! # Spectrum DAQ Core Library
//!
//! Continuous capture from a USB spectrum analyzer into delimited text files.
//! The library owns the acquisition pipeline; the `spectrum_daq` binary is a
//! thin CLI over it.
//!
//! ## Data flow
//!
//! ```text
//! DeviceSession → SampleSource → RingBuffer → CsvRecordWriter → file
//! ```
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: `SampleSource`, the `SessionController` that runs the
//!   acquisition and persistence tasks, and cooperative cancellation.
//! - **`config`**: Figment-based `Settings` (defaults, TOML file, environment).
//! - **`data`**: the bounded `RingBuffer` and the batched, torn-row-free
//!   `CsvRecordWriter`.
//! - **`error`**: `DeviceError`, `StorageError` and the top-level `DaqError`.
//! - **`hardware`**: the `AnalyzerDriver` capability, the `DeviceSession`
//!   state machine and the simulated `MockAnalyzer`.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`measurement_types`**: `SampleRecord` and its IQ / spectral-frame variants.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod measurement_types;

pub use acquisition::{CaptureBudget, CaptureReport, SessionController};
pub use config::{CaptureMode, Settings};
pub use error::{AppResult, DaqError};
