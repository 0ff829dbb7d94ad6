//! Acquisition pipeline: sample source, controller and cancellation.

pub mod controller;
pub mod shutdown;
pub mod source;

pub use controller::{
    CaptureBudget, CaptureError, CaptureProgress, CaptureReport, SessionController, StopReason,
};
pub use shutdown::{cancellation, CancelHandle, CancelToken};
pub use source::{PullError, SampleSource};
