//! Analyzer Hardware Layer
//!
//! - [`capabilities`]: the `AnalyzerDriver` trait every vendor SDK binding implements
//! - [`session`]: `DeviceSession`, the owning state machine around one handle
//! - [`mock`]: `MockAnalyzer`, a simulated device for tests and dry runs

pub mod capabilities;
pub mod mock;
pub mod session;

pub use capabilities::{
    AnalyzerDriver, DeviceHandle, DeviceInfo, DeviceModel, RealTimeParams, StreamInfo, SweepInfo,
};
pub use mock::{FaultScenario, MockAnalyzer, MockCounters};
pub use session::{DeviceSession, SessionState};
