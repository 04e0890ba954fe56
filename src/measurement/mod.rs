//! Demodulator characterization: sweep, result processing and task control.
//!
//! - [`sweep`]: drives the instruments over the LO × RF-offset grid
//! - [`result`]: derives conversion loss and curves from raw points
//! - [`adjustment`]: position-indexed correction templates
//! - [`expected`]: randomized expected-value table
//! - [`controller`]: connect/check/measure orchestration
//! - [`task`]: single background worker with completion notices

pub mod adjustment;
pub mod cancel;
pub mod controller;
pub mod expected;
pub mod point;
pub mod result;
pub mod sweep;
pub mod task;

pub use adjustment::{Adjustment, AdjustmentRecord, AdjustmentStore};
pub use cancel::CancelToken;
pub use controller::{InstrumentController, MeasureEvent};
pub use expected::{ExpectedCell, ExpectedRow, SourceTable};
pub use point::{Curve, ProcessedPoint, RawPoint, SweepPoint};
pub use result::MeasureResult;
pub use sweep::{PointSink, SettlingPolicy, SweepEngine, SweepPlan};
pub use task::{MeasureWorker, TaskCompletion, TaskKind, TaskOutcome};
