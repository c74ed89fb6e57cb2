//! Frame production and hand-off.
//!
//! - `lifecycle`: owns the capture source and recovers it on failure.
//! - `transform`: resize / annotate / encode stages.
//! - `relay`: latest-wins slot between the producer and stream sessions.
//! - `watchdog`: idle detection and wake-up for capture suspension.
//! - `worker`: the capture thread tying the above together.

pub mod lifecycle;
pub mod relay;
pub mod transform;
pub mod watchdog;
pub mod worker;

pub use lifecycle::{CameraLifecycleManager, HandleState, LifecycleMonitor, LifecycleState};
pub use relay::FrameRelay;
pub use transform::{FrameTransform, TransformPipeline};
pub use watchdog::{Activity, IdleWatchdog};
pub use worker::{CaptureWorker, WorkerExit, WorkerSettings};
