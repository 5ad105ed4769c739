//! Frame pipeline: frame sources, shared state and the controller driving them

pub mod controller;
pub mod frame_queue;
pub mod source;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{PipelineController, PipelineObserver};
pub use frame_queue::{FrameQueue, QueueStats};
pub use source::{DeliveryTarget, FrameSink, FrameSource};
pub use state::{PipelinePhase, PipelineState, ScanWindow, StopRequest};
