//! Frame source contract between capture sessions and the controller

use std::sync::Arc;
use std::time::Duration;

use crate::capture::{Frame, PixelFormat};
use crate::display::DisplayBuffer;
use crate::error::CompositeError;

/// Producer side of a frame source, written to by a capture session.
pub trait FrameSink: Send + Sync {
    /// Format the source was created for. Sessions should deliver it when they can.
    fn format(&self) -> PixelFormat;

    fn deliver(&self, frame: Frame);
}

/// Drawable target a capture session streams into.
pub type DeliveryTarget = Arc<dyn FrameSink>;

/// Bounded pool of decoded frames between a capture session and the controller.
///
/// Every frame returned by `latest_frame` must come back through
/// `release_frame`. Dropping the source destroys it.
pub trait FrameSource: Send + Sync {
    fn drawable_target(&self) -> DeliveryTarget;

    /// Rotation in degrees applied by `composite`.
    fn set_presentation_rotation(&self, degrees: u32);

    /// Newest delivered frame, or `None` right away if nothing new arrived.
    fn latest_frame(&self) -> Option<Frame>;

    /// Convert and rotate `frame` into the locked display buffer.
    fn composite(&self, buffer: &mut DisplayBuffer<'_>, frame: &Frame)
        -> Result<(), CompositeError>;

    fn release_frame(&self, frame: Frame);

    /// Block until a delivery may have happened or `timeout` passes.
    fn wait_for_frame(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}
