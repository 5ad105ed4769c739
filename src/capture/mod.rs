//! Camera-facing side of the pipeline: sessions, frames, pixel conversion

pub mod decoder;
pub mod frame;
pub mod v4l2;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;
use crate::pipeline::{DeliveryTarget, FrameSource};

pub use frame::Frame;
pub use frame::FrameMetadata;
pub use frame::PixelFormat;
pub use v4l2::{V4l2Backend, V4l2Session};

/// Which physical camera a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraSide {
    Front,
    Back,
}

impl CameraSide {
    pub fn flipped(self) -> Self {
        match self {
            CameraSide::Front => CameraSide::Back,
            CameraSide::Back => CameraSide::Front,
        }
    }
}

impl fmt::Display for CameraSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CameraSide::Front => "front",
            CameraSide::Back => "back",
        })
    }
}

/// Capture resolution agreed between the session and the frame source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewRequest {
    pub width: u32,
    pub height: u32,
}

impl ViewRequest {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Long edge over short edge, independent of orientation.
    fn landscape_ratio(&self) -> f64 {
        let long = self.width.max(self.height) as f64;
        let short = self.width.min(self.height) as f64;
        long / short
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Allowed relative difference between surface and capture aspect ratios.
pub const ASPECT_TOLERANCE: f64 = 0.01;

/// Pick the largest supported resolution with the surface's aspect ratio.
///
/// Orientation is ignored when comparing, since sensors are usually mounted
/// rotated relative to the display. The winner is returned as the session
/// reported it.
pub fn negotiate_view(
    supported: &[ViewRequest],
    surface_width: u32,
    surface_height: u32,
) -> Option<ViewRequest> {
    let surface = ViewRequest::new(surface_width, surface_height);
    if surface.is_empty() {
        return None;
    }
    let target = surface.landscape_ratio();

    supported
        .iter()
        .filter(|size| !size.is_empty())
        .filter(|size| ((size.landscape_ratio() - target) / target).abs() <= ASPECT_TOLERANCE)
        .max_by_key(|size| size.area())
        .copied()
}

/// Hardware-facing camera connection. Dropping it closes the camera.
pub trait CaptureSession: Send {
    /// Resolution to capture at for a surface of the given size.
    fn match_capture_size(&self, surface_width: u32, surface_height: u32) -> Option<ViewRequest>;

    /// Sensor mounting orientation in degrees, clockwise.
    fn orientation(&self) -> u32;

    /// Number of cameras on the device.
    fn camera_count(&self) -> usize;

    /// Start streaming decoded frames into `target`.
    fn begin_delivery(&mut self, target: DeliveryTarget) -> Result<(), CaptureError>;
}

/// Factory for the two collaborators the controller rebuilds on every camera switch.
pub trait CameraBackend: Send + Sync + 'static {
    type Session: CaptureSession + 'static;
    type Source: FrameSource + 'static;

    fn open_session(&self, side: CameraSide) -> Result<Self::Session, CaptureError>;

    fn create_frame_source(&self, view: ViewRequest, format: PixelFormat) -> Self::Source;
}
