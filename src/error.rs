//! Error types shared across the pipeline

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::capture::{CameraSide, PixelFormat};

/// Errors raised by capture sessions and their backends.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no {0} camera available")]
    NoCamera(CameraSide),
    #[error("camera device error: {0}")]
    Device(#[from] std::io::Error),
    #[error("camera offers no usable pixel format")]
    NoUsableFormat,
    #[error("camera did not start streaming within {0:?}")]
    StartTimeout(Duration),
    #[error("capture session already delivering frames")]
    AlreadyDelivering,
    #[error("capture thread exited before streaming")]
    Closed,
}

/// Errors raised by a presentation surface.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("surface buffers are not configured")]
    NotConfigured,
    #[error("surface buffer format {0:?} is not supported")]
    UnsupportedFormat(PixelFormat),
    #[error("surface lock not acquired within {0:?}")]
    LockTimeout(Duration),
}

/// Errors raised while converting a frame into a display buffer.
#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("cannot composite {0:?} frames")]
    UnsupportedFormat(PixelFormat),
    #[error("{format:?} frame {width} pixels wide does not fit a {stride} pixel stride")]
    BadGeometry {
        format: PixelFormat,
        width: u32,
        stride: u32,
    },
    #[error("frame holds {actual} bytes, {expected} required")]
    ShortFrame { expected: usize, actual: usize },
    #[error("display buffer holds {actual} bytes, {expected} required")]
    ShortBuffer { expected: usize, actual: usize },
}

/// Fatal camera setup errors. Surfaced to the caller and never retried.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("no presentation surface attached")]
    NoSurface,
    #[error("presentation surface has invalid size {width}x{height}")]
    InvalidSurface { width: u32, height: u32 },
    #[error("could not find a supported resolution for a {width}x{height} surface")]
    NoSupportedResolution { width: u32, height: u32 },
    #[error("failed to open {side} camera")]
    Session {
        side: CameraSide,
        #[source]
        source: CaptureError,
    },
    #[error("failed to configure surface buffers")]
    Surface(#[from] SurfaceError),
    #[error("camera rejected the capture target")]
    Delivery(#[source] CaptureError),
    #[error("pipeline is running, shut it down before reconfiguring")]
    Busy,
}

/// Errors raised by the controller's control surface.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("camera is not set up")]
    NotReady,
    #[error("pipeline worker already running")]
    AlreadyRunning,
    #[error("failed to spawn pipeline worker")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Setup(#[from] SetupError),
}

/// Errors raised while loading a detector model.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("no model configured")]
    NotConfigured,
    #[error("failed to read model {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid model {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}
