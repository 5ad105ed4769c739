//! In-memory presentation surface
//!
//! Plays the role of the compositor window: the pipeline locks its buffer,
//! draws into it, and posting hands a copy of the pixels to whoever renders
//! them (the SDL2 preview window in the binary).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::capture::PixelFormat;
use crate::display::{DisplayBuffer, LockedBuffer, PresentationSurface};
use crate::error::SurfaceError;

/// Row alignment of surface buffers, in pixels.
pub const STRIDE_ALIGNMENT: u32 = 16;

/// One posted buffer, RGBX rows of `stride` pixels.
#[derive(Debug, Clone)]
pub struct PresentedFrame {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
}

#[derive(Default)]
struct BackBuffer {
    geometry: Option<Geometry>,
    pixels: Vec<u8>,
}

pub struct FrameSurface {
    width: u32,
    height: u32,
    back: Mutex<BackBuffer>,
    refs: AtomicUsize,
    posted: AtomicU64,
    dropped: AtomicU64,
    tx: Sender<PresentedFrame>,
}

impl FrameSurface {
    /// Create a `width`x`height` surface and the receiving end of its posted frames.
    ///
    /// When the receiver falls `queue_depth` frames behind, newer posts are dropped.
    pub fn new(width: u32, height: u32, queue_depth: usize) -> (Self, Receiver<PresentedFrame>) {
        let (tx, rx) = flume::bounded(queue_depth.max(1));
        let surface = Self {
            width,
            height,
            back: Mutex::new(BackBuffer::default()),
            refs: AtomicUsize::new(0),
            posted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            tx,
        };
        (surface, rx)
    }

    /// References acquired and not yet released.
    pub fn outstanding_refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Posts the receiver was too slow for.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured `(width, height)` of the buffers, if any.
    pub fn buffers_geometry(&self) -> Option<(u32, u32)> {
        self.back.lock().geometry.map(|g| (g.width, g.height))
    }
}

impl PresentationSurface for FrameSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn set_buffers_geometry(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(), SurfaceError> {
        if format != PixelFormat::Rgbx8888 {
            return Err(SurfaceError::UnsupportedFormat(format));
        }
        let stride = width.next_multiple_of(STRIDE_ALIGNMENT);
        let len = format.required_len(stride, height).unwrap_or_default();

        let mut back = self.back.lock();
        back.geometry = Some(Geometry {
            width,
            height,
            stride,
            format,
        });
        back.pixels.clear();
        back.pixels.resize(len, 0);
        debug!(width, height, stride, "Surface buffers configured");
        Ok(())
    }

    fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn lock(&self, timeout: Duration) -> Result<Box<dyn LockedBuffer + '_>, SurfaceError> {
        let guard = self
            .back
            .try_lock_for(timeout)
            .ok_or(SurfaceError::LockTimeout(timeout))?;
        let geometry = guard.geometry.ok_or(SurfaceError::NotConfigured)?;
        Ok(Box::new(SurfaceLock {
            surface: self,
            guard,
            geometry,
        }))
    }
}

struct SurfaceLock<'a> {
    surface: &'a FrameSurface,
    guard: MutexGuard<'a, BackBuffer>,
    geometry: Geometry,
}

impl LockedBuffer for SurfaceLock<'_> {
    fn buffer(&mut self) -> DisplayBuffer<'_> {
        DisplayBuffer {
            width: self.geometry.width,
            height: self.geometry.height,
            stride: self.geometry.stride,
            format: self.geometry.format,
            bits: &mut self.guard.pixels,
        }
    }

    fn unlock_and_post(self: Box<Self>) {
        let SurfaceLock {
            surface,
            guard,
            geometry,
        } = *self;
        let sequence = surface.posted.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = PresentedFrame {
            sequence,
            width: geometry.width,
            height: geometry.height,
            stride: geometry.stride,
            data: Bytes::copy_from_slice(&guard.pixels),
        };
        drop(guard);

        match surface.tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                surface.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(sequence, "Preview behind, presented frame dropped");
            }
            // Nobody is watching; posting still counts.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
