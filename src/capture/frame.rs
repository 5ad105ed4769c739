use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decoded camera image owned by a frame source pool.
///
/// Not `Clone`: the controller borrows one frame at a time and hands the very
/// same value back through `FrameSource::release_frame`.
pub struct Frame {
    /// Pixel payload, shared with the producer without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Pixels per row of the first plane. Rows may be padded past `width`.
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    /// 32-bit R, G, B, padding. The only display buffer format.
    Rgbx8888,
    Yuyv4,
    Mjpeg,
    Nv12,
    /// Planar 4:2:0, Y then U then V.
    Yuv420,
}

impl Frame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl PixelFormat {
    /// Bytes needed for a `width`x`height` image whose first plane has `stride` pixels per row.
    ///
    /// `None` for compressed formats.
    pub fn required_len(self, stride: u32, height: u32) -> Option<usize> {
        let stride = stride as usize;
        let height = height as usize;
        let chroma_rows = height.div_ceil(2);
        match self {
            PixelFormat::Rgb24 => Some(stride * height * 3),
            PixelFormat::Rgbx8888 => Some(stride * height * 4),
            PixelFormat::Yuyv4 => Some(stride * height * 2),
            PixelFormat::Nv12 => Some(stride * height + stride * chroma_rows),
            PixelFormat::Yuv420 => Some(stride * height + 2 * stride.div_ceil(2) * chroma_rows),
            PixelFormat::Mjpeg => None,
        }
    }
}
