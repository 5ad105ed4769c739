//! Presentation side: the compositor-owned surface and the preview window

pub mod display;
pub mod surface;

use std::time::Duration;

use image::{ImageBuffer, Rgba};

use crate::capture::PixelFormat;
use crate::error::SurfaceError;

pub use display::{PreviewCommand, Sdl2Display};
pub use surface::{FrameSurface, PresentedFrame};

/// Zero-copy color view over a locked display buffer. Its width is the buffer stride.
pub type RgbaView<'a> = ImageBuffer<Rgba<u8>, &'a mut [u8]>;

/// Drawable target shared with the compositor.
///
/// Every `acquire` must be paired with a `release`; every successful `lock`
/// ends in either `unlock_and_post` or a drop of the lock.
pub trait PresentationSurface: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Size and format of the buffers handed out by `lock`.
    fn set_buffers_geometry(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(), SurfaceError>;

    fn acquire(&self);

    fn release(&self);

    /// Lock the next buffer, giving up after `timeout`.
    fn lock(&self, timeout: Duration) -> Result<Box<dyn LockedBuffer + '_>, SurfaceError>;
}

/// A buffer locked for the current frame. Dropping it unlocks without presenting.
pub trait LockedBuffer {
    fn buffer(&mut self) -> DisplayBuffer<'_>;

    fn unlock_and_post(self: Box<Self>);
}

/// Writable pixels of one locked surface buffer.
#[derive(Debug)]
pub struct DisplayBuffer<'a> {
    pub width: u32,
    pub height: u32,
    /// Pixels per row; rows may be padded past `width`.
    pub stride: u32,
    pub format: PixelFormat,
    pub bits: &'a mut [u8],
}

impl DisplayBuffer<'_> {
    pub fn byte_len(&self) -> usize {
        self.format
            .required_len(self.stride, self.height)
            .unwrap_or_default()
    }

    /// Wrap the pixel memory as an RGBA image of `stride` x `height`.
    ///
    /// `None` if the buffer is not 32-bit or is shorter than its geometry.
    pub fn rgba_view(&mut self) -> Option<RgbaView<'_>> {
        if self.format != PixelFormat::Rgbx8888 {
            return None;
        }
        let len = self.byte_len();
        let bits = self.bits.get_mut(..len)?;
        ImageBuffer::from_raw(self.stride, self.height, bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_spans_stride_not_width() {
        let mut bits = vec![0u8; 8 * 2 * 4];
        let mut buffer = DisplayBuffer {
            width: 5,
            height: 2,
            stride: 8,
            format: PixelFormat::Rgbx8888,
            bits: &mut bits,
        };
        let mut view = buffer.rgba_view().unwrap();
        assert_eq!(view.dimensions(), (8, 2));
        view.put_pixel(7, 1, Rgba([9, 9, 9, 9]));
        assert_eq!(&bits[60..64], &[9, 9, 9, 9]);
    }

    #[test]
    fn short_buffer_has_no_view() {
        let mut bits = vec![0u8; 10];
        let mut buffer = DisplayBuffer {
            width: 2,
            height: 2,
            stride: 2,
            format: PixelFormat::Rgbx8888,
            bits: &mut bits,
        };
        assert!(buffer.rgba_view().is_none());
    }
}
