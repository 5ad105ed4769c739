//! Pixel conversion from decoded camera frames into RGBX display buffers

use std::borrow::Cow;

use crate::capture::frame::{Frame, PixelFormat};
use crate::display::DisplayBuffer;
use crate::error::CompositeError;

/// Clockwise rotation applied while compositing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Only quarter turns are representable.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Source pixel shown at `(dx, dy)` of the rotated image.
    fn source_of(self, dx: u32, dy: u32, src_w: u32, src_h: u32) -> (u32, u32) {
        match self {
            Rotation::Deg0 => (dx, dy),
            Rotation::Deg90 => (dy, src_h - 1 - dx),
            Rotation::Deg180 => (src_w - 1 - dx, src_h - 1 - dy),
            Rotation::Deg270 => (src_w - 1 - dy, dx),
        }
    }
}

/// Narrowest row, in pixels, that holds `width` pixels of `format`.
///
/// Horizontally subsampled formats carry chroma for pixel pairs, so odd
/// widths need one pixel of padding.
fn min_stride(format: PixelFormat, width: u32) -> u32 {
    match format {
        PixelFormat::Yuyv4 | PixelFormat::Nv12 => width.next_multiple_of(2),
        _ => width,
    }
}

/// Convert a frame into tightly packed RGBX, `width * height * 4` bytes.
pub fn decode_frame(frame: &Frame) -> Result<Cow<'_, [u8]>, CompositeError> {
    let meta = &frame.meta;
    let data = &frame.data[..];
    if meta.stride < min_stride(meta.format, meta.width) {
        return Err(CompositeError::BadGeometry {
            format: meta.format,
            width: meta.width,
            stride: meta.stride,
        });
    }
    let expected = meta
        .format
        .required_len(meta.stride, meta.height)
        .ok_or(CompositeError::UnsupportedFormat(meta.format))?;
    if data.len() < expected {
        return Err(CompositeError::ShortFrame {
            expected,
            actual: data.len(),
        });
    }

    let width = meta.width as usize;
    let height = meta.height as usize;
    let stride = meta.stride as usize;

    if meta.format == PixelFormat::Rgbx8888 && stride == width {
        return Ok(Cow::Borrowed(&data[..width * height * 4]));
    }

    let mut out = vec![0u8; width * height * 4];
    match meta.format {
        PixelFormat::Rgbx8888 => {
            for y in 0..height {
                let src = &data[y * stride * 4..][..width * 4];
                out[y * width * 4..][..width * 4].copy_from_slice(src);
            }
        }
        PixelFormat::Rgb24 => {
            for y in 0..height {
                let src = &data[y * stride * 3..][..width * 3];
                let dst = &mut out[y * width * 4..][..width * 4];
                for (px, rgb) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                    px.copy_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
                }
            }
        }
        PixelFormat::Yuyv4 => {
            for y in 0..height {
                let row = &data[y * stride * 2..];
                for x in 0..width {
                    let pair = &row[(x / 2) * 4..][..4];
                    let luma = if x % 2 == 0 { pair[0] } else { pair[2] };
                    put(&mut out, y * width + x, yuv_to_rgb(luma, pair[1], pair[3]));
                }
            }
        }
        PixelFormat::Nv12 => {
            let chroma = &data[stride * height..];
            for y in 0..height {
                for x in 0..width {
                    let uv = (y / 2) * stride + (x / 2) * 2;
                    let luma = data[y * stride + x];
                    put(&mut out, y * width + x, yuv_to_rgb(luma, chroma[uv], chroma[uv + 1]));
                }
            }
        }
        PixelFormat::Yuv420 => {
            let chroma_stride = stride.div_ceil(2);
            let plane = chroma_stride * height.div_ceil(2);
            let u_plane = &data[stride * height..];
            let v_plane = &u_plane[plane..];
            for y in 0..height {
                for x in 0..width {
                    let c = (y / 2) * chroma_stride + x / 2;
                    let luma = data[y * stride + x];
                    put(&mut out, y * width + x, yuv_to_rgb(luma, u_plane[c], v_plane[c]));
                }
            }
        }
        PixelFormat::Mjpeg => return Err(CompositeError::UnsupportedFormat(meta.format)),
    }
    Ok(Cow::Owned(out))
}

/// Convert `frame`, rotate it and write it into the top-left of `buffer`.
///
/// Whatever does not fit the buffer is cropped; uncovered pixels keep their
/// previous content.
pub fn composite_rotated(
    frame: &Frame,
    rotation: Rotation,
    buffer: &mut DisplayBuffer<'_>,
) -> Result<(), CompositeError> {
    if buffer.format != PixelFormat::Rgbx8888 {
        return Err(CompositeError::UnsupportedFormat(buffer.format));
    }
    let needed = buffer.byte_len();
    if buffer.bits.len() < needed {
        return Err(CompositeError::ShortBuffer {
            expected: needed,
            actual: buffer.bits.len(),
        });
    }

    let rgbx = decode_frame(frame)?;
    let (src_w, src_h) = (frame.meta.width, frame.meta.height);
    let (rot_w, rot_h) = if rotation.swaps_axes() {
        (src_h, src_w)
    } else {
        (src_w, src_h)
    };
    let out_w = rot_w.min(buffer.width);
    let out_h = rot_h.min(buffer.height);
    let stride = buffer.stride as usize;

    for dy in 0..out_h {
        let row = &mut buffer.bits[dy as usize * stride * 4..];
        for dx in 0..out_w {
            let (sx, sy) = rotation.source_of(dx, dy, src_w, src_h);
            let src = (sy as usize * src_w as usize + sx as usize) * 4;
            row[dx as usize * 4..][..4].copy_from_slice(&rgbx[src..src + 4]);
        }
    }
    Ok(())
}

fn put(out: &mut [u8], pixel: usize, rgb: [u8; 3]) {
    out[pixel * 4..][..4].copy_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
}

/// Full-range BT.601 in 8.8 fixed point.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;
    let r = y + ((359 * v) >> 8);
    let g = y - ((88 * u + 183 * v) >> 8);
    let b = y + ((454 * u) >> 8);
    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
