//! Overlay painting for detection results

use image::Rgba;
use imageproc::drawing::{draw_hollow_circle_mut, draw_hollow_ellipse_mut};

use crate::detect::FaceDetection;
use crate::display::RgbaView;

pub const FACE_COLOR: Rgba<u8> = Rgba([255, 0, 255, 255]);
pub const EYE_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
/// Stroke width of every overlay, in pixels.
pub const STROKE: i32 = 4;

/// Shapes drawn by one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayCount {
    pub ellipses: usize,
    pub circles: usize,
}

/// Ellipse around every face, circle around every eye.
pub fn draw_detections(view: &mut RgbaView<'_>, faces: &[FaceDetection]) -> OverlayCount {
    let mut count = OverlayCount::default();
    for detection in faces {
        let face = &detection.face;
        let center = face.center();
        let rx = (face.width / 2) as i32;
        let ry = (face.height / 2) as i32;
        for offset in stroke_offsets() {
            let (rx, ry) = (rx + offset, ry + offset);
            if rx > 0 && ry > 0 {
                draw_hollow_ellipse_mut(view, center, rx, ry, FACE_COLOR);
            }
        }
        count.ellipses += 1;

        for eye in &detection.eyes {
            let radius = ((eye.width + eye.height) as f32 * 0.25).round() as i32;
            for offset in stroke_offsets() {
                let r = radius + offset;
                if r > 0 {
                    draw_hollow_circle_mut(view, eye.center(), r, EYE_COLOR);
                }
            }
            count.circles += 1;
        }
    }
    count
}

fn stroke_offsets() -> impl Iterator<Item = i32> {
    let half = STROKE / 2;
    (1 - half)..=half
}
