//! Face and eye detection glue
//!
//! The detection algorithm itself is pluggable through [`Detector`]. This
//! module runs faces first, then eyes inside each face crop, and hands the
//! nested results to the overlay painter.

pub mod overlay;

use std::path::Path;
use std::sync::Arc;

use image::{imageops, GrayImage};
use tracing::{info, warn};

use crate::display::RgbaView;
use crate::error::DetectorError;
use crate::{DetectParams, ScanConfig};

pub use overlay::OverlayCount;

/// Axis-aligned detection box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (i32, i32) {
        (
            (self.x + self.width / 2) as i32,
            (self.y + self.height / 2) as i32,
        )
    }

    /// Intersect with a `width`x`height` image, `None` when nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        (w > 0 && h > 0).then(|| Region::new(self.x, self.y, w, h))
    }

    fn offset(&self, by: &Region) -> Region {
        Region::new(self.x + by.x, self.y + by.y, self.width, self.height)
    }
}

/// Region detector over single-channel images. Stateless between calls.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &GrayImage, params: &DetectParams) -> Vec<Region>;
}

/// Detects nothing. Stands in when a model could not be loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&self, _image: &GrayImage, _params: &DetectParams) -> Vec<Region> {
        Vec::new()
    }
}

/// A face and the eyes found inside it, both in frame coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceDetection {
    pub face: Region,
    pub eyes: Vec<Region>,
}

/// Result of one detection pass over a frame.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub faces: Vec<FaceDetection>,
    pub overlays: OverlayCount,
}

#[derive(Clone)]
pub struct Detectors {
    face: Arc<dyn Detector>,
    eyes: Arc<dyn Detector>,
}

impl Detectors {
    pub fn new(face: Arc<dyn Detector>, eyes: Arc<dyn Detector>) -> Self {
        Self { face, eyes }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopDetector), Arc::new(NoopDetector))
    }

    /// Faces in `gray`, each with the eyes detected inside its crop.
    pub fn detect_faces(&self, gray: &GrayImage, config: &ScanConfig) -> Vec<FaceDetection> {
        let (width, height) = gray.dimensions();
        self.face
            .detect(gray, &config.face)
            .iter()
            .filter_map(|face| face.clamp_to(width, height))
            .map(|face| {
                let crop =
                    imageops::crop_imm(gray, face.x, face.y, face.width, face.height).to_image();
                let eyes = self
                    .eyes
                    .detect(&crop, &config.eyes)
                    .iter()
                    .filter_map(|eye| eye.clamp_to(face.width, face.height))
                    .map(|eye| eye.offset(&face))
                    .collect();
                FaceDetection { face, eyes }
            })
            .collect()
    }
}

impl Default for Detectors {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for Detectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detectors").finish_non_exhaustive()
    }
}

/// Detect on a grayscale copy of `view`, then paint the overlays into `view`.
///
/// Overlays never reach the grayscale copy, so every detector call of the
/// pass sees the composited camera pixels only.
pub fn scan_frame(detectors: &Detectors, view: &mut RgbaView<'_>, config: &ScanConfig) -> ScanSummary {
    let gray = imageops::grayscale(&*view);
    let faces = detectors.detect_faces(&gray, config);
    let overlays = overlay::draw_detections(view, &faces);
    ScanSummary { faces, overlays }
}

/// Load a detector model, falling back to [`NoopDetector`] on failure.
///
/// Failure is logged and never stops the pipeline from starting.
pub fn load_or_disabled<F>(label: &str, path: Option<&Path>, load: F) -> Arc<dyn Detector>
where
    F: FnOnce(&Path) -> Result<Arc<dyn Detector>, DetectorError>,
{
    let result = match path {
        Some(path) => load(path),
        None => Err(DetectorError::NotConfigured),
    };
    match result {
        Ok(detector) => {
            info!(label, "Detector loaded");
            detector
        }
        Err(e) => {
            warn!(label, error = %e, "Detector unavailable, detections disabled");
            Arc::new(NoopDetector)
        }
    }
}
