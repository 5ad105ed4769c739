pub mod capture;
pub mod detect;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{CameraSide, Frame, PixelFormat, ViewRequest};
pub use error::{CaptureError, PipelineError, SetupError, SurfaceError};
pub use pipeline::{PipelineController, PipelinePhase};

/// Prefix for environment overrides, e.g. `FACECAM__SCAN__WINDOW_SECS=30`.
pub const ENV_PREFIX: &str = "FACECAM";

/// Length of one scan window unless configured otherwise.
pub const DEFAULT_SCAN_WINDOW_SECS: f64 = 20.0;

/// Settings of the running host. Swapped atomically when reloaded.
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Settings>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Settings::default()));

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraConfig,
    pub pipeline: PipelineConfig,
    pub scan: ScanConfig,
    pub display: DisplayConfig,
    pub v4l2: V4l2Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Side opened by the first `setup_camera`.
    pub initial_side: CameraSide,
    /// Pixel format the frame source asks sessions to deliver.
    pub decode_format: PixelFormat,
    /// Frames held by the frame source, queued and borrowed together.
    pub frame_pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Sleep while the camera is not ready yet.
    pub idle_backoff_ms: u64,
    /// Longest wait for a frame delivery signal before re-checking flags.
    pub frame_wait_ms: u64,
    /// Deadline for locking the presentation surface.
    pub lock_timeout_ms: u64,
    /// Pin the pipeline worker to this CPU core.
    pub worker_core: Option<usize>,
}

/// Detector tuning for one cascade.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    pub scale_factor: f32,
    pub min_neighbors: u32,
    /// Smallest region edge, in pixels.
    pub min_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan mode switches itself off after this much wall time.
    pub window_secs: f64,
    pub face: DetectParams,
    pub eyes: DetectParams,
    pub face_model: Option<PathBuf>,
    pub eyes_model: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    /// Presented frames buffered towards the window before dropping.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct V4l2Config {
    /// Highest `/dev/videoN` index probed.
    pub max_devices: u32,
    pub buffer_count: u32,
    /// Clockwise rotation, in degrees, that turns the back camera's frames
    /// upright. The presentation buffer is portrait, so landscape sensors
    /// need 90 or 270 to fill it instead of being cropped.
    pub back_orientation: u32,
    pub front_orientation: u32,
    /// Deadline for the device to start streaming.
    pub start_timeout_ms: u64,
    /// Deadline for one dequeue, so the capture thread can notice a stop.
    pub dequeue_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            pipeline: PipelineConfig::default(),
            scan: ScanConfig::default(),
            display: DisplayConfig::default(),
            v4l2: V4l2Config::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            initial_side: CameraSide::Back,
            decode_format: PixelFormat::Yuv420,
            frame_pool_size: 4,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_backoff_ms: 5,
            frame_wait_ms: 16,
            lock_timeout_ms: 50,
            worker_core: None,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_SCAN_WINDOW_SECS,
            face: DetectParams {
                scale_factor: 1.18,
                min_neighbors: 2,
                min_size: 70,
            },
            eyes: DetectParams {
                scale_factor: 1.2,
                min_neighbors: 2,
                min_size: 45,
            },
            face_model: None,
            eyes_model: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "facecam".into(),
            queue_depth: 2,
        }
    }
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            max_devices: 10,
            buffer_count: 4,
            back_orientation: 90,
            front_orientation: 90,
            start_timeout_ms: 2_000,
            dequeue_timeout_ms: 500,
        }
    }
}

impl Settings {
    /// Layer defaults, an optional TOML file and `FACECAM__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

impl PipelineConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl ScanConfig {
    /// Negative or NaN values give an empty window; values no `Duration`
    /// can hold fall back to the default.
    pub fn window(&self) -> Duration {
        Duration::try_from_secs_f64(self.window_secs.max(0.0))
            .unwrap_or(Duration::from_secs_f64(DEFAULT_SCAN_WINDOW_SECS))
    }
}
