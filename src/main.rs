//! facecam preview host: V4L2 camera, SDL2 window, keyboard-driven scan and camera switch

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use facecam::capture::{CameraSide, V4l2Backend};
use facecam::detect::{self, Detector, Detectors};
use facecam::display::{FrameSurface, PreviewCommand, Sdl2Display};
use facecam::error::{DetectorError, SetupError};
use facecam::pipeline::{PipelineController, PipelineObserver};
use facecam::Settings;

/// Logs pipeline events for the preview host.
struct HostObserver;

impl PipelineObserver for HostObserver {
    fn scan_finished(&self) {
        info!("Scan finished, press [s] to scan again");
    }

    fn camera_switched(&self, side: CameraSide) {
        info!(%side, "Now showing camera");
    }

    fn pipeline_faulted(&self, error: &SetupError) {
        error!(%error, "Pipeline stopped, press [esc] to quit");
    }
}

/// No detector backend is compiled in; a configured model only gets checked for readability.
fn load_model(path: &Path) -> Result<Arc<dyn Detector>, DetectorError> {
    std::fs::metadata(path).map_err(|source| DetectorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Err(DetectorError::Invalid {
        path: path.to_path_buf(),
        reason: "no detector backend available".into(),
    })
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("facecam=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("facecam launching...");

    // Load configuration
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;
    facecam::CONFIG.store(Arc::new(settings.clone()));

    let detectors = Detectors::new(
        detect::load_or_disabled("face", settings.scan.face_model.as_deref(), load_model),
        detect::load_or_disabled("eyes", settings.scan.eyes_model.as_deref(), load_model),
    );

    let (surface, presented) = FrameSurface::new(
        settings.display.width,
        settings.display.height,
        settings.display.queue_depth,
    );
    let surface = Arc::new(surface);

    let backend = V4l2Backend::new(settings.v4l2.clone(), settings.camera.frame_pool_size);
    let controller = PipelineController::new(backend, settings.clone(), detectors);
    controller.on_create(Arc::new(HostObserver));
    controller.set_presentation_surface(surface.clone());
    controller.setup_camera()?;
    controller.start()?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                running.store(false, Ordering::Relaxed);
            }
        });
    }

    // SDL must stay on the main thread
    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut app = Sdl2Display::new(
        &sdl_context,
        &settings.display.title,
        settings.display.width,
        settings.display.height,
    )?;
    let result = app.run(&sdl_context, presented, &running, |command| match command {
        PreviewCommand::StartScan => {
            controller.start_scan();
        }
        PreviewCommand::StopScan => controller.stop_scan(),
        PreviewCommand::SwitchCamera => {
            if !controller.request_camera_stop() {
                warn!("Camera switch not possible right now");
            }
        }
    });

    controller.on_pause();
    controller.on_destroy();
    info!(
        posted = surface.posted(),
        dropped = surface.dropped(),
        "facecam shutting down"
    );
    result
}
