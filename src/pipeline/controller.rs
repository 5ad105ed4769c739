//! Pipeline controller
//!
//! Owns the capture session and frame source, runs the
//! acquire → composite → detect → present loop on a worker thread, and
//! rebuilds both collaborators when the camera is switched.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::{CameraBackend, CameraSide, CaptureSession, Frame, PixelFormat, ViewRequest};
use crate::detect::{self, Detectors};
use crate::display::{DisplayBuffer, PresentationSurface};
use crate::error::{PipelineError, SetupError};
use crate::pipeline::source::FrameSource;
use crate::pipeline::state::{PipelinePhase, PipelineState, ScanWindow, StopRequest};
use crate::Settings;

/// Host callbacks. Invoked from the pipeline worker.
pub trait PipelineObserver: Send + Sync {
    /// Scan mode switched itself off at the end of its window.
    fn scan_finished(&self) {}

    fn camera_switched(&self, _side: CameraSide) {}

    /// Rebuilding the camera failed; the worker has stopped.
    fn pipeline_faulted(&self, _error: &SetupError) {}
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Iteration {
    Presented,
    Skipped(Skip),
    Stop(StopRequest),
}

/// Transient reasons an iteration presented nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Skip {
    CameraNotReady,
    NoFrame,
    NoSurface,
    LockFailed,
    CompositeFailed,
}

impl Skip {
    fn label(self) -> &'static str {
        match self {
            Skip::CameraNotReady => "camera_not_ready",
            Skip::NoFrame => "no_frame",
            Skip::NoSurface => "no_surface",
            Skip::LockFailed => "lock_failed",
            Skip::CompositeFailed => "composite_failed",
        }
    }
}

struct Devices<B: CameraBackend> {
    session: Option<B::Session>,
    source: Option<Arc<B::Source>>,
}

pub(crate) struct Shared<B: CameraBackend> {
    backend: B,
    settings: Settings,
    detectors: Detectors,
    pub(crate) state: PipelineState,
    devices: Mutex<Devices<B>>,
    view: Mutex<ViewRequest>,
    surface: Mutex<Option<Arc<dyn PresentationSurface>>>,
    observer: Mutex<Option<Arc<dyn PipelineObserver>>>,
    scan_window: Mutex<ScanWindow>,
    buffer_logged: AtomicBool,
}

/// Borrowed frame, handed back to its source when dropped.
struct FrameLease<'a, S: FrameSource + ?Sized> {
    source: &'a S,
    frame: Option<Frame>,
}

impl<'a, S: FrameSource + ?Sized> FrameLease<'a, S> {
    fn new(source: &'a S, frame: Frame) -> Self {
        Self {
            source,
            frame: Some(frame),
        }
    }

    /// `None` only once the lease is being dropped.
    fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }
}

impl<S: FrameSource + ?Sized> Drop for FrameLease<'_, S> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.source.release_frame(frame);
        }
    }
}

/// Acquired surface reference, released when dropped.
struct SurfaceRef<'a> {
    surface: &'a dyn PresentationSurface,
}

impl<'a> SurfaceRef<'a> {
    fn acquire(surface: &'a dyn PresentationSurface) -> Self {
        surface.acquire();
        Self { surface }
    }
}

impl Drop for SurfaceRef<'_> {
    fn drop(&mut self) {
        self.surface.release();
    }
}

impl<B: CameraBackend> Shared<B> {
    fn surface(&self) -> Option<Arc<dyn PresentationSurface>> {
        self.surface.lock().clone()
    }

    fn frame_source(&self) -> Option<Arc<B::Source>> {
        self.devices.lock().source.clone()
    }

    fn notify(&self, f: impl FnOnce(&dyn PipelineObserver)) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            f(observer.as_ref());
        }
    }

    /// Build a session and frame source for `side` and start delivery.
    #[instrument(skip(self))]
    pub(crate) fn setup(&self, side: CameraSide) -> Result<(), SetupError> {
        let surface = self.surface().ok_or(SetupError::NoSurface)?;
        let (width, height) = (surface.width(), surface.height());
        if width == 0 || height == 0 {
            return Err(SetupError::InvalidSurface { width, height });
        }

        // At most one session and one source at any time
        self.teardown_devices();

        let mut session = self
            .backend
            .open_session(side)
            .map_err(|source| SetupError::Session { side, source })?;

        let view = session
            .match_capture_size(width, height)
            .filter(|view| !view.is_empty())
            .ok_or(SetupError::NoSupportedResolution { width, height })?;
        *self.view.lock() = view;

        // Sensor is mounted rotated relative to the surface: height goes in as width
        surface.set_buffers_geometry(view.height, view.width, PixelFormat::Rgbx8888)?;

        let source = Arc::new(
            self.backend
                .create_frame_source(view, self.settings.camera.decode_format),
        );
        let orientation = session.orientation();
        source.set_presentation_rotation(orientation);

        session
            .begin_delivery(source.drawable_target())
            .map_err(SetupError::Delivery)?;

        {
            let mut devices = self.devices.lock();
            devices.session = Some(session);
            devices.source = Some(source);
        }
        self.buffer_logged.store(false, Ordering::Relaxed);
        self.state.set_camera_ready(true);
        info!(
            width = view.width,
            height = view.height,
            orientation,
            "Camera ready"
        );
        Ok(())
    }

    /// Destroy the frame source, then the session.
    pub(crate) fn teardown_devices(&self) {
        self.state.set_camera_ready(false);
        let (source, session) = {
            let mut devices = self.devices.lock();
            (devices.source.take(), devices.session.take())
        };
        drop(source);
        if session.is_some() {
            debug!("Capture session closed");
        }
        drop(session);
    }

    /// Tear down and rebuild on the other camera. Runs on the worker after the loop exited.
    #[instrument(skip(self))]
    pub(crate) fn switch_camera(&self) -> Result<CameraSide, SetupError> {
        self.state.clear_switch();
        self.teardown_devices();
        {
            let _window = self.scan_window.lock();
            self.state.set_scanning(false);
        }
        let side = self.state.flip_side();
        info!(%side, "Switching camera");
        self.setup(side)?;
        Ok(side)
    }

    /// Leave the loop for good. Serialized with `start_scan` through the scan window lock.
    fn finish(&self, phase: PipelinePhase) {
        let _window = self.scan_window.lock();
        self.state.set_scanning(false);
        self.state.set_phase(phase);
    }

    /// One pass of the frame loop.
    pub(crate) fn iterate(&self) -> Iteration {
        if let Some(request) = self.state.stop_request() {
            return Iteration::Stop(request);
        }
        if !self.state.camera_ready() {
            return Iteration::Skipped(Skip::CameraNotReady);
        }
        let Some(source) = self.frame_source() else {
            return Iteration::Skipped(Skip::CameraNotReady);
        };
        let Some(frame) = source.latest_frame() else {
            source.wait_for_frame(self.settings.pipeline.frame_wait());
            return Iteration::Skipped(Skip::NoFrame);
        };
        let lease = FrameLease::new(source.as_ref(), frame);
        let Some(frame) = lease.frame() else {
            return Iteration::Skipped(Skip::NoFrame);
        };

        let Some(surface) = self.surface() else {
            return Iteration::Skipped(Skip::NoSurface);
        };
        let surface_ref = SurfaceRef::acquire(surface.as_ref());
        let mut locked = match surface.lock(self.settings.pipeline.lock_timeout()) {
            Ok(locked) => locked,
            Err(e) => {
                trace!(error = %e, "Surface lock failed, frame skipped");
                return Iteration::Skipped(Skip::LockFailed);
            }
        };

        {
            let mut buffer = locked.buffer();
            if !self.buffer_logged.swap(true, Ordering::Relaxed) {
                info!(
                    height = buffer.height,
                    width = buffer.width,
                    stride = buffer.stride,
                    format = ?buffer.format,
                    "Display buffer"
                );
            }

            let started = Instant::now();
            if let Err(e) = source.composite(&mut buffer, frame) {
                debug!(error = %e, sequence = frame.sequence(), "Composite failed");
                return Iteration::Skipped(Skip::CompositeFailed);
            }
            metrics::histogram!("facecam_composite_time_us")
                .record(started.elapsed().as_micros() as f64);

            if self.state.scanning() {
                self.scan_pass(&mut buffer);
            }
        }

        locked.unlock_and_post();
        drop(surface_ref);
        drop(lease);
        metrics::counter!("facecam_frames_presented").increment(1);
        Iteration::Presented
    }

    fn scan_pass(&self, buffer: &mut DisplayBuffer<'_>) {
        let Some(mut view) = buffer.rgba_view() else {
            warn!(format = ?buffer.format, "Display buffer cannot be viewed as RGBA, scan skipped");
            return;
        };

        let started = Instant::now();
        let summary = detect::scan_frame(&self.detectors, &mut view, &self.settings.scan);
        metrics::histogram!("facecam_detect_time_us").record(started.elapsed().as_micros() as f64);
        trace!(
            faces = summary.faces.len(),
            ellipses = summary.overlays.ellipses,
            circles = summary.overlays.circles,
            "Detection pass"
        );

        let expired = {
            let mut window = self.scan_window.lock();
            let expired = window.record_pass(Instant::now());
            if expired && self.state.scanning() {
                self.state.set_scanning(false);
                info!(elapsed = ?window.elapsed(), "Scan window elapsed, scan mode off");
            }
            expired
        };
        if expired {
            self.notify(|observer| observer.scan_finished());
        }
    }
}

fn worker_main<B: CameraBackend>(shared: Arc<Shared<B>>) {
    if let Some(id) = shared.settings.pipeline.worker_core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
            warn!(core = id, "Failed to pin pipeline worker");
        }
    }

    info!(side = %shared.state.side(), "Pipeline worker started");
    let phase = match panic::catch_unwind(AssertUnwindSafe(|| run_loop(&shared))) {
        Ok(phase) => phase,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown");
            error!(panic = message, "Pipeline worker panicked");
            PipelinePhase::Faulted
        }
    };
    shared.finish(phase);
    info!(?phase, "Pipeline worker stopped");
}

/// Run loop generations until a halt or a failed switch.
fn run_loop<B: CameraBackend>(shared: &Shared<B>) -> PipelinePhase {
    let idle_backoff = shared.settings.pipeline.idle_backoff();
    loop {
        match shared.iterate() {
            Iteration::Presented => {}
            Iteration::Skipped(skip) => {
                metrics::counter!("facecam_frames_skipped", "reason" => skip.label()).increment(1);
                if matches!(skip, Skip::CameraNotReady | Skip::NoSurface) {
                    thread::sleep(idle_backoff);
                }
            }
            Iteration::Stop(StopRequest::Halt) => return PipelinePhase::Halted,
            Iteration::Stop(StopRequest::Switch) => {
                shared.state.set_phase(PipelinePhase::Stopping);
                match shared.switch_camera() {
                    Ok(side) => {
                        shared.state.set_phase(PipelinePhase::Running);
                        shared.notify(|observer| observer.camera_switched(side));
                    }
                    Err(e) => {
                        error!(error = %e, "Camera switch failed, pipeline stopped");
                        shared.finish(PipelinePhase::Faulted);
                        shared.notify(|observer| observer.pipeline_faulted(&e));
                        return PipelinePhase::Faulted;
                    }
                }
            }
        }
    }
}

/// Control surface of the camera pipeline.
///
/// Every method is a synchronous call meant for the UI thread. Frame work
/// happens on a single worker thread owned by the controller and joined on
/// `shutdown`, `on_destroy` or drop.
pub struct PipelineController<B: CameraBackend> {
    shared: Arc<Shared<B>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: CameraBackend> PipelineController<B> {
    pub fn new(backend: B, settings: Settings, detectors: Detectors) -> Self {
        let side = settings.camera.initial_side;
        let window = settings.scan.window();
        Self {
            shared: Arc::new(Shared {
                backend,
                settings,
                detectors,
                state: PipelineState::new(side),
                devices: Mutex::new(Devices {
                    session: None,
                    source: None,
                }),
                view: Mutex::new(ViewRequest::default()),
                surface: Mutex::new(None),
                observer: Mutex::new(None),
                scan_window: Mutex::new(ScanWindow::new(window, Instant::now())),
                buffer_logged: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.shared.state
    }

    pub fn phase(&self) -> PipelinePhase {
        self.shared.state.phase()
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Resolution negotiated by the last setup.
    pub fn view(&self) -> ViewRequest {
        *self.shared.view.lock()
    }

    pub fn has_session(&self) -> bool {
        self.shared.devices.lock().session.is_some()
    }

    pub fn has_frame_source(&self) -> bool {
        self.shared.devices.lock().source.is_some()
    }

    pub fn on_create(&self, observer: Arc<dyn PipelineObserver>) {
        *self.shared.observer.lock() = Some(observer);
        debug!("Host observer attached");
    }

    pub fn on_pause(&self) {
        debug!("Host paused");
    }

    /// Stop the worker and release every native resource. Safe to call twice.
    pub fn on_destroy(&self) {
        self.shutdown();
        self.shared.teardown_devices();
        self.shared.surface.lock().take();
        self.shared.observer.lock().take();
        debug!("Pipeline destroyed");
    }

    pub fn set_presentation_surface(&self, surface: Arc<dyn PresentationSurface>) {
        info!(
            width = surface.width(),
            height = surface.height(),
            "Presentation surface attached"
        );
        *self.shared.surface.lock() = Some(surface);
    }

    fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Open the active camera side against the attached surface.
    pub fn setup_camera(&self) -> Result<(), SetupError> {
        if self.worker_running() {
            return Err(SetupError::Busy);
        }
        let side = self.shared.state.side();
        self.shared.setup(side).map_err(|e| {
            error!(error = %e, %side, "Camera setup failed");
            e
        })
    }

    /// Spawn the pipeline worker.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(PipelineError::AlreadyRunning);
        }
        if let Some(finished) = worker.take() {
            let _ = finished.join();
        }
        if !self.shared.state.camera_ready() {
            return Err(PipelineError::NotReady);
        }

        self.shared.state.clear_stop();
        self.shared.state.set_phase(PipelinePhase::Running);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("facecam-pipeline".into())
            .spawn(move || worker_main(shared))
            .map_err(|e| {
                self.shared.state.set_phase(PipelinePhase::Idle);
                PipelineError::Spawn(e)
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Turn on detection for one scan window. Refused unless the worker is running.
    pub fn start_scan(&self) -> bool {
        let mut window = self.shared.scan_window.lock();
        let phase = self.phase();
        if phase != PipelinePhase::Running || !self.worker_running() {
            warn!(?phase, "Pipeline is not running, scan ignored");
            return false;
        }
        window.restart(Instant::now());
        self.shared.state.set_scanning(true);
        info!(window = ?self.shared.settings.scan.window(), "Scan started");
        true
    }

    pub fn stop_scan(&self) {
        let _window = self.shared.scan_window.lock();
        if self.shared.state.scanning() {
            self.shared.state.set_scanning(false);
            info!("Scan stopped");
        }
    }

    /// Ask the worker to rebuild the pipeline on the other camera.
    ///
    /// Refused without a session, with fewer than two cameras, or when the
    /// worker is not running. Returns whether the request was accepted.
    pub fn request_camera_stop(&self) -> bool {
        {
            let devices = self.shared.devices.lock();
            let Some(session) = devices.session.as_ref() else {
                warn!("Can't flip camera without camera instance");
                return false;
            };
            let count = session.camera_count();
            if count < 2 {
                warn!(count, "Only one camera is available");
                return false;
            }
        }
        let phase = self.phase();
        if phase != PipelinePhase::Running || !self.worker_running() {
            warn!(?phase, "Pipeline is not running, camera switch ignored");
            return false;
        }
        if !self.shared.state.request_switch() {
            debug!("Pipeline stop already pending");
            return false;
        }
        info!("Camera switch requested");
        true
    }

    /// Halt the worker and wait for it to exit. The camera stays open.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.shared.state.request_halt();

        if handle.thread().id() == thread::current().id() {
            // Called from an observer callback; the worker exits on its own
            *self.worker.lock() = Some(handle);
            return;
        }
        if handle.join().is_err() {
            error!("Pipeline worker panicked");
            self.shared.finish(PipelinePhase::Faulted);
        }
    }
}

impl<B: CameraBackend> Drop for PipelineController<B> {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
