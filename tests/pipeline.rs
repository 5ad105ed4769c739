//! Controller driven through its public surface with a scripted camera backend

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use image::GrayImage;
use parking_lot::Mutex;

use facecam::capture::{
    negotiate_view, CameraBackend, CameraSide, CaptureSession, Frame, FrameMetadata, PixelFormat,
    ViewRequest,
};
use facecam::detect::{overlay, Detector, Detectors, NoopDetector, Region};
use facecam::display::{DisplayBuffer, FrameSurface, PresentedFrame};
use facecam::error::{CaptureError, CompositeError, SetupError};
use facecam::pipeline::{
    DeliveryTarget, FrameQueue, FrameSource, PipelineController, PipelineObserver, PipelinePhase,
};
use facecam::{DetectParams, Settings};

#[derive(Default)]
struct Script {
    cameras: usize,
    broken_side: Option<CameraSide>,
    opened: Mutex<Vec<CameraSide>>,
    live_sessions: AtomicUsize,
    live_sources: AtomicUsize,
    current: Mutex<Option<Arc<FrameQueue>>>,
    sequence: AtomicUsize,
}

#[derive(Clone)]
struct FakeBackend(Arc<Script>);

impl FakeBackend {
    fn new(cameras: usize, broken_side: Option<CameraSide>) -> Self {
        Self(Arc::new(Script {
            cameras,
            broken_side,
            ..Default::default()
        }))
    }

    fn queue(&self) -> Arc<FrameQueue> {
        self.0.current.lock().clone().expect("no live frame source")
    }

    fn deliver(&self) {
        let queue = self.queue();
        let view = queue.view();
        let sequence = self.0.sequence.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        queue.drawable_target().deliver(Frame::new(
            Bytes::from(vec![90u8; (view.width * view.height * 4) as usize]),
            FrameMetadata {
                sequence,
                width: view.width,
                height: view.height,
                stride: view.width,
                format: PixelFormat::Rgbx8888,
                device_timestamp: None,
            },
        ));
    }

    fn live(&self) -> (usize, usize) {
        (
            self.0.live_sessions.load(Ordering::SeqCst),
            self.0.live_sources.load(Ordering::SeqCst),
        )
    }
}

struct FakeSession(Arc<Script>);

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.0.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CaptureSession for FakeSession {
    fn match_capture_size(&self, surface_width: u32, surface_height: u32) -> Option<ViewRequest> {
        negotiate_view(&[ViewRequest::new(64, 64)], surface_width, surface_height)
    }

    fn orientation(&self) -> u32 {
        0
    }

    fn camera_count(&self) -> usize {
        self.0.cameras
    }

    fn begin_delivery(&mut self, _target: DeliveryTarget) -> Result<(), CaptureError> {
        Ok(())
    }
}

struct FakeSource {
    queue: Arc<FrameQueue>,
    script: Arc<Script>,
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.script.live_sources.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FrameSource for FakeSource {
    fn drawable_target(&self) -> DeliveryTarget {
        self.queue.drawable_target()
    }

    fn set_presentation_rotation(&self, degrees: u32) {
        self.queue.set_presentation_rotation(degrees);
    }

    fn latest_frame(&self) -> Option<Frame> {
        self.queue.latest_frame()
    }

    fn composite(
        &self,
        buffer: &mut DisplayBuffer<'_>,
        frame: &Frame,
    ) -> Result<(), CompositeError> {
        self.queue.composite(buffer, frame)
    }

    fn release_frame(&self, frame: Frame) {
        self.queue.release_frame(frame);
    }

    fn wait_for_frame(&self, timeout: Duration) {
        self.queue.wait_for_frame(timeout);
    }
}

impl CameraBackend for FakeBackend {
    type Session = FakeSession;
    type Source = FakeSource;

    fn open_session(&self, side: CameraSide) -> Result<FakeSession, CaptureError> {
        self.0.opened.lock().push(side);
        if self.0.broken_side == Some(side) {
            return Err(CaptureError::NoCamera(side));
        }
        self.0.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession(self.0.clone()))
    }

    fn create_frame_source(&self, view: ViewRequest, format: PixelFormat) -> FakeSource {
        let queue = Arc::new(FrameQueue::new(view, format, 3));
        *self.0.current.lock() = Some(queue.clone());
        self.0.live_sources.fetch_add(1, Ordering::SeqCst);
        FakeSource {
            queue,
            script: self.0.clone(),
        }
    }
}

#[derive(Default)]
struct Events {
    switched: Mutex<Vec<CameraSide>>,
    faulted: AtomicUsize,
}

impl PipelineObserver for Events {
    fn camera_switched(&self, side: CameraSide) {
        self.switched.lock().push(side);
    }

    fn pipeline_faulted(&self, _error: &SetupError) {
        self.faulted.fetch_add(1, Ordering::SeqCst);
    }
}

struct OneFace;

impl Detector for OneFace {
    fn detect(&self, _image: &GrayImage, _params: &DetectParams) -> Vec<Region> {
        vec![Region::new(8, 8, 40, 40)]
    }
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.pipeline.frame_wait_ms = 2;
    settings.pipeline.idle_backoff_ms = 1;
    settings.pipeline.lock_timeout_ms = 5;
    settings.camera.decode_format = PixelFormat::Rgbx8888;
    settings
}

struct Harness {
    controller: PipelineController<FakeBackend>,
    backend: FakeBackend,
    surface: Arc<FrameSurface>,
    presented: flume::Receiver<PresentedFrame>,
    events: Arc<Events>,
}

fn harness(backend: FakeBackend, detectors: Detectors) -> Harness {
    let (surface, presented) = FrameSurface::new(64, 64, 8);
    let surface = Arc::new(surface);
    let events = Arc::new(Events::default());
    let controller = PipelineController::new(backend.clone(), settings(), detectors);
    controller.on_create(events.clone());
    controller.set_presentation_surface(surface.clone());
    controller.setup_camera().unwrap();
    controller.start().unwrap();
    Harness {
        controller,
        backend,
        surface,
        presented,
        events,
    }
}

fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

#[test]
fn idle_worker_presents_nothing_until_a_frame_arrives() {
    let h = harness(FakeBackend::new(1, None), Detectors::disabled());

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(h.surface.posted(), 0);
    assert_eq!(h.surface.outstanding_refs(), 0);
    assert_eq!(h.backend.queue().borrowed(), 0);

    h.backend.deliver();
    assert!(eventually(|| h.surface.posted() == 1));
    let queue = h.backend.queue();
    assert!(eventually(|| queue.borrowed() == 0));
    let stats = queue.stats();
    assert_eq!(stats.acquired, stats.released);
    assert_eq!(h.surface.outstanding_refs(), 0);
}

#[test]
fn switch_request_rebuilds_on_the_other_camera() {
    let h = harness(FakeBackend::new(2, None), Detectors::disabled());
    let original = h.controller.state().side();

    assert!(h.controller.request_camera_stop());
    assert!(eventually(|| h.events.switched.lock().len() == 1));
    assert_eq!(h.controller.state().side(), original.flipped());
    assert_eq!(h.controller.phase(), PipelinePhase::Running);

    assert!(h.controller.request_camera_stop());
    assert!(eventually(|| h.events.switched.lock().len() == 2));
    assert_eq!(h.controller.state().side(), original);
    assert_eq!(h.backend.live(), (1, 1));
    assert_eq!(h.backend.0.opened.lock().len(), 3);

    // frames still flow after two generations
    h.backend.deliver();
    assert!(eventually(|| h.surface.posted() >= 1));

    h.controller.shutdown();
    assert_eq!(h.controller.phase(), PipelinePhase::Halted);
}

#[test]
fn single_camera_refuses_switch() {
    let h = harness(FakeBackend::new(1, None), Detectors::disabled());
    assert!(!h.controller.request_camera_stop());
    assert_eq!(h.controller.state().stop_request(), None);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(h.backend.0.opened.lock().len(), 1);
}

#[test]
fn failed_switch_faults_the_pipeline() {
    let h = harness(
        FakeBackend::new(2, Some(CameraSide::Front)),
        Detectors::disabled(),
    );

    assert!(h.controller.request_camera_stop());
    assert!(eventually(|| h.controller.phase() == PipelinePhase::Faulted));
    assert_eq!(h.events.faulted.load(Ordering::SeqCst), 1);
    assert!(!h.controller.state().camera_ready());
    assert_eq!(h.backend.live(), (0, 0));
    assert!(!h.controller.start_scan());
}

#[test]
fn scan_paints_overlay_into_presented_frames() {
    let detectors = Detectors::new(Arc::new(OneFace), Arc::new(NoopDetector));
    let h = harness(FakeBackend::new(1, None), detectors);

    assert!(h.controller.start_scan());
    h.backend.deliver();

    let deadline = Instant::now() + Duration::from_secs(5);
    let frame = loop {
        let frame = h
            .presented
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .expect("no frame presented");
        if h.controller.state().scanning() {
            break frame;
        }
    };

    // Top of the face ellipse: center (28, 28), vertical radius 20
    let offset = (8 * frame.stride as usize + 28) * 4;
    assert_eq!(&frame.data[offset..offset + 4], &overlay::FACE_COLOR.0);
    h.controller.stop_scan();
    assert!(!h.controller.state().scanning());
}
