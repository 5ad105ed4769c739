//! Scripted camera backend and surfaces for controller tests

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::capture::{
    negotiate_view, CameraBackend, CameraSide, CaptureSession, Frame, FrameMetadata, PixelFormat,
    ViewRequest,
};
use crate::display::{DisplayBuffer, FrameSurface, LockedBuffer, PresentationSurface};
use crate::error::{CaptureError, CompositeError, SurfaceError};
use crate::pipeline::{DeliveryTarget, FrameQueue, FrameSource};
use crate::Settings;

pub(crate) fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.pipeline.frame_wait_ms = 1;
    settings.pipeline.idle_backoff_ms = 1;
    settings.pipeline.lock_timeout_ms = 5;
    settings.camera.decode_format = PixelFormat::Rgbx8888;
    settings
}

pub(crate) fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}

pub(crate) struct MockCamera {
    pub sizes: Vec<ViewRequest>,
    pub camera_count: usize,
    pub orientation: u32,
    pub reject_delivery: bool,
}

impl MockCamera {
    pub fn with_sizes(sizes: &[(u32, u32)]) -> Self {
        Self {
            sizes: sizes.iter().map(|&(w, h)| ViewRequest::new(w, h)).collect(),
            camera_count: 1,
            orientation: 0,
            reject_delivery: false,
        }
    }
}

struct Inner {
    camera: MockCamera,
    live_sessions: AtomicUsize,
    live_sources: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    sequence: AtomicU64,
    opened: Mutex<Vec<CameraSide>>,
    target: Mutex<Option<(DeliveryTarget, ViewRequest)>>,
    view: Mutex<ViewRequest>,
}

#[derive(Clone)]
pub(crate) struct MockBackend {
    inner: Arc<Inner>,
}

impl MockBackend {
    pub fn new(camera: MockCamera) -> Self {
        Self {
            inner: Arc::new(Inner {
                camera,
                live_sessions: AtomicUsize::new(0),
                live_sources: AtomicUsize::new(0),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                sequence: AtomicU64::new(0),
                opened: Mutex::new(Vec::new()),
                target: Mutex::new(None),
                view: Mutex::new(ViewRequest::default()),
            }),
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.live_sessions.load(Ordering::SeqCst)
    }

    pub fn live_sources(&self) -> usize {
        self.inner.live_sources.load(Ordering::SeqCst)
    }

    pub fn frames_acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    pub fn frames_released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn opened_sides(&self) -> Vec<CameraSide> {
        self.inner.opened.lock().clone()
    }

    /// Push a grey RGBX frame of the negotiated size into the live target.
    pub fn deliver_test_frame(&self) {
        self.deliver_rows(|view| view.width);
    }

    /// Push a frame whose rows are half as wide as its claimed width.
    pub fn deliver_malformed_frame(&self) {
        self.deliver_rows(|view| view.width / 2);
    }

    fn deliver_rows(&self, stride: impl FnOnce(ViewRequest) -> u32) {
        let Some((target, view)) = self.inner.target.lock().clone() else {
            panic!("no delivery target");
        };
        let stride = stride(view);
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let len = (stride * view.height * 4) as usize;
        target.deliver(Frame::new(
            Bytes::from(vec![128u8; len]),
            FrameMetadata {
                sequence,
                width: view.width,
                height: view.height,
                stride,
                format: PixelFormat::Rgbx8888,
                device_timestamp: None,
            },
        ));
    }
}

pub(crate) struct MockSession {
    inner: Arc<Inner>,
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.inner.live_sessions.fetch_sub(1, Ordering::SeqCst);
        self.inner.target.lock().take();
    }
}

impl CaptureSession for MockSession {
    fn match_capture_size(&self, surface_width: u32, surface_height: u32) -> Option<ViewRequest> {
        negotiate_view(&self.inner.camera.sizes, surface_width, surface_height)
    }

    fn orientation(&self) -> u32 {
        self.inner.camera.orientation
    }

    fn camera_count(&self) -> usize {
        self.inner.camera.camera_count
    }

    fn begin_delivery(&mut self, target: DeliveryTarget) -> Result<(), CaptureError> {
        if self.inner.camera.reject_delivery {
            return Err(CaptureError::Closed);
        }
        let view = *self.inner.view.lock();
        *self.inner.target.lock() = Some((target, view));
        Ok(())
    }
}

pub(crate) struct MockSource {
    queue: FrameQueue,
    inner: Arc<Inner>,
}

impl Drop for MockSource {
    fn drop(&mut self) {
        self.inner.live_sources.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FrameSource for MockSource {
    fn drawable_target(&self) -> DeliveryTarget {
        self.queue.drawable_target()
    }

    fn set_presentation_rotation(&self, degrees: u32) {
        self.queue.set_presentation_rotation(degrees);
    }

    fn latest_frame(&self) -> Option<Frame> {
        let frame = self.queue.latest_frame();
        if frame.is_some() {
            self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        }
        frame
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
        self.inner.released.fetch_add(1, Ordering::SeqCst);
    }

    fn wait_for_frame(&self, timeout: Duration) {
        self.queue.wait_for_frame(timeout);
    }
}

impl CameraBackend for MockBackend {
    type Session = MockSession;
    type Source = MockSource;

    fn open_session(&self, side: CameraSide) -> Result<MockSession, CaptureError> {
        self.inner.opened.lock().push(side);
        self.inner.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            inner: self.inner.clone(),
        })
    }

    fn create_frame_source(&self, view: ViewRequest, format: PixelFormat) -> MockSource {
        *self.inner.view.lock() = view;
        self.inner.live_sources.fetch_add(1, Ordering::SeqCst);
        MockSource {
            queue: FrameQueue::new(view, format, 4),
            inner: self.inner.clone(),
        }
    }
}

/// Surface whose first `fail_locks` lock attempts time out.
pub(crate) struct FlakySurface {
    pub inner: FrameSurface,
    fail_locks: AtomicUsize,
}

impl FlakySurface {
    pub fn new(width: u32, height: u32, fail_locks: usize) -> Self {
        Self {
            inner: FrameSurface::new(width, height, 4).0,
            fail_locks: AtomicUsize::new(fail_locks),
        }
    }
}

impl PresentationSurface for FlakySurface {
    fn width(&self) -> u32 {
        self.inner.width()
    }

    fn height(&self) -> u32 {
        self.inner.height()
    }

    fn set_buffers_geometry(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(), SurfaceError> {
        self.inner.set_buffers_geometry(width, height, format)
    }

    fn acquire(&self) {
        self.inner.acquire();
    }

    fn release(&self) {
        self.inner.release();
    }

    fn lock(&self, timeout: Duration) -> Result<Box<dyn LockedBuffer + '_>, SurfaceError> {
        let failing = self
            .fail_locks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SurfaceError::LockTimeout(timeout));
        }
        self.inner.lock(timeout)
    }
}
