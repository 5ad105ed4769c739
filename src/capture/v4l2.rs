//! V4L2 camera backend
//!
//! Device index 0 is the back camera, index 1 the front one. Each session
//! streams from a dedicated capture thread into the frame source it was
//! handed, decoding MJPEG on the way.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::{RecvTimeoutError, Sender};
use tracing::{debug, error, info, instrument, trace, warn};
use v4l::buffer::Type;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::{negotiate_view, CameraBackend, CameraSide, CaptureSession, ViewRequest};
use crate::error::CaptureError;
use crate::pipeline::{DeliveryTarget, FrameQueue};
use crate::utils::{self, FoundDevice};
use crate::V4l2Config;

/// Opens V4L2 capture devices and builds ring-buffer frame sources.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    config: V4l2Config,
    pool_size: usize,
}

impl V4l2Backend {
    pub fn new(config: V4l2Config, pool_size: usize) -> Self {
        Self { config, pool_size }
    }

    fn device_index(side: CameraSide) -> usize {
        match side {
            CameraSide::Back => 0,
            CameraSide::Front => 1,
        }
    }
}

impl CameraBackend for V4l2Backend {
    type Session = V4l2Session;
    type Source = FrameQueue;

    #[instrument(skip(self))]
    fn open_session(&self, side: CameraSide) -> Result<V4l2Session, CaptureError> {
        let devices = utils::capture_devices(self.config.max_devices);
        let found = devices
            .get(Self::device_index(side))
            .cloned()
            .ok_or(CaptureError::NoCamera(side))?;

        let device = Device::with_path(&found.path)?;
        let fourcc = fourcc_for(found.format).ok_or(CaptureError::NoUsableFormat)?;
        let sizes = frame_sizes(&device, fourcc)?;
        info!(
            path = %found.path,
            format = ?found.format,
            sizes = sizes.len(),
            cameras = devices.len(),
            "Camera opened"
        );

        let orientation = match side {
            CameraSide::Back => self.config.back_orientation,
            CameraSide::Front => self.config.front_orientation,
        };
        Ok(V4l2Session {
            side,
            device: found,
            sizes,
            orientation,
            camera_count: devices.len(),
            config: self.config.clone(),
            view: Cell::new(None),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    fn create_frame_source(&self, view: ViewRequest, format: PixelFormat) -> FrameQueue {
        FrameQueue::new(view, format, self.pool_size)
    }
}

/// An open camera. Dropping it stops and joins the capture thread.
pub struct V4l2Session {
    side: CameraSide,
    device: FoundDevice,
    sizes: Vec<ViewRequest>,
    orientation: u32,
    camera_count: usize,
    config: V4l2Config,
    view: Cell<Option<ViewRequest>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl V4l2Session {
    pub fn side(&self) -> CameraSide {
        self.side
    }

    pub fn supported_sizes(&self) -> &[ViewRequest] {
        &self.sizes
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(path = %self.device.path, "Capture thread panicked");
            }
        }
    }
}

impl CaptureSession for V4l2Session {
    fn match_capture_size(&self, surface_width: u32, surface_height: u32) -> Option<ViewRequest> {
        let view = negotiate_view(&self.sizes, surface_width, surface_height);
        self.view.set(view);
        view
    }

    fn orientation(&self) -> u32 {
        self.orientation
    }

    fn camera_count(&self) -> usize {
        self.camera_count
    }

    fn begin_delivery(&mut self, target: DeliveryTarget) -> Result<(), CaptureError> {
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyDelivering);
        }
        let view = self.view.get().ok_or(CaptureError::NoUsableFormat)?;

        let (ready_tx, ready_rx) = flume::bounded(1);
        self.running.store(true, Ordering::Release);
        let capture = CaptureThread {
            path: self.device.path.clone(),
            format: self.device.format,
            view,
            buffer_count: self.config.buffer_count,
            dequeue_timeout: Duration::from_millis(self.config.dequeue_timeout_ms),
            target,
            running: self.running.clone(),
        };
        let worker = thread::Builder::new()
            .name(format!("v4l2-{}", self.side))
            .spawn(move || capture.run(ready_tx))?;
        self.worker = Some(worker);

        let timeout = Duration::from_millis(self.config.start_timeout_ms);
        let started = match ready_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CaptureError::StartTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::Closed),
        };
        if started.is_err() {
            self.stop();
        }
        started
    }
}

impl Drop for V4l2Session {
    fn drop(&mut self) {
        self.stop();
        debug!(path = %self.device.path, "Camera closed");
    }
}

struct CaptureThread {
    path: String,
    format: PixelFormat,
    view: ViewRequest,
    buffer_count: u32,
    dequeue_timeout: Duration,
    target: DeliveryTarget,
    running: Arc<AtomicBool>,
}

/// Geometry the driver actually settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamGeometry {
    width: u32,
    height: u32,
    /// Row pitch in pixels.
    stride: u32,
}

/// Row pitch in pixels for a driver-reported `bytesperline`.
///
/// Planar formats report the luma pitch. A missing or implausible value
/// falls back to a tightly packed row.
fn stride_pixels(format: PixelFormat, bytes_per_line: u32, width: u32) -> u32 {
    let bytes_per_pixel = match format {
        PixelFormat::Mjpeg => return width,
        PixelFormat::Nv12 | PixelFormat::Yuv420 => 1,
        PixelFormat::Yuyv4 => 2,
        PixelFormat::Rgb24 => 3,
        PixelFormat::Rgbx8888 => 4,
    };
    let stride = bytes_per_line / bytes_per_pixel;
    if stride < width {
        width
    } else {
        stride
    }
}

impl CaptureThread {
    fn open(&self) -> Result<(Device, MmapStream<'static>, StreamGeometry), CaptureError> {
        let device = Device::with_path(&self.path)?;
        let mut fmt = device.format()?;
        fmt.width = self.view.width;
        fmt.height = self.view.height;
        fmt.fourcc = fourcc_for(self.format).ok_or(CaptureError::NoUsableFormat)?;
        let actual = device.set_format(&fmt)?;
        if actual.width != self.view.width || actual.height != self.view.height {
            warn!(
                requested = ?self.view,
                width = actual.width,
                height = actual.height,
                "Driver adjusted capture size"
            );
        }

        let geometry = StreamGeometry {
            width: actual.width,
            height: actual.height,
            stride: stride_pixels(self.format, actual.stride, actual.width),
        };

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)?;
        stream.set_timeout(self.dequeue_timeout);
        info!(
            width = geometry.width,
            height = geometry.height,
            stride = geometry.stride,
            buffers = self.buffer_count,
            "Capture stream started"
        );
        Ok((device, stream, geometry))
    }

    fn run(self, ready: Sender<Result<(), CaptureError>>) {
        let (_device, mut stream, geometry) = match self.open() {
            Ok(opened) => {
                let _ = ready.send(Ok(()));
                opened
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        drop(ready);

        let mut sequence = 0u64;
        while self.running.load(Ordering::Acquire) {
            let (buf, meta) = match stream.next() {
                Ok(frame) => frame,
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    continue;
                }
                Err(e) => {
                    error!(error = %e, path = %self.path, "Capture failed, stream stopped");
                    break;
                }
            };
            sequence += 1;

            let used = (meta.bytesused as usize).min(buf.len());
            let device_timestamp = Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            );
            let frame = match self.format {
                PixelFormat::Mjpeg => match decode_mjpeg(&buf[..used]) {
                    Ok((data, width, height)) => Frame::new(
                        data,
                        FrameMetadata {
                            sequence,
                            width,
                            height,
                            stride: width,
                            format: PixelFormat::Rgb24,
                            device_timestamp,
                        },
                    ),
                    Err(e) => {
                        trace!(sequence, error = %e, "Corrupt MJPEG frame skipped");
                        continue;
                    }
                },
                format => Frame::new(
                    Bytes::copy_from_slice(&buf[..used]),
                    FrameMetadata {
                        sequence,
                        width: geometry.width,
                        height: geometry.height,
                        stride: geometry.stride,
                        format,
                        device_timestamp,
                    },
                ),
            };
            self.target.deliver(frame);
        }
        debug!(path = %self.path, frames = sequence, "Capture thread exited");
    }
}

fn decode_mjpeg(data: &[u8]) -> Result<(Bytes, u32, u32), zune_jpeg::errors::DecodeErrors> {
    let started = Instant::now();
    let mut decoder = zune_jpeg::JpegDecoder::new(data);
    let pixels = decoder.decode()?;
    let (width, height) = decoder.dimensions().unwrap_or_default();
    metrics::histogram!("facecam_jpeg_decode_time_us").record(started.elapsed().as_micros() as f64);
    Ok((Bytes::from(pixels), width as u32, height as u32))
}

fn fourcc_for(format: PixelFormat) -> Option<FourCC> {
    match format {
        PixelFormat::Mjpeg => Some(FourCC::new(b"MJPG")),
        PixelFormat::Yuyv4 => Some(FourCC::new(b"YUYV")),
        PixelFormat::Nv12 => Some(FourCC::new(b"NV12")),
        PixelFormat::Yuv420 => Some(FourCC::new(b"YU12")),
        PixelFormat::Rgb24 => Some(FourCC::new(b"RGB3")),
        PixelFormat::Rgbx8888 => None,
    }
}

/// Discrete sizes the device offers for `fourcc`; stepwise ranges contribute their bounds.
fn frame_sizes(device: &Device, fourcc: FourCC) -> io::Result<Vec<ViewRequest>> {
    let mut sizes = Vec::new();
    for size in device.enum_framesizes(fourcc)? {
        match size.size {
            FrameSizeEnum::Discrete(discrete) => {
                sizes.push(ViewRequest::new(discrete.width, discrete.height));
            }
            FrameSizeEnum::Stepwise(step) => {
                sizes.push(ViewRequest::new(step.min_width, step.min_height));
                sizes.push(ViewRequest::new(step.max_width, step.max_height));
            }
        }
    }
    sizes.retain(|size| !size.is_empty());
    sizes.dedup();
    Ok(sizes)
}
