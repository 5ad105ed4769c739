//! Ring-buffer frame source
//!
//! Holds at most `capacity` frames, counting both queued frames and the one
//! the controller is borrowing. A delivery into a full pool evicts the oldest
//! queued frame; when every slot is borrowed the incoming frame is dropped.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::{trace, warn};

use crate::capture::decoder::{self, Rotation};
use crate::capture::{Frame, PixelFormat, ViewRequest};
use crate::display::DisplayBuffer;
use crate::error::CompositeError;
use crate::pipeline::source::{DeliveryTarget, FrameSink, FrameSource};

/// Frame source backed by a bounded ring of decoded frames
pub struct FrameQueue {
    shared: Arc<Shared>,
    rotation: AtomicU32,
}

struct Shared {
    view: ViewRequest,
    format: PixelFormat,
    capacity: usize,
    ring: Mutex<HeapRb<Frame>>,
    /// Frames handed to the consumer and not yet released
    borrowed: AtomicUsize,
    ready_tx: Sender<()>,
    ready_rx: Receiver<()>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_delivered: AtomicUsize,
    frames_acquired: AtomicUsize,
    frames_released: AtomicUsize,
    frames_dropped: AtomicUsize,
}

/// Counters of a `FrameQueue`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub delivered: usize,
    pub acquired: usize,
    pub released: usize,
    pub dropped: usize,
}

impl FrameQueue {
    pub fn new(view: ViewRequest, format: PixelFormat, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (ready_tx, ready_rx) = flume::bounded(1);
        Self {
            shared: Arc::new(Shared {
                view,
                format,
                capacity,
                ring: Mutex::new(HeapRb::new(capacity)),
                borrowed: AtomicUsize::new(0),
                ready_tx,
                ready_rx,
                stats: CachePadded::new(Stats::default()),
            }),
            rotation: AtomicU32::new(0),
        }
    }

    pub fn view(&self) -> ViewRequest {
        self.shared.view
    }

    /// Frames currently borrowed by the consumer.
    pub fn borrowed(&self) -> usize {
        self.shared.borrowed.load(Ordering::Acquire)
    }

    /// Frames waiting to be picked up.
    pub fn queued(&self) -> usize {
        self.shared.ring.lock().occupied_len()
    }

    pub fn stats(&self) -> QueueStats {
        let stats = &self.shared.stats;
        QueueStats {
            delivered: stats.frames_delivered.load(Ordering::Relaxed),
            acquired: stats.frames_acquired.load(Ordering::Relaxed),
            released: stats.frames_released.load(Ordering::Relaxed),
            dropped: stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl FrameSink for Shared {
    fn format(&self) -> PixelFormat {
        self.format
    }

    fn deliver(&self, frame: Frame) {
        let sequence = frame.sequence();
        let mut ring = self.ring.lock();
        let in_use = ring.occupied_len() + self.borrowed.load(Ordering::Acquire);

        if in_use >= self.capacity {
            if ring.is_empty() {
                // Every slot is borrowed; nothing to evict
                drop(ring);
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("facecam_frames_dropped").increment(1);
                trace!(sequence, "Frame pool exhausted, incoming frame dropped");
                return;
            }
            drop(ring.try_pop());
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("facecam_frames_dropped").increment(1);
        }

        ring.push_overwrite(frame);
        drop(ring);
        self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.ready_tx.try_send(());
    }
}

impl FrameSource for FrameQueue {
    fn drawable_target(&self) -> DeliveryTarget {
        self.shared.clone()
    }

    fn set_presentation_rotation(&self, degrees: u32) {
        if Rotation::from_degrees(degrees).is_none() {
            warn!(degrees, "Presentation rotation is not a quarter turn, ignoring");
            return;
        }
        self.rotation.store(degrees % 360, Ordering::Relaxed);
    }

    fn latest_frame(&self) -> Option<Frame> {
        let mut ring = self.shared.ring.lock();
        let mut latest = None;
        let mut stale = 0;
        while let Some(frame) = ring.try_pop() {
            if latest.replace(frame).is_some() {
                stale += 1;
            }
        }
        let frame = latest?;
        self.shared.borrowed.fetch_add(1, Ordering::AcqRel);
        drop(ring);

        let stats = &self.shared.stats;
        stats.frames_acquired.fetch_add(1, Ordering::Relaxed);
        if stale > 0 {
            stats.frames_dropped.fetch_add(stale, Ordering::Relaxed);
            metrics::counter!("facecam_frames_dropped").increment(stale as u64);
        }
        Some(frame)
    }

    fn composite(
        &self,
        buffer: &mut DisplayBuffer<'_>,
        frame: &Frame,
    ) -> Result<(), CompositeError> {
        let rotation = Rotation::from_degrees(self.rotation.load(Ordering::Relaxed))
            .unwrap_or(Rotation::Deg0);
        decoder::composite_rotated(frame, rotation, buffer)
    }

    fn release_frame(&self, frame: Frame) {
        drop(frame);
        self.shared.borrowed.fetch_sub(1, Ordering::AcqRel);
        self.shared
            .stats
            .frames_released
            .fetch_add(1, Ordering::Relaxed);
    }

    fn wait_for_frame(&self, timeout: Duration) {
        let _ = self.shared.ready_rx.recv_timeout(timeout);
    }
}
