//! State shared between the control surface and the pipeline worker

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::capture::CameraSide;

/// Why the worker loop should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    /// Tear the camera down and come back on the other side.
    Switch,
    /// Stop for good.
    Halt,
}

/// Where the pipeline is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Running,
    /// Loop exited, camera being rebuilt.
    Stopping,
    Halted,
    /// A camera rebuild failed or the worker panicked; the worker is gone.
    Faulted,
}

const STOP_NONE: u8 = 0;
const STOP_SWITCH: u8 = 1;
const STOP_HALT: u8 = 2;

/// Flags read by the worker every iteration and written from the control thread.
#[derive(Debug)]
pub struct PipelineState {
    camera_ready: AtomicBool,
    scanning: AtomicBool,
    stop: AtomicU8,
    side: AtomicU8,
    phase: AtomicU8,
}

impl PipelineState {
    pub fn new(side: CameraSide) -> Self {
        Self {
            camera_ready: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
            stop: AtomicU8::new(STOP_NONE),
            side: AtomicU8::new(side_to_u8(side)),
            phase: AtomicU8::new(phase_to_u8(PipelinePhase::Idle)),
        }
    }

    pub fn camera_ready(&self) -> bool {
        self.camera_ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_camera_ready(&self, ready: bool) {
        self.camera_ready.store(ready, Ordering::Release);
    }

    pub fn scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    pub(crate) fn set_scanning(&self, scanning: bool) {
        self.scanning.store(scanning, Ordering::Release);
    }

    pub fn side(&self) -> CameraSide {
        side_from_u8(self.side.load(Ordering::Acquire))
    }

    /// Switch to the other camera side and return it.
    pub(crate) fn flip_side(&self) -> CameraSide {
        let next = self.side().flipped();
        self.side.store(side_to_u8(next), Ordering::Release);
        next
    }

    pub fn phase(&self) -> PipelinePhase {
        phase_from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: PipelinePhase) {
        self.phase.store(phase_to_u8(phase), Ordering::Release);
    }

    pub fn stop_request(&self) -> Option<StopRequest> {
        match self.stop.load(Ordering::Acquire) {
            STOP_SWITCH => Some(StopRequest::Switch),
            STOP_HALT => Some(StopRequest::Halt),
            _ => None,
        }
    }

    /// Ask for a camera switch. A pending request of either kind wins.
    pub(crate) fn request_switch(&self) -> bool {
        self.stop
            .compare_exchange(STOP_NONE, STOP_SWITCH, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Ask the worker to halt; overrides a pending switch.
    pub(crate) fn request_halt(&self) {
        self.stop.store(STOP_HALT, Ordering::Release);
    }

    /// Consume a switch request without losing a halt that raced in.
    pub(crate) fn clear_switch(&self) {
        let _ = self.stop.compare_exchange(
            STOP_SWITCH,
            STOP_NONE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(STOP_NONE, Ordering::Release);
    }
}

fn side_to_u8(side: CameraSide) -> u8 {
    match side {
        CameraSide::Front => 0,
        CameraSide::Back => 1,
    }
}

fn side_from_u8(raw: u8) -> CameraSide {
    if raw == 0 {
        CameraSide::Front
    } else {
        CameraSide::Back
    }
}

fn phase_to_u8(phase: PipelinePhase) -> u8 {
    match phase {
        PipelinePhase::Idle => 0,
        PipelinePhase::Running => 1,
        PipelinePhase::Stopping => 2,
        PipelinePhase::Halted => 3,
        PipelinePhase::Faulted => 4,
    }
}

fn phase_from_u8(raw: u8) -> PipelinePhase {
    match raw {
        1 => PipelinePhase::Running,
        2 => PipelinePhase::Stopping,
        3 => PipelinePhase::Halted,
        4 => PipelinePhase::Faulted,
        _ => PipelinePhase::Idle,
    }
}

/// Wall-clock budget of one scan.
///
/// Time between consecutive detection passes is accumulated; once it reaches
/// the window the scan is over.
#[derive(Debug, Clone)]
pub struct ScanWindow {
    window: Duration,
    elapsed: Duration,
    last_pass: Instant,
}

impl ScanWindow {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            elapsed: Duration::ZERO,
            last_pass: now,
        }
    }

    pub fn restart(&mut self, now: Instant) {
        self.elapsed = Duration::ZERO;
        self.last_pass = now;
    }

    /// Account for a pass finished at `now`. Returns true once the window is used up.
    pub fn record_pass(&mut self, now: Instant) -> bool {
        self.elapsed += now.saturating_duration_since(self.last_pass);
        self.last_pass = now;
        self.elapsed >= self.window
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
