//! Background corner finder.
//!
//! One long-lived thread owns a single `(frame, result)` slot. The producer
//! copies a frame into the slot and flips the state to `Busy`; the thread
//! runs the [`FeatureExtractor`] without holding the lock, stores the result
//! and flips the state to `ResultReady`. Collecting the result returns the
//! slot to `Idle`. A single tri-state enum guards the handoff so that a
//! caller can never observe "busy" and "ready" at the same time.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::camera::{CalibrationError, Resolution};
use crate::detection::{DetectionResult, FeatureExtractor};
use crate::frame::FrameBuffer;
use crate::pattern::PatternSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a frame.
    Idle,
    /// Detection in progress; the input frame belongs to the worker thread.
    Busy,
    /// Detection finished; waiting for [`CornerFinderWorker::collect_result_into`].
    ResultReady,
}

struct Slot {
    state: WorkerState,
    quit: bool,
    frame: FrameBuffer,
    result: DetectionResult,
}

struct Shared {
    slot: Mutex<Slot>,
    signal: Condvar,
}

pub struct CornerFinderWorker {
    shared: Arc<Shared>,
    resolution: Resolution,
    pattern: PatternSpec,
    join_handle: Option<JoinHandle<()>>,
}

fn run(shared: Arc<Shared>, pattern: PatternSpec, extractor: Box<dyn FeatureExtractor>) {
    let mut slot = shared.slot.lock();
    loop {
        // A submitted frame is always processed, even if quit was requested
        // in the meantime.
        if slot.state == WorkerState::Busy {
            let frame = std::mem::take(&mut slot.frame);
            let result =
                MutexGuard::unlocked(&mut slot, || extractor.detect(frame.image(), &pattern));
            debug!(
                "detection finished: found_all={} points={}",
                result.found_all,
                result.points.len()
            );
            slot.frame = frame;
            slot.result = result;
            slot.state = WorkerState::ResultReady;
            shared.signal.notify_all();
            continue;
        }
        if slot.quit {
            break;
        }
        shared.signal.wait(&mut slot);
    }
    debug!(
        "closing thread {:?} ({:?})",
        std::thread::current().name(),
        std::thread::current().id()
    );
}

impl CornerFinderWorker {
    /// Allocates the input frame and starts the worker thread.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::AllocationFailed`] if the frame cannot be
    /// allocated, [`CalibrationError::WorkerSpawn`] if the thread cannot be
    /// started.
    pub fn spawn(
        resolution: Resolution,
        pattern: PatternSpec,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Result<Self, CalibrationError> {
        let frame = FrameBuffer::new(resolution)?;
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                state: WorkerState::Idle,
                quit: false,
                frame,
                result: DetectionResult::not_found(),
            }),
            signal: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let join_handle = std::thread::Builder::new()
            .name("corner-finder".to_string())
            .spawn(move || run(thread_shared, pattern, extractor))
            .map_err(|e| CalibrationError::WorkerSpawn(e.to_string()))?;

        info!(
            "corner finder started for {} {}x{} at {}x{}",
            pattern.pattern_type,
            pattern.cols(),
            pattern.rows(),
            resolution.width,
            resolution.height
        );

        Ok(CornerFinderWorker {
            shared,
            resolution,
            pattern,
            join_handle: Some(join_handle),
        })
    }

    pub fn state(&self) -> WorkerState {
        self.shared.slot.lock().state
    }

    pub fn is_busy(&self) -> bool {
        self.state() == WorkerState::Busy
    }

    pub fn is_result_ready(&self) -> bool {
        self.state() == WorkerState::ResultReady
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn pattern(&self) -> &PatternSpec {
        &self.pattern
    }

    /// Copies `luma` into the input frame and starts a detection.
    ///
    /// Returns `Ok(false)` without touching the frame unless the worker is
    /// `Idle`.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::FrameSizeMismatch`] if `luma` does not match the
    /// worker's resolution.
    pub fn submit_and_start(&self, luma: &[u8]) -> Result<bool, CalibrationError> {
        let mut slot = self.shared.slot.lock();
        if slot.state != WorkerState::Idle {
            return Ok(false);
        }
        slot.frame.copy_from_slice(luma)?;
        slot.state = WorkerState::Busy;
        self.shared.signal.notify_all();
        Ok(true)
    }

    /// Takes the finished result and copies the frame it was computed on into
    /// `snapshot`. Returns `None` unless a result is ready.
    pub fn collect_result_into(&self, snapshot: &mut FrameBuffer) -> Option<DetectionResult> {
        let mut slot = self.shared.slot.lock();
        if slot.state != WorkerState::ResultReady {
            return None;
        }
        snapshot.copy_from(&slot.frame);
        let result = std::mem::take(&mut slot.result);
        slot.state = WorkerState::Idle;
        Some(result)
    }

    /// Blocks until a result is ready or `timeout` elapses.
    ///
    /// Returns `false` on timeout, or immediately if the worker is idle.
    pub fn wait_for_result(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            match slot.state {
                WorkerState::ResultReady => return true,
                WorkerState::Idle => return false,
                WorkerState::Busy => {
                    if self.shared.signal.wait_until(&mut slot, deadline).timed_out() {
                        return slot.state == WorkerState::ResultReady;
                    }
                }
            }
        }
    }
}

impl Drop for CornerFinderWorker {
    fn drop(&mut self) {
        {
            let mut slot = self.shared.slot.lock();
            slot.quit = true;
            self.shared.signal.notify_all();
        }
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                error!("corner finder thread panicked");
            } else {
                info!("corner finder stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternType;
    use image::GrayImage;
    use nalgebra::Point2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RES: Resolution = Resolution {
        width: 16,
        height: 8,
    };

    /// Blocks every detection until the gate is opened.
    #[derive(Clone)]
    struct Gate {
        open: Arc<(Mutex<bool>, Condvar)>,
        calls: Arc<AtomicUsize>,
    }

    impl Gate {
        fn new() -> Self {
            Gate {
                open: Arc::new((Mutex::new(false), Condvar::new())),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn open(&self) {
            *self.open.0.lock() = true;
            self.open.1.notify_all();
        }
    }

    impl FeatureExtractor for Gate {
        fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> DetectionResult {
            let mut open = self.open.0.lock();
            while !*open {
                self.open.1.wait(&mut open);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Encode the first pixel so tests can tell frames apart.
            let v = image.as_raw()[0] as f64;
            DetectionResult::found(vec![Point2::new(v, v); pattern.point_count()])
        }
    }

    fn spec() -> PatternSpec {
        PatternSpec::new(PatternType::Chessboard, (2, 2), 10.0).unwrap()
    }

    #[test]
    fn test_state_machine() {
        let gate = Gate::new();
        let worker = CornerFinderWorker::spawn(RES, spec(), Box::new(gate.clone())).unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);

        let mut snapshot = FrameBuffer::default();
        assert!(worker.collect_result_into(&mut snapshot).is_none());

        assert!(worker.submit_and_start(&[7u8; 128]).unwrap());
        assert!(worker.is_busy());
        // A second submission while busy is refused.
        assert!(!worker.submit_and_start(&[9u8; 128]).unwrap());
        assert!(!worker.wait_for_result(Duration::from_millis(20)));

        gate.open();
        assert!(worker.wait_for_result(Duration::from_secs(5)));
        assert!(worker.is_result_ready());
        // Not idle yet, so still refused.
        assert!(!worker.submit_and_start(&[9u8; 128]).unwrap());

        let result = worker.collect_result_into(&mut snapshot).unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(result.found_all);
        assert_eq!(result.points[0], Point2::new(7.0, 7.0));
        assert_eq!(snapshot.as_bytes(), &[7u8; 128][..]);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_frame_size_is_rejected() {
        let worker = CornerFinderWorker::spawn(RES, spec(), Box::new(Gate::new())).unwrap();
        let err = worker.submit_and_start(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, CalibrationError::FrameSizeMismatch { .. }));
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn test_drop_finishes_running_detection() {
        let gate = Gate::new();
        let calls = gate.calls.clone();
        let worker = CornerFinderWorker::spawn(RES, spec(), Box::new(gate.clone())).unwrap();
        assert!(worker.submit_and_start(&[1u8; 128]).unwrap());

        let opener = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                gate.open();
            })
        };
        drop(worker);
        opener.join().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_idle_worker() {
        let worker = CornerFinderWorker::spawn(RES, spec(), Box::new(Gate::new())).unwrap();
        drop(worker);
    }
}
