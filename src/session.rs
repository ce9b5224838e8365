//! Calibration session: feeds frames to the corner finder, publishes the
//! latest detection for readers and keeps the list of accepted samples.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nalgebra::Point2;
use parking_lot::{Mutex, MutexGuard};

use crate::camera::{CalibrationError, CameraParameters};
use crate::config::CalibrationConfig;
use crate::detection::{refine_corners, DetectionResult, FeatureExtractor, PatternDetector};
use crate::frame::{FrameBuffer, FrameSource, Timestamp};
use crate::optimization::{CalibrationSolver, ReprojectionErrors};
use crate::worker::{CornerFinderWorker, WorkerState};

/// The most recent completed detection together with the frame it ran on.
#[derive(Debug, Clone, Default)]
pub struct LatestResult {
    pub found_all: bool,
    pub points: Vec<Point2<f64>>,
    pub frame: FrameBuffer,
}

/// Holds the latest-result lock; it is released when the guard is dropped.
pub struct LatestResultGuard<'a> {
    guard: MutexGuard<'a, LatestResult>,
}

impl LatestResultGuard<'_> {
    pub fn found_all(&self) -> bool {
        self.guard.found_all
    }

    pub fn points(&self) -> &[Point2<f64>] {
        &self.guard.points
    }

    pub fn frame(&self) -> &FrameBuffer {
        &self.guard.frame
    }
}

impl std::ops::Deref for LatestResultGuard<'_> {
    type Target = LatestResult;

    fn deref(&self) -> &LatestResult {
        &self.guard
    }
}

/// Cloneable read handle on the latest result, for a render thread.
#[derive(Clone)]
pub struct SharedLatestResult(Arc<Mutex<LatestResult>>);

impl SharedLatestResult {
    pub fn lock(&self) -> LatestResultGuard<'_> {
        LatestResultGuard {
            guard: self.0.lock(),
        }
    }
}

pub struct CalibrationSession {
    config: CalibrationConfig,
    worker: CornerFinderWorker,
    latest: Arc<Mutex<LatestResult>>,
    /// Receives the worker's frame before it is swapped into `latest`.
    collected: FrameBuffer,
    /// Private copy of the latest frame used for sub-pixel refinement.
    refine_frame: FrameBuffer,
    samples: Vec<Vec<Point2<f64>>>,
    last_timestamp: Option<Timestamp>,
    solver: CalibrationSolver,
}

impl CalibrationSession {
    /// Validates `config`, allocates every frame buffer and starts the
    /// corner finder.
    ///
    /// # Errors
    ///
    /// Invalid configuration, [`CalibrationError::AllocationFailed`] or
    /// [`CalibrationError::WorkerSpawn`].
    pub fn new(
        config: CalibrationConfig,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        let resolution = config.video;

        let latest = LatestResult {
            found_all: false,
            points: Vec::new(),
            frame: FrameBuffer::new(resolution)?,
        };
        let collected = FrameBuffer::new(resolution)?;
        let refine_frame = FrameBuffer::new(resolution)?;
        let worker = CornerFinderWorker::spawn(resolution, config.pattern, extractor)?;
        let solver = CalibrationSolver::new(config.pattern, resolution, config.solver.clone());

        info!(
            "calibration session: {} {}x{} spacing {}, {}..={} samples",
            config.pattern.pattern_type,
            config.pattern.cols(),
            config.pattern.rows(),
            config.pattern.spacing,
            config.min_samples,
            config.max_samples
        );

        Ok(CalibrationSession {
            samples: Vec::with_capacity(config.max_samples),
            config,
            worker,
            latest: Arc::new(Mutex::new(latest)),
            collected,
            refine_frame,
            last_timestamp: None,
            solver,
        })
    }

    /// Session using the built-in [`PatternDetector`] configured from
    /// `config.detector`.
    pub fn with_default_detector(config: CalibrationConfig) -> Result<Self, CalibrationError> {
        let detector = PatternDetector::new(config.detector.clone());
        Self::new(config, Box::new(detector))
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn worker_state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Moves a finished detection into the latest-result slot.
    ///
    /// The lock is only taken for the swap, never while detecting.
    fn publish_ready_result(&mut self) -> bool {
        if !self.worker.is_result_ready() {
            return false;
        }
        let Some(result) = self.worker.collect_result_into(&mut self.collected) else {
            return false;
        };
        let DetectionResult { found_all, points } = result;
        {
            let mut latest = self.latest.lock();
            latest.found_all = found_all;
            latest.points = points;
            std::mem::swap(&mut latest.frame, &mut self.collected);
        }
        debug!("latest result updated: found_all={}", found_all);
        true
    }

    /// Publishes any finished detection, then starts a detection on `luma`
    /// unless the worker is still busy. Returns whether the frame was taken;
    /// frames arriving while busy are dropped.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::FrameSizeMismatch`] if `luma` does not match the
    /// configured video size.
    pub fn submit_frame(&mut self, luma: &[u8]) -> Result<bool, CalibrationError> {
        self.publish_ready_result();
        if self.worker.is_busy() {
            return Ok(false);
        }
        self.worker.submit_and_start(luma)
    }

    /// One capture-loop cycle against a [`FrameSource`]: publishes a finished
    /// detection and, if the worker is idle, submits the newest frame not
    /// submitted before. Returns whether a frame was submitted.
    pub fn frame(&mut self, source: &mut dyn FrameSource) -> Result<bool, CalibrationError> {
        self.publish_ready_result();
        if self.worker.state() != WorkerState::Idle {
            return Ok(false);
        }

        let (timestamp, submitted) = match source.checkout_frame_if_newer_than(self.last_timestamp)
        {
            Some(frame) => (frame.timestamp, self.worker.submit_and_start(frame.luma)),
            None => return Ok(false),
        };
        source.checkin_frame();

        let submitted = submitted?;
        if submitted {
            self.last_timestamp = Some(timestamp);
        }
        Ok(submitted)
    }

    /// Blocks until the running detection (if any) finishes, then publishes
    /// it. Intended for offline processing; an interactive loop polls with
    /// [`CalibrationSession::submit_frame`] instead.
    pub fn wait_for_detection(&mut self, timeout: Duration) -> bool {
        self.worker.wait_for_result(timeout) && self.publish_ready_result()
    }

    /// Locks the latest result for reading. Hold the guard only as long as
    /// the frame and points are needed.
    pub fn fetch_latest_result_locked(&self) -> LatestResultGuard<'_> {
        LatestResultGuard {
            guard: self.latest.lock(),
        }
    }

    /// Deep copy of the latest result.
    pub fn latest_result(&self) -> LatestResult {
        self.latest.lock().clone()
    }

    pub fn shared_latest_result(&self) -> SharedLatestResult {
        SharedLatestResult(self.latest.clone())
    }

    /// Refines the latest detection and appends it as a sample.
    ///
    /// Returns `false` without changing anything when the sample list is full
    /// or the latest detection did not find the whole pattern.
    pub fn accept_current_result(&mut self) -> bool {
        if self.samples.len() >= self.config.max_samples {
            return false;
        }

        let mut points = {
            let latest = self.latest.lock();
            if !latest.found_all {
                return false;
            }
            self.refine_frame.copy_from(&latest.frame);
            latest.points.clone()
        };

        let expected = self.config.pattern.point_count();
        if points.len() != expected {
            warn!(
                "rejecting detection with {} points, pattern has {}",
                points.len(),
                expected
            );
            return false;
        }

        refine_corners(self.refine_frame.image(), &mut points, &self.config.refine);

        info!(
            "---- {}/{} ----",
            self.samples.len() + 1,
            self.config.max_samples
        );
        for (i, p) in points.iter().enumerate() {
            debug!("  {}: {:.3}, {:.3}", i + 1, p.x, p.y);
        }
        self.samples.push(points);
        true
    }

    /// Removes the most recent sample. Returns `false` if there is none.
    pub fn undo_last(&mut self) -> bool {
        if self.samples.pop().is_some() {
            info!("---- {}/{} ----", self.samples.len(), self.config.max_samples);
            true
        } else {
            false
        }
    }

    /// Removes every sample. Returns `false` if there is none.
    pub fn reset_all(&mut self) -> bool {
        if self.samples.is_empty() {
            return false;
        }
        self.samples.clear();
        info!("samples cleared");
        true
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn max_samples(&self) -> usize {
        self.config.max_samples
    }

    pub fn min_samples(&self) -> usize {
        self.config.min_samples
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.config.max_samples
    }

    pub fn samples(&self) -> &[Vec<Point2<f64>>] {
        &self.samples
    }

    /// Calibrates from every accepted sample. The samples are left untouched.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InsufficientSamples`] below `min_samples`, otherwise
    /// any solver failure.
    pub fn solve(&self) -> Result<(CameraParameters, ReprojectionErrors), CalibrationError> {
        if self.samples.len() < self.config.min_samples {
            return Err(CalibrationError::InsufficientSamples {
                required: self.config.min_samples,
                available: self.samples.len(),
            });
        }
        self.solver.solve(&self.samples)
    }
}
