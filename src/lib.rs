//! Camera Calibration Library
//!
//! Interactive intrinsic calibration of a single camera from a planar
//! target (chessboard, symmetric or asymmetric circle grid):
//! - a background corner finder that never blocks the capture loop
//! - a lock-protected latest-result snapshot for render threads
//! - a list of accepted, sub-pixel refined samples
//! - a batch least-squares solver built on the tiny-solver optimization
//!   framework, with size-factor normalized distortion parameters and
//!   per-sample reprojection statistics
//!
//! A typical loop:
//!
//! ```no_run
//! use calib_camera::{CalibrationConfig, CalibrationSession};
//!
//! # fn main() -> Result<(), calib_camera::CalibrationError> {
//! let config = CalibrationConfig::default();
//! let mut session = CalibrationSession::with_default_detector(config)?;
//! let luma = vec![0u8; 640 * 480];
//! session.submit_frame(&luma)?;
//! // ... later, on user request:
//! if session.accept_current_result() && session.is_full() {
//!     let (params, errors) = session.solve()?;
//!     println!("{:?} {:?}", params.intrinsics(), errors);
//! }
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod detection;
pub mod flow;
pub mod frame;
pub mod geometry;
pub mod optimization;
pub mod pattern;
pub mod session;
pub mod synthetic;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use camera::{CalibrationError, CameraParameters, Intrinsics, Resolution};
pub use config::CalibrationConfig;
pub use detection::{DetectionResult, DetectorOptions, FeatureExtractor, PatternDetector};
pub use flow::{CalibrationFlow, FlowEvent, FlowState, ResultSink};
pub use frame::{FrameBuffer, FrameSource, ImageSequenceSource, Timestamp};
pub use optimization::{
    CalibrationSolver, ErrorAverage, Optimizer, ReprojectionErrors, SolverOptions,
};
pub use pattern::{PatternSpec, PatternType};
pub use session::{CalibrationSession, LatestResult, LatestResultGuard};
pub use worker::{CornerFinderWorker, WorkerState};
