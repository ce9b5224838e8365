//! The `optimization` module turns accepted pattern observations into
//! [`CameraParameters`].
//!
//! The [`Optimizer`] trait is the common interface of a calibration problem:
//! a linear estimation step that produces a starting point, followed by a
//! non-linear Levenberg-Marquardt refinement with `tiny_solver`.
//! [`PlanarCalibrationCost`] implements it for a planar target observed in
//! several views.
//!
//! [`CalibrationSolver`] runs the whole batch: it builds the object-point
//! template from the [`PatternSpec`], optimizes, normalizes the result with
//! the size factor and reports per-sample reprojection statistics.

use log::{info, warn};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

pub mod init;
pub mod planar;

pub use init::Pose;
pub use planar::PlanarCalibrationCost;

use crate::camera::{CalibrationError, CameraParameters, Intrinsics, Resolution};
use crate::geometry::rodrigues_to_matrix;
use crate::pattern::PatternSpec;

/// A trait for camera calibration optimization tasks.
///
/// Types implementing `Optimizer` own a set of 3D-2D correspondences and a
/// current parameter estimate that is refined in place.
pub trait Optimizer {
    /// Performs non-linear optimization to refine the camera parameters.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress is logged at `info` level.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - If the optimization was successful and the parameters
    ///   have been updated.
    /// * `Err(CalibrationError)` - If the solver failed or produced
    ///   non-finite or degenerate parameters.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Computes a starting point for [`Optimizer::optimize`] in closed form.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;

    fn get_intrinsics(&self) -> Intrinsics;

    fn get_resolution(&self) -> Resolution;

    /// Distortion coefficients; for rad-tan these are `[k1, k2, p1, p2]`.
    fn get_distortion(&self) -> Vec<f64>;
}

/// Divisor used for the average reprojection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorAverage {
    /// Sum of per-sample errors divided by `N + 1`. Matches the statistics
    /// reported by existing calibration files.
    #[default]
    SampleCountPlusOne,
    /// Plain mean over the `N` samples.
    SampleCount,
}

impl ErrorAverage {
    fn divisor(self, samples: usize) -> f64 {
        match self {
            ErrorAverage::SampleCountPlusOne => (samples + 1) as f64,
            ErrorAverage::SampleCount => samples.max(1) as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub average: ErrorAverage,
    /// Levenberg-Marquardt iteration cap.
    pub max_iterations: usize,
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            average: ErrorAverage::default(),
            max_iterations: 100,
            verbose: false,
        }
    }
}

/// Per-sample reprojection error statistics, in pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionErrors {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
    /// `sqrt(sum of squared errors / points)` for every sample, in capture
    /// order.
    pub per_sample: Vec<f64>,
}

/// Reprojection statistics of `params` over all samples.
///
/// Every object point is moved into the camera frame with the sample's pose
/// and projected through the normalized parameters, including the forward
/// distortion.
pub fn reprojection_errors(
    params: &CameraParameters,
    object: &[Point3<f64>],
    samples: &[Vec<Point2<f64>>],
    poses: &[Pose],
    average: ErrorAverage,
) -> Result<ReprojectionErrors, CalibrationError> {
    if samples.len() != poses.len() {
        return Err(CalibrationError::InvalidParams(format!(
            "{} samples but {} poses",
            samples.len(),
            poses.len()
        )));
    }

    let mut per_sample = Vec::with_capacity(samples.len());
    let mut min = f64::INFINITY;
    let mut max = 0.0_f64;
    let mut sum = 0.0;

    for (k, (sample, (rvec, t))) in samples.iter().zip(poses.iter()).enumerate() {
        let r = rodrigues_to_matrix(rvec);
        let mut sum_sq = 0.0;
        for (obj, obs) in object.iter().zip(sample.iter()) {
            let pc = r * obj.coords + t;
            let projected = params.project(&pc).ok_or_else(|| {
                CalibrationError::NumericalError(format!(
                    "sample {k}: object point projects to infinity"
                ))
            })?;
            sum_sq += (projected - obs).norm_squared();
        }
        let err = (sum_sq / sample.len().max(1) as f64).sqrt();
        info!("Err[{}]: {:.6} [pixel]", k, err);

        min = min.min(err);
        max = max.max(err);
        sum += err;
        per_sample.push(err);
    }

    if per_sample.is_empty() {
        min = 0.0;
    }

    Ok(ReprojectionErrors {
        min,
        avg: sum / average.divisor(samples.len()),
        max,
        per_sample,
    })
}

/// Batch calibration of one camera from planar pattern observations.
#[derive(Debug, Clone)]
pub struct CalibrationSolver {
    pattern: PatternSpec,
    resolution: Resolution,
    options: SolverOptions,
}

impl CalibrationSolver {
    pub fn new(pattern: PatternSpec, resolution: Resolution, options: SolverOptions) -> Self {
        CalibrationSolver {
            pattern,
            resolution,
            options,
        }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Solves for intrinsics, four distortion coefficients and one pose per
    /// sample, and returns the normalized parameters with their reprojection
    /// statistics.
    ///
    /// `samples` are not modified; calling this twice with the same input
    /// gives the same result.
    ///
    /// # Errors
    ///
    /// Fails with [`CalibrationError::NonFiniteResult`] or
    /// [`CalibrationError::NumericalError`] instead of returning unusable
    /// parameters.
    pub fn solve(
        &self,
        samples: &[Vec<Point2<f64>>],
    ) -> Result<(CameraParameters, ReprojectionErrors), CalibrationError> {
        if samples.len() < 3 {
            warn!(
                "calibrating from {} sample(s); the result is likely ill-conditioned",
                samples.len()
            );
        }

        let object = self.pattern.object_points();
        let mut cost = PlanarCalibrationCost::new(
            self.resolution,
            object.clone(),
            samples.to_vec(),
            self.options.max_iterations,
        )?;
        cost.linear_estimation()?;
        cost.optimize(self.options.verbose)?;

        let distortion: [f64; 4] = cost.get_distortion().try_into().map_err(|d: Vec<f64>| {
            CalibrationError::NumericalError(format!("expected 4 distortion coefficients, got {}", d.len()))
        })?;
        info!(
            "calibration rms {:.6} [pixel], intrinsics {:?}, distortion {:?}",
            cost.rms_error(),
            cost.get_intrinsics(),
            distortion
        );

        let params =
            CameraParameters::from_calibration(self.resolution, &cost.intrinsic_matrix(), distortion)?;
        info!(
            "normalized parameters: size factor {:.6}, dist_factor {:?}",
            params.size_factor(),
            params.dist_factor
        );

        let errors = reprojection_errors(&params, &object, samples, cost.poses(), self.options.average)?;
        info!(
            "Error: min {:.6}, avg {:.6}, max {:.6} [pixel]",
            errors.min, errors.avg, errors.max
        );
        Ok((params, errors))
    }
}
