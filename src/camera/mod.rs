//! Camera parameter types produced by calibration.
//!
//! [`CameraParameters`] mirrors the layout that ARToolKit-style trackers
//! consume: a 3x4 projection matrix, a 9-value normalized distortion vector
//! `[k1, k2, p1, p2, fx, fy, cx, cy, s]` and a distortion-function version tag.
//! The focal entries of the matrix are divided by the size factor `s` so that
//! undistorted images never extrapolate past the sensor bounds.

use nalgebra::{Matrix3, Matrix3x4, Point2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

pub mod distortion;
pub mod param_file;

pub use distortion::DIST_FUNCTION_VERSION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },
    #[error("Failed to allocate {bytes} bytes for a frame buffer")]
    AllocationFailed { bytes: usize },
    #[error("Not enough samples: {available} accepted, {required} required")]
    InsufficientSamples { required: usize, available: usize },
    #[error("Numerical error: {0}")]
    NumericalError(String),
    #[error("Calibration produced non-finite values: {0}")]
    NonFiniteResult(String),
    #[error("Focal length must be positive")]
    FocalLengthMustBePositive,
    #[error("Failed to start corner finder worker: {0}")]
    WorkerSpawn(String),
    #[error("Invalid camera parameter file: {0}")]
    InvalidParamFile(String),
    #[error("Failed to process YAML: {0}")]
    YamlError(String),
    #[error("Failed to process JSON: {0}")]
    JsonError(String),
    #[error("Failed to write CSV: {0}")]
    CsvError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::YamlError(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::JsonError(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        CalibrationError::CsvError(err.to_string())
    }
}

/// Calibrated camera model in normalized (size-factor scaled) form.
///
/// Produced once per solve and never mutated afterwards. Serializes
/// losslessly to the binary `.dat` layout as well as YAML and JSON, see
/// [`param_file`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraParameters {
    /// Image size the parameters were calibrated for.
    pub resolution: Resolution,
    /// 3x4 projection matrix, row major, with `fx`/`fy` (and the skew pair)
    /// divided by the size factor.
    pub mat: [[f64; 4]; 3],
    /// `[k1, k2, p1, p2, fx, fy, cx, cy, s]`, with `fx`/`fy` unscaled.
    pub dist_factor: [f64; 9],
    /// Distortion model tag; always [`DIST_FUNCTION_VERSION`] for parameters
    /// produced by this crate.
    pub dist_function_version: u32,
}

impl CameraParameters {
    /// Builds normalized parameters from a raw calibration result.
    ///
    /// `distortion` is `[k1, k2, p1, p2]`. The size factor is computed with the
    /// unscaled distortion model and then folded into the projection matrix.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::NonFiniteResult`] if any input is NaN or
    /// infinite, or [`CalibrationError::FocalLengthMustBePositive`] for a
    /// degenerate focal length.
    pub fn from_calibration(
        resolution: Resolution,
        intrinsic: &Matrix3<f64>,
        distortion: [f64; 4],
    ) -> Result<Self, CalibrationError> {
        if intrinsic.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFiniteResult(
                "intrinsic matrix".to_string(),
            ));
        }
        if distortion.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFiniteResult(
                "distortion coefficients".to_string(),
            ));
        }

        let mut mat = [[0.0; 4]; 3];
        for (j, row) in mat.iter_mut().enumerate() {
            for (i, value) in row.iter_mut().take(3).enumerate() {
                *value = intrinsic[(j, i)];
            }
        }

        let mut dist_factor = [
            distortion[0],
            distortion[1],
            distortion[2],
            distortion[3],
            intrinsic[(0, 0)],
            intrinsic[(1, 1)],
            intrinsic[(0, 2)],
            intrinsic[(1, 2)],
            1.0,
        ];

        let s = distortion::size_factor(&dist_factor, &resolution);
        mat[0][0] /= s;
        mat[0][1] /= s;
        mat[1][0] /= s;
        mat[1][1] /= s;
        dist_factor[8] = s;

        let params = CameraParameters {
            resolution,
            mat,
            dist_factor,
            dist_function_version: DIST_FUNCTION_VERSION,
        };
        params.validate_params()?;
        Ok(params)
    }

    /// The (size-factor scaled) 3x3 intrinsic part of the projection matrix.
    pub fn intrinsic_matrix(&self) -> Matrix3<f64> {
        Matrix3::from_fn(|r, c| self.mat[r][c])
    }

    pub fn projection_matrix(&self) -> Matrix3x4<f64> {
        Matrix3x4::from_fn(|r, c| self.mat[r][c])
    }

    /// Unscaled intrinsics as estimated by the solver.
    pub fn intrinsics(&self) -> Intrinsics {
        Intrinsics {
            fx: self.dist_factor[4],
            fy: self.dist_factor[5],
            cx: self.dist_factor[6],
            cy: self.dist_factor[7],
        }
    }

    /// `[k1, k2, p1, p2]`
    pub fn distortion(&self) -> [f64; 4] {
        [
            self.dist_factor[0],
            self.dist_factor[1],
            self.dist_factor[2],
            self.dist_factor[3],
        ]
    }

    pub fn size_factor(&self) -> f64 {
        self.dist_factor[8]
    }

    pub fn ideal_to_observed(&self, ideal: &Point2<f64>) -> Point2<f64> {
        distortion::ideal_to_observed(&self.dist_factor, ideal)
    }

    pub fn observed_to_ideal(&self, observed: &Point2<f64>) -> Point2<f64> {
        distortion::observed_to_ideal(&self.dist_factor, observed)
    }

    /// Projects a point in camera coordinates through the projection matrix
    /// and the forward distortion model.
    ///
    /// Returns `None` when the homogeneous depth is exactly zero.
    pub fn project(&self, point_camera: &Vector3<f64>) -> Option<Point2<f64>> {
        let h = self.projection_matrix() * Vector4::new(point_camera.x, point_camera.y, point_camera.z, 1.0);
        if h.z == 0.0 {
            return None;
        }
        let ideal = Point2::new(h.x / h.z, h.y / h.z);
        Some(self.ideal_to_observed(&ideal))
    }

    /// Validates that every value is finite and the focal lengths are positive.
    pub fn validate_params(&self) -> Result<(), CalibrationError> {
        if self.mat.iter().flatten().any(|v| !v.is_finite())
            || self.dist_factor.iter().any(|v| !v.is_finite())
        {
            return Err(CalibrationError::NonFiniteResult(
                "camera parameters".to_string(),
            ));
        }
        validation::validate_intrinsics(&self.intrinsics())?;
        if self.dist_factor[8] <= 0.0 {
            return Err(CalibrationError::InvalidParams(format!(
                "size factor must be positive, got {}",
                self.dist_factor[8]
            )));
        }
        Ok(())
    }
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_intrinsics(intrinsics: &Intrinsics) -> Result<(), CalibrationError> {
        if !intrinsics.fx.is_finite() || !intrinsics.fy.is_finite() {
            return Err(CalibrationError::NonFiniteResult("focal length".to_string()));
        }
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(CalibrationError::FocalLengthMustBePositive);
        }
        if !intrinsics.cx.is_finite() || !intrinsics.cy.is_finite() {
            return Err(CalibrationError::NonFiniteResult(
                "principal point".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_intrinsic() -> Matrix3<f64> {
        Matrix3::new(800.0, 0.0, 322.0, 0.0, 790.0, 238.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn test_undistorted_parameters_keep_matrix() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let params =
            CameraParameters::from_calibration(resolution, &sample_intrinsic(), [0.0; 4]).unwrap();

        assert_eq!(params.size_factor(), 1.0);
        assert_eq!(params.dist_function_version, 4);
        assert_eq!(params.mat[0][0], 800.0);
        assert_eq!(params.mat[1][1], 790.0);
        assert_eq!(params.mat[0][2], 322.0);
        assert_eq!(params.mat[2][3], 0.0);
        assert_eq!(params.dist_factor[4..8], [800.0, 790.0, 322.0, 238.0]);
    }

    #[test]
    fn test_barrel_distortion_scales_focal_length() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let params = CameraParameters::from_calibration(
            resolution,
            &sample_intrinsic(),
            [-0.25, 0.05, 0.0, 0.0],
        )
        .unwrap();

        let s = params.size_factor();
        assert!(s > 0.0 && s != 1.0, "unexpected size factor {}", s);
        assert_relative_eq!(params.mat[0][0] * s, 800.0, epsilon = 1e-9);
        assert_relative_eq!(params.mat[1][1] * s, 790.0, epsilon = 1e-9);
        // Principal point and unscaled intrinsics are untouched.
        assert_eq!(params.mat[0][2], 322.0);
        assert_eq!(params.intrinsics().fx, 800.0);
    }

    #[test]
    fn test_project_is_consistent_with_scaled_matrix() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let params = CameraParameters::from_calibration(
            resolution,
            &sample_intrinsic(),
            [-0.2, 0.03, 0.001, -0.0005],
        )
        .unwrap();

        // The scaled matrix and the size factor cancel out, so projection
        // matches the plain rad-tan model with the unscaled intrinsics.
        let p = Vector3::new(0.1, -0.05, 1.0);
        let projected = params.project(&p).unwrap();

        let (x, y) = (0.1, -0.05);
        let r2: f64 = x * x + y * y;
        let radial = 1.0 - 0.2 * r2 + 0.03 * r2 * r2;
        let xd = x * radial + 2.0 * 0.001 * x * y + (-0.0005) * (r2 + 2.0 * x * x);
        let yd = y * radial + 0.001 * (r2 + 2.0 * y * y) + 2.0 * (-0.0005) * x * y;
        assert_relative_eq!(projected.x, 800.0 * xd + 322.0, epsilon = 1e-9);
        assert_relative_eq!(projected.y, 790.0 * yd + 238.0, epsilon = 1e-9);
    }

    #[test]
    fn test_non_finite_calibration_is_rejected() {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let mut k = sample_intrinsic();
        k[(0, 0)] = f64::NAN;
        let result = CameraParameters::from_calibration(resolution, &k, [0.0; 4]);
        assert!(matches!(result, Err(CalibrationError::NonFiniteResult(_))));

        let result =
            CameraParameters::from_calibration(resolution, &sample_intrinsic(), [f64::INFINITY, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(CalibrationError::NonFiniteResult(_))));
    }
}
