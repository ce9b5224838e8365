//! Closed-form starting point for the planar calibration.
//!
//! Focal lengths come from the orthogonality constraints of the plane
//! homographies with the principal point fixed at the image centre; each
//! pose is then decomposed from its homography.

use nalgebra::{DMatrix, DVector, Matrix3, Point2, Vector3};

use crate::camera::{CalibrationError, Resolution};
use crate::geometry::{estimate_homography, matrix_to_rodrigues, nearest_rotation};

/// Rodrigues rotation and translation of one target view.
pub type Pose = (Vector3<f64>, Vector3<f64>);

/// Plane-to-image homography of every sample.
pub fn sample_homographies(
    object_xy: &[Point2<f64>],
    samples: &[Vec<Point2<f64>>],
) -> Result<Vec<Matrix3<f64>>, CalibrationError> {
    samples
        .iter()
        .enumerate()
        .map(|(k, points)| {
            estimate_homography(object_xy, points).ok_or_else(|| {
                CalibrationError::NumericalError(format!(
                    "homography estimation failed for sample {k}"
                ))
            })
        })
        .collect()
}

/// Estimates `fx`, `fy` from two constraints per homography, with the
/// principal point at the image centre and zero skew.
pub fn initial_intrinsics(
    homographies: &[Matrix3<f64>],
    resolution: &Resolution,
) -> Result<Matrix3<f64>, CalibrationError> {
    if homographies.is_empty() {
        return Err(CalibrationError::InsufficientSamples {
            required: 1,
            available: 0,
        });
    }

    let cx = (resolution.width as f64 - 1.0) * 0.5;
    let cy = (resolution.height as f64 - 1.0) * 0.5;
    let shift = Matrix3::new(1.0, 0.0, -cx, 0.0, 1.0, -cy, 0.0, 0.0, 1.0);

    let n = homographies.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 2);
    let mut b = DVector::<f64>::zeros(2 * n);

    for (k, h) in homographies.iter().enumerate() {
        let hc = shift * h;
        let col0: Vector3<f64> = hc.column(0).into_owned();
        let col1: Vector3<f64> = hc.column(1).into_owned();

        let normalized = |v: Vector3<f64>| {
            let norm = v.norm();
            if norm > 0.0 {
                v / norm
            } else {
                v
            }
        };
        let h1 = normalized(col0);
        let v1 = normalized(col1);
        let d1 = normalized((col0 + col1) * 0.5);
        let d2 = normalized((col0 - col1) * 0.5);

        a[(2 * k, 0)] = h1.x * v1.x;
        a[(2 * k, 1)] = h1.y * v1.y;
        b[2 * k] = -h1.z * v1.z;
        a[(2 * k + 1, 0)] = d1.x * d2.x;
        a[(2 * k + 1, 1)] = d1.y * d2.y;
        b[2 * k + 1] = -d1.z * d2.z;
    }

    let svd = a.svd(true, true);
    let f = svd.solve(&b, 1e-15).map_err(|e| {
        CalibrationError::NumericalError(format!("focal length solve failed: {e}"))
    })?;

    let fx = (1.0 / f[0]).abs().sqrt();
    let fy = (1.0 / f[1]).abs().sqrt();
    if !fx.is_finite() || !fy.is_finite() || fx <= 0.0 || fy <= 0.0 {
        return Err(CalibrationError::NumericalError(format!(
            "degenerate initial focal length ({fx}, {fy}); are all views parallel to the sensor?"
        )));
    }

    Ok(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
}

/// Decomposes `H = K [r1 r2 t]` into a pose with the target in front of the
/// camera.
pub fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Option<Pose> {
    let k_inv = k.try_inverse()?;
    let m = k_inv * h;
    let c0: Vector3<f64> = m.column(0).into_owned();
    let c1: Vector3<f64> = m.column(1).into_owned();
    let c2: Vector3<f64> = m.column(2).into_owned();

    let norm = 0.5 * (c0.norm() + c1.norm());
    if norm < 1e-12 {
        return None;
    }
    let mut lambda = 1.0 / norm;
    if c2.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = c0 * lambda;
    let r2 = c1 * lambda;
    let r3 = r1.cross(&r2);
    let t = c2 * lambda;

    let r = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]))?;
    let rvec = matrix_to_rodrigues(&r);
    if !rvec.iter().chain(t.iter()).all(|v| v.is_finite()) {
        return None;
    }
    Some((rvec, t))
}
