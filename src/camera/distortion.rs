//! Version-4 distortion model used by [`CameraParameters`](super::CameraParameters).
//!
//! The model is the OpenCV radial-tangential model with four coefficients,
//! expressed in pixel coordinates and normalized by a size factor `s`:
//!
//! ```text
//! x = (ix - cx) * s / fx            y = (iy - cy) * s / fy
//! l = x^2 + y^2
//! x' = x (1 + k1 l + k2 l^2) + 2 p1 x y + p2 (l + 2 x^2)
//! y' = y (1 + k1 l + k2 l^2) + p1 (l + 2 y^2) + 2 p2 x y
//! ox = fx x' + cx                   oy = fy y' + cy
//! ```
//!
//! `dist_factor` is always `[k1, k2, p1, p2, fx, fy, cx, cy, s]`.

use nalgebra::{Matrix2, Point2, Vector2};

use super::Resolution;

/// Tag written alongside parameters that use this model.
pub const DIST_FUNCTION_VERSION: u32 = 4;

/// Upper bound (and "nothing measured" sentinel) for [`size_factor`].
const SIZE_FACTOR_LIMIT: f64 = 100.0;

const UNDISTORT_MAX_ITERATIONS: usize = 20;
const UNDISTORT_EPS: f64 = 1e-10;

fn radtan(k1: f64, k2: f64, p1: f64, p2: f64, x: f64, y: f64) -> Vector2<f64> {
    let l = x * x + y * y;
    let radial = 1.0 + k1 * l + k2 * l * l;
    Vector2::new(
        x * radial + 2.0 * p1 * x * y + p2 * (l + 2.0 * x * x),
        y * radial + p1 * (l + 2.0 * y * y) + 2.0 * p2 * x * y,
    )
}

/// Maps an ideal (undistorted) pixel to the pixel where the camera observes it.
pub fn ideal_to_observed(dist_factor: &[f64; 9], ideal: &Point2<f64>) -> Point2<f64> {
    let [k1, k2, p1, p2, fx, fy, cx, cy, s] = *dist_factor;

    let x = (ideal.x - cx) * s / fx;
    let y = (ideal.y - cy) * s / fy;
    let d = radtan(k1, k2, p1, p2, x, y);

    Point2::new(fx * d.x + cx, fy * d.y + cy)
}

/// Inverse of [`ideal_to_observed`], solved with Newton iterations on the
/// normalized coordinates.
///
/// With all distortion coefficients equal to zero the input is returned
/// unchanged.
pub fn observed_to_ideal(dist_factor: &[f64; 9], observed: &Point2<f64>) -> Point2<f64> {
    let [k1, k2, p1, p2, fx, fy, cx, cy, s] = *dist_factor;

    if k1 == 0.0 && k2 == 0.0 && p1 == 0.0 && p2 == 0.0 {
        return *observed;
    }

    let target = Vector2::new((observed.x - cx) / fx, (observed.y - cy) / fy);
    let mut point = target;

    for _ in 0..UNDISTORT_MAX_ITERATIONS {
        let (x, y) = (point.x, point.y);
        let error = radtan(k1, k2, p1, p2, x, y) - target;
        if error.norm() < UNDISTORT_EPS {
            break;
        }

        let l = x * x + y * y;
        let radial = 1.0 + k1 * l + k2 * l * l;
        let d_radial = k1 + 2.0 * k2 * l;

        let j00 = radial + 2.0 * x * x * d_radial + 2.0 * p1 * y + 6.0 * p2 * x;
        let j01 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
        let j10 = 2.0 * x * y * d_radial + 2.0 * p1 * x + 2.0 * p2 * y;
        let j11 = radial + 2.0 * y * y * d_radial + 6.0 * p1 * y + 2.0 * p2 * x;

        let jacobian = Matrix2::new(j00, j01, j10, j11);
        match jacobian.try_inverse() {
            Some(inv) => point -= inv * error,
            None => break,
        }
    }

    Point2::new(point.x * fx / s + cx, point.y * fy / s + cy)
}

/// Ratio of the ideal to the observed distance from the principal point
/// `c` to the image edge at `edge` (`0` or `extent`), both measured
/// outwards. Only a positive ideal distance yields a ratio; an observed
/// distance that is not positive (principal point outside the image) yields
/// none either.
fn edge_ratio(edge: f64, c: f64, ideal: f64, extent: f64) -> Option<f64> {
    let (olen, ilen) = if edge < extent {
        (c - edge, c - ideal)
    } else {
        (edge - c, ideal - c)
    };
    (ilen > 0.0 && olen > 0.0).then(|| ilen / olen)
}

/// Computes the scale that keeps the undistorted image inside the sensor.
///
/// Eight boundary samples (four edge midpoints through the principal point
/// and the four image corners) are undistorted and, per axis, the ratio of
/// the undistorted to the distorted distance from the principal point is
/// taken, skipping directions whose undistorted distance is not positive.
/// The factor is the smallest ratio below `SIZE_FACTOR_LIMIT`, or `1.0` when
/// no ratio qualifies.
///
/// `dist_factor[8]` is expected to be `1.0` (unscaled) when this is called.
pub fn size_factor(dist_factor: &[f64; 9], resolution: &Resolution) -> f64 {
    let cx = dist_factor[6];
    let cy = dist_factor[7];
    let w = resolution.width as f64;
    let h = resolution.height as f64;

    // `None` on an axis means the sample sits on the principal point row or
    // column and that axis carries no ratio.
    let samples: [(Option<f64>, Option<f64>); 8] = [
        (Some(0.0), None),
        (Some(w), None),
        (None, Some(0.0)),
        (None, Some(h)),
        (Some(0.0), Some(0.0)),
        (Some(w), Some(0.0)),
        (Some(0.0), Some(h)),
        (Some(w), Some(h)),
    ];

    let mut factor = SIZE_FACTOR_LIMIT;
    for (sx, sy) in samples {
        let observed = Point2::new(sx.unwrap_or(cx), sy.unwrap_or(cy));
        let ideal = observed_to_ideal(dist_factor, &observed);

        let along_x = sx.and_then(|sx| edge_ratio(sx, cx, ideal.x, w));
        let along_y = sy.and_then(|sy| edge_ratio(sy, cy, ideal.y, h));
        for ratio in along_x.into_iter().chain(along_y) {
            if ratio < factor {
                factor = ratio;
            }
        }
    }

    if factor == SIZE_FACTOR_LIMIT {
        1.0
    } else {
        factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const RES: Resolution = Resolution {
        width: 640,
        height: 480,
    };

    fn dist(k1: f64, k2: f64, p1: f64, p2: f64, s: f64) -> [f64; 9] {
        [k1, k2, p1, p2, 800.0, 790.0, 322.0, 238.0, s]
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        let d = dist(0.0, 0.0, 0.0, 0.0, 1.0);
        let p = Point2::new(17.25, 401.5);
        assert_eq!(observed_to_ideal(&d, &p), p);
        let q = ideal_to_observed(&d, &p);
        assert_relative_eq!(q.x, p.x, epsilon = 1e-12);
        assert_relative_eq!(q.y, p.y, epsilon = 1e-12);
        assert_eq!(size_factor(&d, &RES), 1.0);
    }

    #[test]
    fn test_observed_to_ideal_inverts_forward_model() {
        for s in [1.0, 0.93, 1.12] {
            let d = dist(-0.28, 0.07, 0.0012, -0.0008, s);
            for &(x, y) in &[(10.0, 12.0), (320.0, 240.0), (600.0, 30.0), (150.0, 455.0)] {
                let observed = Point2::new(x, y);
                let ideal = observed_to_ideal(&d, &observed);
                let back = ideal_to_observed(&d, &ideal);
                assert_relative_eq!(back.x, observed.x, epsilon = 1e-6);
                assert_relative_eq!(back.y, observed.y, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_principal_point_is_fixed() {
        let d = dist(-0.3, 0.1, 0.0, 0.0, 0.9);
        let c = Point2::new(322.0, 238.0);
        let o = ideal_to_observed(&d, &c);
        assert_relative_eq!(o.x, c.x, epsilon = 1e-12);
        assert_relative_eq!(o.y, c.y, epsilon = 1e-12);
    }

    #[test]
    fn test_barrel_distortion_size_factor() {
        // Barrel distortion pulls observed pixels inwards, so undistorting the
        // image border moves it outwards and every ratio exceeds one.
        let d = dist(-0.25, 0.0, 0.0, 0.0, 1.0);
        let s = size_factor(&d, &RES);
        assert!(s > 1.0, "expected s > 1 for barrel distortion, got {}", s);
        assert!(s < SIZE_FACTOR_LIMIT);

        // The factor is the smallest axis ratio, which is reached on the edge
        // midpoints where only one axis contributes.
        let left = observed_to_ideal(&d, &Point2::new(0.0, 238.0));
        let expected_left = (left.x - 322.0) / (0.0 - 322.0);
        assert!(s <= expected_left + 1e-12);
    }

    #[test]
    fn test_pincushion_distortion_size_factor() {
        let d = dist(0.2, 0.0, 0.0, 0.0, 1.0);
        let s = size_factor(&d, &RES);
        assert!(s > 0.0 && s < 1.0, "expected 0 < s < 1, got {}", s);
    }

    #[test]
    fn test_edge_ratio_requires_positive_ideal_distance() {
        // Left edge, principal point at 322: ideal pushed out to -10.
        assert_relative_eq!(edge_ratio(0.0, 322.0, -10.0, 640.0).unwrap(), 332.0 / 322.0);
        // Right edge pulled in to 600.
        assert_relative_eq!(edge_ratio(640.0, 322.0, 600.0, 640.0).unwrap(), 278.0 / 318.0);
        // Undistorted point crossed over the principal point.
        assert!(edge_ratio(640.0, 322.0, 300.0, 640.0).is_none());
        // Both distances negative: the quotient is positive but the direction
        // has no ideal extent.
        assert!(edge_ratio(0.0, -10.0, -12.0, 640.0).is_none());
    }

    #[test]
    fn test_principal_point_outside_image() {
        let mut d = dist(0.0, 0.0, 0.0, 0.0, 1.0);
        d[6] = -10.0;
        let s = size_factor(&d, &RES);
        assert!(s.is_finite() && s > 0.0);
        assert_relative_eq!(s, 1.0, epsilon = 1e-12);

        d[0] = -0.2;
        let s = size_factor(&d, &RES);
        assert!(s.is_finite() && s > 0.0, "got {}", s);
    }
}
