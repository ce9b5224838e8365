//! Synthetic calibration data: rendered pattern images and analytic views.
//!
//! Used by the tests and the demos to exercise detection and calibration
//! against a camera whose parameters are known exactly.

use std::f64::consts::PI;

use image::{GrayImage, Luma};
use nalgebra::{Isometry3, Matrix3, Point2, Point3, Translation3, UnitQuaternion, Vector3};

use crate::camera::Resolution;
use crate::pattern::{PatternSpec, PatternType};

const DARK: f64 = 30.0;
const LIGHT: f64 = 220.0;
const SUPERSAMPLING: u32 = 4;
/// Circle radius in units of the pattern spacing.
const CIRCLE_RADIUS: f64 = 0.3;

/// A pinhole camera with optional rad-tan distortion `[k1, k2, p1, p2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticCamera {
    pub intrinsics: Matrix3<f64>,
    pub distortion: [f64; 4],
    pub resolution: Resolution,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        SyntheticCamera {
            intrinsics: Matrix3::new(800.0, 0.0, 322.0, 0.0, 800.0, 238.0, 0.0, 0.0, 1.0),
            distortion: [0.0; 4],
            resolution: Resolution {
                width: 640,
                height: 480,
            },
        }
    }
}

fn pattern_centre(spec: &PatternSpec) -> Point3<f64> {
    let pts = spec.object_points();
    let (mut min_x, mut max_x, mut min_y, mut max_y) =
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
    for p in &pts {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    Point3::new(0.5 * (min_x + max_x), 0.5 * (min_y + max_y), 0.0)
}

impl SyntheticCamera {
    /// Pose (object to camera) that rotates the target by the given roll,
    /// pitch and yaw and places its centre on the optical axis at `distance`.
    pub fn look_at_board(
        &self,
        spec: &PatternSpec,
        roll: f64,
        pitch: f64,
        yaw: f64,
        distance: f64,
    ) -> Isometry3<f64> {
        let rotation = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
        let centre = pattern_centre(spec);
        let t = Vector3::new(0.0, 0.0, distance) - rotation * centre.coords;
        Isometry3::from_parts(Translation3::from(t), rotation)
    }

    /// `count` well-spread poses, varying tilt direction, in-plane rotation
    /// and distance.
    pub fn views(&self, spec: &PatternSpec, count: usize, distance: f64) -> Vec<Isometry3<f64>> {
        (0..count)
            .map(|k| {
                let a = 2.0 * PI * k as f64 / count.max(1) as f64;
                self.look_at_board(
                    spec,
                    0.3 * a.cos(),
                    0.3 * a.sin(),
                    0.1 * (2.0 * a).sin(),
                    distance * (1.0 + 0.08 * (k % 3) as f64),
                )
            })
            .collect()
    }

    /// Homography from the target plane (object units) to pixels. Ignores
    /// lens distortion.
    pub fn board_homography(&self, pose: &Isometry3<f64>) -> Matrix3<f64> {
        let r = pose.rotation.to_rotation_matrix().into_inner();
        let t = pose.translation.vector;
        let rt = Matrix3::from_columns(&[r.column(0).into_owned(), r.column(1).into_owned(), t]);
        self.intrinsics * rt
    }

    pub fn project(&self, pose: &Isometry3<f64>, point: &Point3<f64>) -> Point2<f64> {
        let pc = pose * point;
        let x = pc.x / pc.z;
        let y = pc.y / pc.z;
        let [k1, k2, p1, p2] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        let k = &self.intrinsics;
        Point2::new(
            k[(0, 0)] * xd + k[(0, 1)] * yd + k[(0, 2)],
            k[(1, 1)] * yd + k[(1, 2)],
        )
    }

    /// Image positions of every pattern feature, in pattern order.
    pub fn project_pattern(&self, spec: &PatternSpec, pose: &Isometry3<f64>) -> Vec<Point2<f64>> {
        spec.object_points()
            .iter()
            .map(|p| self.project(pose, p))
            .collect()
    }

    /// Renders the target as seen from `pose` (distortion-free).
    pub fn render(&self, spec: &PatternSpec, pose: &Isometry3<f64>) -> GrayImage {
        render_pattern(
            spec,
            &self.board_homography(pose),
            self.resolution.width,
            self.resolution.height,
        )
    }
}

/// Whether a target point, given in units of the pattern spacing, is dark.
fn is_dark(spec: &PatternSpec, u: f64, v: f64) -> bool {
    let (cols, rows) = (spec.cols() as f64, spec.rows() as f64);
    match spec.pattern_type {
        PatternType::Chessboard => {
            // Inner corners sit on integer positions, so squares span
            // [-1, cols] x [-1, rows].
            if u < -1.0 || v < -1.0 || u >= cols || v >= rows {
                return false;
            }
            (u.floor() as i64 + v.floor() as i64).rem_euclid(2) == 0
        }
        PatternType::CirclesGrid => {
            let (i, j) = (u.round(), v.round());
            if i < 0.0 || j < 0.0 || i >= cols || j >= rows {
                return false;
            }
            (u - i).powi(2) + (v - j).powi(2) < CIRCLE_RADIUS * CIRCLE_RADIUS
        }
        PatternType::AsymmetricCirclesGrid => {
            let j = v.round();
            if j < 0.0 || j >= rows {
                return false;
            }
            let offset = (j as i64 % 2) as f64;
            let i = ((u - offset) / 2.0).round();
            if i < 0.0 || i >= cols {
                return false;
            }
            let x = 2.0 * i + offset;
            (u - x).powi(2) + (v - j).powi(2) < CIRCLE_RADIUS * CIRCLE_RADIUS
        }
    }
}

/// Renders `spec` through the plane-to-image homography `h` with 4x4
/// supersampling. Pixel centres are at integer coordinates.
pub fn render_pattern(spec: &PatternSpec, h: &Matrix3<f64>, width: u32, height: u32) -> GrayImage {
    let Some(h_inv) = h.try_inverse() else {
        return GrayImage::from_pixel(width, height, Luma([LIGHT as u8]));
    };
    let n = SUPERSAMPLING;
    let step = 1.0 / n as f64;

    GrayImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..n {
            for sx in 0..n {
                let px = x as f64 - 0.5 + (sx as f64 + 0.5) * step;
                let py = y as f64 - 0.5 + (sy as f64 + 0.5) * step;
                let q = h_inv * Vector3::new(px, py, 1.0);
                let dark = q.z.abs() > 1e-12 && {
                    let u = q.x / q.z / spec.spacing;
                    let v = q.y / q.z / spec.spacing;
                    is_dark(spec, u, v)
                };
                acc += if dark { DARK } else { LIGHT };
            }
        }
        Luma([(acc / (n * n) as f64).round() as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::apply_homography;
    use approx::assert_relative_eq;

    #[test]
    fn test_board_centre_projects_to_principal_point() {
        let camera = SyntheticCamera::default();
        let spec = PatternType::Chessboard.default_spec();
        let pose = camera.look_at_board(&spec, 0.2, -0.1, 0.3, 500.0);
        let c = camera.project(&pose, &Point3::new(90.0, 60.0, 0.0));
        assert_relative_eq!(c.x, 322.0, epsilon = 1e-9);
        assert_relative_eq!(c.y, 238.0, epsilon = 1e-9);
    }

    #[test]
    fn test_homography_matches_projection() {
        let camera = SyntheticCamera::default();
        let spec = PatternType::AsymmetricCirclesGrid.default_spec();
        let pose = camera.look_at_board(&spec, 0.1, 0.25, -0.2, 450.0);
        let h = camera.board_homography(&pose);
        for (obj, img) in spec.object_points().iter().zip(camera.project_pattern(&spec, &pose)) {
            let p = apply_homography(&h, &Point2::new(obj.x, obj.y)).unwrap();
            assert_relative_eq!(p.x, img.x, epsilon = 1e-9);
            assert_relative_eq!(p.y, img.y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rendered_chessboard_colours() {
        let camera = SyntheticCamera::default();
        let spec = PatternType::Chessboard.default_spec();
        let pose = camera.look_at_board(&spec, 0.0, 0.0, 0.0, 800.0);
        let image = camera.render(&spec, &pose);
        // Cell (0, 0) is dark and colours alternate from there.
        let h = camera.board_homography(&pose);
        let inside = |u: f64, v: f64| {
            let p = apply_homography(&h, &Point2::new(u * spec.spacing, v * spec.spacing)).unwrap();
            image.get_pixel(p.x.round() as u32, p.y.round() as u32).0[0]
        };
        assert_eq!(inside(0.5, 0.5), 30);
        assert_eq!(inside(1.5, 0.5), 220);
        assert_eq!(inside(-0.5, -0.5), 30);
        assert_eq!(inside(-2.0, 0.5), 220);
        assert_eq!(image.get_pixel(0, 0).0[0], 220);
    }

    #[test]
    fn test_views_are_distinct_and_in_front() {
        let camera = SyntheticCamera::default();
        let spec = PatternType::Chessboard.default_spec();
        let views = camera.views(&spec, 10, 480.0);
        assert_eq!(views.len(), 10);
        for pose in &views {
            for p in camera.project_pattern(&spec, pose) {
                assert!(p.x > 0.0 && p.x < 640.0 && p.y > 0.0 && p.y < 480.0);
            }
            assert!(pose.translation.vector.z > 0.0);
        }
        assert!((views[0].rotation.angle_to(&views[5].rotation)) > 0.1);
    }
}
