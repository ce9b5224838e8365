//! Joint refinement of intrinsics, rad-tan distortion and per-view poses
//! from planar target observations, using `tiny_solver`.

use std::collections::HashMap;

use log::info;
use nalgebra::{DVector, Matrix3, Point2, Point3, RealField, Vector3};
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

use super::init::{initial_intrinsics, pose_from_homography, sample_homographies, Pose};
use super::Optimizer;
use crate::camera::{CalibrationError, Intrinsics, Resolution};
use crate::geometry::rodrigues_to_matrix;

const INTRINSICS_KEY: &str = "intrinsics";

fn pose_key(k: usize) -> String {
    format!("pose_{k}")
}

fn lit<T: RealField>(v: f64) -> T {
    nalgebra::convert(v)
}

/// Rotates `p` by the Rodrigues vector `(rx, ry, rz)`.
fn rotate<T: RealField>(rx: T, ry: T, rz: T, p: [T; 3]) -> [T; 3] {
    let [px, py, pz] = p;
    let theta2 = rx.clone() * rx.clone() + ry.clone() * ry.clone() + rz.clone() * rz.clone();

    // r x p
    let cx = ry.clone() * pz.clone() - rz.clone() * py.clone();
    let cy = rz.clone() * px.clone() - rx.clone() * pz.clone();
    let cz = rx.clone() * py.clone() - ry.clone() * px.clone();

    let eps: T = lit(1e-12);
    if theta2 > eps {
        let theta = theta2.sqrt();
        let (sin, cos) = (theta.clone().sin(), theta.clone().cos());
        let (kx, ky, kz) = (rx / theta.clone(), ry / theta.clone(), rz / theta.clone());
        let k_dot_p = kx.clone() * px.clone() + ky.clone() * py.clone() + kz.clone() * pz.clone();
        let one_minus_cos = T::one() - cos.clone();
        let s = sin / theta;
        [
            px * cos.clone() + cx * s.clone() + kx * k_dot_p.clone() * one_minus_cos.clone(),
            py * cos.clone() + cy * s.clone() + ky * k_dot_p.clone() * one_minus_cos.clone(),
            pz * cos + cz * s + kz * k_dot_p * one_minus_cos,
        ]
    } else {
        [px + cx, py + cy, pz + cz]
    }
}

/// Smallest accepted standard deviation, in pixels, of a sample's points
/// along their minor axis.
const MIN_SPREAD: f64 = 1.0;

fn minor_spread(points: &[Point2<f64>]) -> f64 {
    let n = points.len().max(1) as f64;
    let mx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let my = points.iter().map(|p| p.y).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in points {
        let (dx, dy) = (p.x - mx, p.y - my);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let (sxx, syy, sxy) = (sxx / n, syy / n, sxy / n);
    let half_trace = 0.5 * (sxx + syy);
    let det = sxx * syy - sxy * sxy;
    let minor = half_trace - (half_trace * half_trace - det).max(0.0).sqrt();
    minor.max(0.0).sqrt()
}

/// Reprojection residuals of one view.
///
/// Parameter blocks: `[fx, fy, cx, cy, k1, k2, p1, p2]` and
/// `[rx, ry, rz, tx, ty, tz]`.
#[derive(Debug, Clone)]
struct PlanarViewCost {
    object: Vec<Point3<f64>>,
    observed: Vec<Point2<f64>>,
}

impl<T: RealField> Factor<T> for PlanarViewCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let cam = &params[0];
        let pose = &params[1];
        let fx = cam[0].clone();
        let fy = cam[1].clone();
        let cx = cam[2].clone();
        let cy = cam[3].clone();
        let k1 = cam[4].clone();
        let k2 = cam[5].clone();
        let p1 = cam[6].clone();
        let p2 = cam[7].clone();

        let mut residuals = DVector::zeros(self.observed.len() * 2);

        for (i, (obj, obs)) in self.object.iter().zip(self.observed.iter()).enumerate() {
            let [xr, yr, zr] = rotate(
                pose[0].clone(),
                pose[1].clone(),
                pose[2].clone(),
                [lit(obj.x), lit(obj.y), lit(obj.z)],
            );
            let xc = xr + pose[3].clone();
            let yc = yr + pose[4].clone();
            let zc = zr + pose[5].clone();

            let x = xc / zc.clone();
            let y = yc / zc;
            let two: T = lit(2.0);
            let r2 = x.clone() * x.clone() + y.clone() * y.clone();
            let radial = T::one() + k1.clone() * r2.clone() + k2.clone() * r2.clone() * r2.clone();
            let xd = x.clone() * radial.clone()
                + two.clone() * p1.clone() * x.clone() * y.clone()
                + p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
            let yd = y.clone() * radial
                + p1.clone() * (r2 + two.clone() * y.clone() * y.clone())
                + two * p2.clone() * x * y;

            let gt_u: T = lit(obs.x);
            let gt_v: T = lit(obs.y);
            residuals[i * 2] = fx.clone() * xd + cx.clone() - gt_u;
            residuals[i * 2 + 1] = fy.clone() * yd + cy.clone() - gt_v;
        }
        residuals
    }
}

/// Planar-target calibration problem.
///
/// Holds the current estimate, which [`Optimizer::linear_estimation`]
/// initialises and [`Optimizer::optimize`] refines in place.
#[derive(Debug, Clone)]
pub struct PlanarCalibrationCost {
    resolution: Resolution,
    object: Vec<Point3<f64>>,
    samples: Vec<Vec<Point2<f64>>>,
    max_iterations: usize,
    intrinsics: Intrinsics,
    distortion: [f64; 4],
    poses: Vec<Pose>,
}

impl PlanarCalibrationCost {
    /// # Errors
    ///
    /// [`CalibrationError::InsufficientSamples`] without samples and
    /// [`CalibrationError::InvalidParams`] if a sample does not have one
    /// point per object point.
    pub fn new(
        resolution: Resolution,
        object: Vec<Point3<f64>>,
        samples: Vec<Vec<Point2<f64>>>,
        max_iterations: usize,
    ) -> Result<Self, CalibrationError> {
        if samples.is_empty() {
            return Err(CalibrationError::InsufficientSamples {
                required: 1,
                available: 0,
            });
        }
        if object.len() < 4 {
            return Err(CalibrationError::InvalidParams(
                "at least 4 object points are required".to_string(),
            ));
        }
        if let Some((k, s)) = samples
            .iter()
            .enumerate()
            .find(|(_, s)| s.len() != object.len())
        {
            return Err(CalibrationError::InvalidParams(format!(
                "sample {k} has {} points, expected {}",
                s.len(),
                object.len()
            )));
        }

        if let Some(k) = samples.iter().position(|s| minor_spread(s) < MIN_SPREAD) {
            return Err(CalibrationError::InvalidParams(format!(
                "sample {k} is degenerate: its points are (nearly) collinear"
            )));
        }

        Ok(PlanarCalibrationCost {
            resolution,
            object,
            samples,
            max_iterations,
            intrinsics: Intrinsics {
                fx: 1.0,
                fy: 1.0,
                cx: resolution.width as f64 * 0.5,
                cy: resolution.height as f64 * 0.5,
            },
            distortion: [0.0; 4],
            poses: Vec::new(),
        })
    }

    pub fn intrinsic_matrix(&self) -> Matrix3<f64> {
        let i = &self.intrinsics;
        Matrix3::new(i.fx, 0.0, i.cx, 0.0, i.fy, i.cy, 0.0, 0.0, 1.0)
    }

    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object
    }

    pub fn samples(&self) -> &[Vec<Point2<f64>>] {
        &self.samples
    }

    /// Root mean square reprojection error of the current estimate, over all
    /// points of all samples.
    pub fn rms_error(&self) -> f64 {
        let [k1, k2, p1, p2] = self.distortion;
        let i = &self.intrinsics;
        let mut sum = 0.0;
        let mut count = 0usize;
        for ((rvec, t), sample) in self.poses.iter().zip(self.samples.iter()) {
            let r = rodrigues_to_matrix(rvec);
            for (obj, obs) in self.object.iter().zip(sample.iter()) {
                let pc: Vector3<f64> = r * obj.coords + t;
                let (x, y) = (pc.x / pc.z, pc.y / pc.z);
                let r2 = x * x + y * y;
                let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
                let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                let du = i.fx * xd + i.cx - obs.x;
                let dv = i.fy * yd + i.cy - obs.y;
                sum += du * du + dv * dv;
                count += 1;
            }
        }
        if count == 0 {
            return f64::NAN;
        }
        (sum / count as f64).sqrt()
    }
}

impl Optimizer for PlanarCalibrationCost {
    /// Levenberg-Marquardt over `[fx, fy, cx, cy, k1, k2, p1, p2]` and one
    /// `[rx, ry, rz, tx, ty, tz]` block per sample.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.poses.len() != self.samples.len() {
            self.linear_estimation()?;
        }

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(
            INTRINSICS_KEY.to_string(),
            DVector::from_vec(vec![
                self.intrinsics.fx,
                self.intrinsics.fy,
                self.intrinsics.cx,
                self.intrinsics.cy,
                self.distortion[0],
                self.distortion[1],
                self.distortion[2],
                self.distortion[3],
            ]),
        );

        for (k, (sample, (rvec, t))) in self.samples.iter().zip(self.poses.iter()).enumerate() {
            let key = pose_key(k);
            let cost = PlanarViewCost {
                object: self.object.clone(),
                observed: sample.clone(),
            };
            problem.add_residual_block(
                sample.len() * 2,
                &[INTRINSICS_KEY, key.as_str()],
                Box::new(cost),
                None,
            );
            initial_values.insert(
                key,
                DVector::from_vec(vec![rvec.x, rvec.y, rvec.z, t.x, t.y, t.z]),
            );
        }

        if verbose {
            info!(
                "Starting optimization with tiny-solver Levenberg-Marquardt ({} samples, initial rms {:.4})",
                self.samples.len(),
                self.rms_error()
            );
        }

        let optimizer = LevenbergMarquardtOptimizer::default();
        let options = OptimizerOptions {
            max_iteration: self.max_iterations,
            ..OptimizerOptions::default()
        };
        let result = optimizer
            .optimize(&problem, &initial_values, Some(options))
            .ok_or_else(|| CalibrationError::NumericalError("Optimization failed".to_string()))?;

        let cam = result.get(INTRINSICS_KEY).ok_or_else(|| {
            CalibrationError::NumericalError("solver dropped the intrinsics".to_string())
        })?;
        if cam.iter().any(|v| !v.is_finite()) {
            return Err(CalibrationError::NonFiniteResult(
                "intrinsics or distortion after optimization".to_string(),
            ));
        }

        let mut poses = Vec::with_capacity(self.samples.len());
        for k in 0..self.samples.len() {
            let p = result.get(&pose_key(k)).ok_or_else(|| {
                CalibrationError::NumericalError(format!("solver dropped pose {k}"))
            })?;
            poses.push((Vector3::new(p[0], p[1], p[2]), Vector3::new(p[3], p[4], p[5])));
        }

        self.intrinsics = Intrinsics {
            fx: cam[0],
            fy: cam[1],
            cx: cam[2],
            cy: cam[3],
        };
        self.distortion = [cam[4], cam[5], cam[6], cam[7]];
        self.poses = poses;

        crate::camera::validation::validate_intrinsics(&self.intrinsics)?;

        if verbose {
            info!("Optimization finished, rms {:.4} [pixel]", self.rms_error());
        }
        Ok(())
    }

    /// Closed-form focal lengths with the principal point at the image
    /// centre, zero distortion, and one pose per sample from its homography.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized,
    {
        let object_xy: Vec<Point2<f64>> =
            self.object.iter().map(|p| Point2::new(p.x, p.y)).collect();
        let homographies = sample_homographies(&object_xy, &self.samples)?;
        let k = initial_intrinsics(&homographies, &self.resolution)?;

        let poses = homographies
            .iter()
            .enumerate()
            .map(|(i, h)| {
                pose_from_homography(&k, h).ok_or_else(|| {
                    CalibrationError::NumericalError(format!(
                        "pose initialization failed for sample {i}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.intrinsics = Intrinsics {
            fx: k[(0, 0)],
            fy: k[(1, 1)],
            cx: k[(0, 2)],
            cy: k[(1, 2)],
        };
        self.distortion = [0.0; 4];
        self.poses = poses;
        Ok(())
    }

    fn get_intrinsics(&self) -> Intrinsics {
        self.intrinsics.clone()
    }

    fn get_resolution(&self) -> Resolution {
        self.resolution
    }

    fn get_distortion(&self) -> Vec<f64> {
        self.distortion.to_vec()
    }
}
