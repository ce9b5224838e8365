//! Iterative sub-pixel corner refinement.
//!
//! For a true corner `c`, the image gradient at every point `q` in a small
//! window is orthogonal to `q - c`. Each iteration solves the weighted least
//! squares problem `sum w * (g(q)^T (q - c))^2 -> min` for `c` around the
//! current estimate.

use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Termination and window settings for [`refine_corners`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubPixelOptions {
    /// Half side of the search window; the window is `2 * half_window + 1`
    /// pixels wide.
    pub half_window: usize,
    pub max_iterations: usize,
    /// Stop once an update moves the estimate by less than this many pixels.
    pub epsilon: f64,
}

impl Default for SubPixelOptions {
    fn default() -> Self {
        SubPixelOptions {
            half_window: 5,
            max_iterations: 100,
            epsilon: 0.1,
        }
    }
}

/// Bilinear sample with replicated borders.
fn sample(image: &GrayImage, x: f64, y: f64) -> f64 {
    let w = image.width() as i64;
    let h = image.height() as i64;
    let x0 = x.floor();
    let y0 = y.floor();
    let ax = x - x0;
    let ay = y - y0;

    let px = |xi: i64, yi: i64| -> f64 {
        let xi = xi.clamp(0, w - 1) as u32;
        let yi = yi.clamp(0, h - 1) as u32;
        image.get_pixel(xi, yi).0[0] as f64
    };

    let (xi, yi) = (x0 as i64, y0 as i64);
    let top = px(xi, yi) * (1.0 - ax) + px(xi + 1, yi) * ax;
    let bottom = px(xi, yi + 1) * (1.0 - ax) + px(xi + 1, yi + 1) * ax;
    top * (1.0 - ay) + bottom * ay
}

fn gaussian_weights(half: usize) -> Vec<f64> {
    let side = 2 * half + 1;
    let mut weights = Vec::with_capacity(side * side);
    for r in 0..side {
        let y = (r as f64 - half as f64) / half as f64;
        for c in 0..side {
            let x = (c as f64 - half as f64) / half as f64;
            weights.push((-(x * x) - y * y).exp());
        }
    }
    weights
}

fn refine_one(
    image: &GrayImage,
    start: Point2<f64>,
    weights: &[f64],
    options: &SubPixelOptions,
) -> Point2<f64> {
    let half = options.half_window as i64;
    let side = (2 * half + 1) as usize;
    let eps2 = options.epsilon * options.epsilon;
    let (w, h) = (image.width() as f64, image.height() as f64);

    // Patch with a one pixel apron for central differences.
    let mut patch = vec![0.0; (side + 2) * (side + 2)];
    let mut current = start;

    for _ in 0..options.max_iterations {
        for r in 0..side + 2 {
            for c in 0..side + 2 {
                let dx = c as f64 - (half + 1) as f64;
                let dy = r as f64 - (half + 1) as f64;
                patch[r * (side + 2) + c] = sample(image, current.x + dx, current.y + dy);
            }
        }

        let mut a = Matrix2::<f64>::zeros();
        let mut b = Vector2::<f64>::zeros();
        for r in 0..side {
            for c in 0..side {
                let at = |rr: usize, cc: usize| patch[rr * (side + 2) + cc];
                let gx = at(r + 1, c + 2) - at(r + 1, c);
                let gy = at(r + 2, c + 1) - at(r, c + 1);
                let wgt = weights[r * side + c];

                let gxx = gx * gx * wgt;
                let gxy = gx * gy * wgt;
                let gyy = gy * gy * wgt;
                let px = c as f64 - half as f64;
                let py = r as f64 - half as f64;

                a[(0, 0)] += gxx;
                a[(0, 1)] += gxy;
                a[(1, 1)] += gyy;
                b[0] += gxx * px + gxy * py;
                b[1] += gxy * px + gyy * py;
            }
        }
        a[(1, 0)] = a[(0, 1)];

        let Some(inv) = a.try_inverse() else {
            break;
        };
        let step = inv * b;
        let next: Point2<f64> = Point2::new(current.x + step.x, current.y + step.y);
        if !next.x.is_finite() || next.x < 0.0 || next.x >= w || next.y < 0.0 || next.y >= h {
            break;
        }
        current = next;
        if step.norm_squared() <= eps2 {
            break;
        }
    }

    // Runaway estimates are discarded.
    if (current.x - start.x).abs() > half as f64 || (current.y - start.y).abs() > half as f64 {
        start
    } else {
        current
    }
}

/// Refines every point in place.
pub fn refine_corners(image: &GrayImage, points: &mut [Point2<f64>], options: &SubPixelOptions) {
    if options.half_window == 0 || image.width() == 0 || image.height() == 0 {
        return;
    }
    let weights = gaussian_weights(options.half_window);
    for p in points.iter_mut() {
        *p = refine_one(image, *p, &weights, options);
    }
}
