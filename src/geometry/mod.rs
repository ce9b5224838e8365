//! Planar geometry helpers shared by detection and calibration.

use nalgebra::{DMatrix, Matrix3, Point2, Rotation3, SMatrix, SVector, Vector3};

fn hartley_normalization(points: &[Point2<f64>]) -> Matrix3<f64> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn transform(t: &Matrix3<f64>, points: &[Point2<f64>]) -> Vec<Point2<f64>> {
    points
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect()
}

fn denormalize(hn: Matrix3<f64>, t_src: &Matrix3<f64>, t_dst: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let h = t_dst.try_inverse()? * hn * t_src;
    let s = h[(2, 2)];
    if s.abs() < 1e-12 || !s.is_finite() {
        return None;
    }
    Some(h / s)
}

/// Estimates `H` with `dst ~ H * src`.
///
/// Exactly four correspondences are solved directly; five or more use the
/// normalized DLT. Returns `None` for fewer than four points, mismatched
/// inputs or a degenerate configuration.
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }

    let t_src = hartley_normalization(src);
    let t_dst = hartley_normalization(dst);
    let s = transform(&t_src, src);
    let d = transform(&t_dst, dst);

    if src.len() == 4 {
        // The thin SVD of an 8x9 system has no null-space row, so the
        // minimal case is solved with h33 = 1.
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for k in 0..4 {
            let (x, y, u, v) = (s[k].x, s[k].y, d[k].x, d[k].y);
            let r0 = 2 * k;
            a[(r0, 0)] = x;
            a[(r0, 1)] = y;
            a[(r0, 2)] = 1.0;
            a[(r0, 6)] = -u * x;
            a[(r0, 7)] = -u * y;
            b[r0] = u;

            let r1 = 2 * k + 1;
            a[(r1, 3)] = x;
            a[(r1, 4)] = y;
            a[(r1, 5)] = 1.0;
            a[(r1, 6)] = -v * x;
            a[(r1, 7)] = -v * y;
            b[r1] = v;
        }
        let x = a.lu().solve(&b)?;
        let hn = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);
        return denormalize(hn, &t_src, &t_dst);
    }

    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for k in 0..n {
        let (x, y, u, v) = (s[k].x, s[k].y, d[k].x, d[k].y);

        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    let svd = a.svd(true, true);
    let vt = svd.v_t?;
    let h = vt.row(vt.nrows().checked_sub(1)?);
    let hn = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    denormalize(hn, &t_src, &t_dst)
}

/// Maps `p` through `h`; `None` if the point lands at infinity.
pub fn apply_homography(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let v = h * Vector3::new(p.x, p.y, 1.0);
    if v[2].abs() < 1e-12 {
        return None;
    }
    Some(Point2::new(v[0] / v[2], v[1] / v[2]))
}

fn cross(o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Indices of the convex hull of `points` (monotone chain), in order of
/// increasing angle (counter-clockwise for a y-up frame). Collinear points
/// on hull edges are excluded.
pub fn convex_hull(points: &[Point2<f64>]) -> Vec<usize> {
    if points.len() < 3 {
        return (0..points.len()).collect();
    }

    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| {
        points[a]
            .x
            .total_cmp(&points[b].x)
            .then(points[a].y.total_cmp(&points[b].y))
    });

    let mut hull: Vec<usize> = Vec::with_capacity(2 * points.len());
    for &i in &order {
        while hull.len() >= 2
            && cross(&points[hull[hull.len() - 2]], &points[hull[hull.len() - 1]], &points[i]) <= 0.0
        {
            hull.pop();
        }
        hull.push(i);
    }
    let lower_len = hull.len() + 1;
    for &i in order.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&points[hull[hull.len() - 2]], &points[hull[hull.len() - 1]], &points[i]) <= 0.0
        {
            hull.pop();
        }
        hull.push(i);
    }
    hull.pop();
    hull
}

/// Removes polygon vertices that lie almost on the segment joining their
/// neighbours.
///
/// A vertex is dropped while its distance to that segment is below
/// `tolerance` times the shorter of its two adjacent edges; the flattest
/// vertex goes first.
pub fn simplify_polygon(points: &[Point2<f64>], polygon: &[usize], tolerance: f64) -> Vec<usize> {
    let mut poly = polygon.to_vec();
    while poly.len() > 3 {
        let n = poly.len();
        let mut flattest: Option<(usize, f64)> = None;
        for k in 0..n {
            let prev = &points[poly[(k + n - 1) % n]];
            let cur = &points[poly[k]];
            let next = &points[poly[(k + 1) % n]];

            let base = (next - prev).norm();
            let shorter = (cur - prev).norm().min((next - cur).norm());
            if base < 1e-12 || shorter < 1e-12 {
                flattest = Some((k, 0.0));
                break;
            }
            let dist = cross(prev, next, cur).abs() / base;
            let ratio = dist / shorter;
            if flattest.map_or(true, |(_, r)| ratio < r) {
                flattest = Some((k, ratio));
            }
        }
        match flattest {
            Some((k, ratio)) if ratio < tolerance => {
                poly.remove(k);
            }
            _ => break,
        }
    }
    poly
}

/// Rotation matrix of a Rodrigues (axis * angle) vector.
pub fn rodrigues_to_matrix(rvec: &Vector3<f64>) -> Matrix3<f64> {
    Rotation3::new(*rvec).into_inner()
}

/// Rodrigues vector of a rotation matrix. The input is re-orthonormalized
/// first.
pub fn matrix_to_rodrigues(r: &Matrix3<f64>) -> Vector3<f64> {
    Rotation3::from_matrix(r).scaled_axis()
}

/// Projects `r` onto the closest rotation matrix (Frobenius norm).
pub fn nearest_rotation(r: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = r.svd(true, true);
    let u = svd.u?;
    let vt = svd.v_t?;
    let mut rot = u * vt;
    if rot.determinant() < 0.0 {
        let mut u = u;
        u.column_mut(2).neg_mut();
        rot = u * vt;
    }
    Some(rot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_homography() -> Matrix3<f64> {
        Matrix3::new(1.2, 0.1, 40.0, -0.05, 0.9, 25.0, 0.0004, -0.0002, 1.0)
    }

    fn grid(cols: usize, rows: usize) -> Vec<Point2<f64>> {
        let mut pts = Vec::new();
        for j in 0..rows {
            for i in 0..cols {
                pts.push(Point2::new(i as f64 * 30.0, j as f64 * 30.0));
            }
        }
        pts
    }

    #[test]
    fn test_homography_dlt_and_four_point() {
        let h = sample_homography();
        let src = grid(4, 3);
        let dst: Vec<_> = src.iter().map(|p| apply_homography(&h, p).unwrap()).collect();

        let est = estimate_homography(&src, &dst).unwrap();
        assert_relative_eq!(est, h, epsilon = 1e-8);

        let idx = [0, 3, 11, 8];
        let src4: Vec<_> = idx.iter().map(|&i| src[i]).collect();
        let dst4: Vec<_> = idx.iter().map(|&i| dst[i]).collect();
        let est4 = estimate_homography(&src4, &dst4).unwrap();
        assert_relative_eq!(est4, h, epsilon = 1e-8);
    }

    #[test]
    fn test_homography_rejects_bad_input() {
        let src = grid(3, 1);
        assert!(estimate_homography(&src, &src).is_none());
        let src = grid(2, 2);
        assert!(estimate_homography(&src, &src[..3]).is_none());
    }

    #[test]
    fn test_convex_hull_and_simplify() {
        let pts = grid(5, 3);
        let hull = convex_hull(&pts);
        // Collinear edge points are already excluded by the hull.
        let mut sorted = hull.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 4, 10, 14]);

        // Slightly bent edges survive the hull but not the simplification.
        let mut bent = pts.clone();
        bent[2].y -= 0.5;
        bent[7].x += 0.3;
        let hull = convex_hull(&bent);
        assert_eq!(hull.len(), 5);
        let simplified = simplify_polygon(&bent, &hull, 0.2);
        let mut sorted = simplified.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 4, 10, 14]);
    }

    #[test]
    fn test_rodrigues_round_trip() {
        let rvec = Vector3::new(0.1, -0.3, 0.05);
        let r = rodrigues_to_matrix(&rvec);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(matrix_to_rodrigues(&r), rvec, epsilon = 1e-12);

        let noisy = r + Matrix3::from_element(1e-3);
        let fixed = nearest_rotation(&noisy).unwrap();
        assert_relative_eq!(fixed * fixed.transpose(), Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(fixed, r, epsilon = 5e-3);
    }
}
