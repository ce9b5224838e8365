//! Ordering of an unordered set of feature candidates into pattern order.
//!
//! The convex hull of the candidates is matched against the hull of the
//! ideal grid. Every cyclic correspondence of hull vertices gives a
//! homography hypothesis; a hypothesis is kept when the projected grid
//! lands one-to-one on the candidates. Among the survivors the one whose
//! row direction points most along `+x` and column direction most along
//! `+y` wins, which makes the ordering stable for symmetric targets.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Matrix3, Point2};

use crate::geometry::{apply_homography, convex_hull, estimate_homography, simplify_polygon};
use crate::pattern::PatternSpec;

/// Hull vertices flatter than this (relative to the shorter adjacent edge)
/// are treated as edge points.
const HULL_FLATNESS: f64 = 0.2;

/// Grid position `(i, j)` of each template index, plus the template points in
/// grid units.
fn template(spec: &PatternSpec) -> (Vec<(usize, usize)>, Vec<Point2<f64>>) {
    let mut ij = Vec::with_capacity(spec.point_count());
    let mut pts = Vec::with_capacity(spec.point_count());
    for j in 0..spec.rows() {
        for i in 0..spec.cols() {
            let (x, y) = spec.grid_coordinate(i, j);
            ij.push((i, j));
            pts.push(Point2::new(x, y));
        }
    }
    (ij, pts)
}

struct Hypothesis {
    assignment: Vec<usize>,
    score: f64,
}

/// Assigns every projected template point to a distinct candidate within its
/// local tolerance. Returns candidate indices in template order.
fn assign(
    projected: &[Point2<f64>],
    tolerances: &[f64],
    tree: &KdTree<f64, 2>,
    candidate_count: usize,
) -> Option<Vec<usize>> {
    let mut used = vec![false; candidate_count];
    let mut assignment = Vec::with_capacity(projected.len());
    for (p, &tol) in projected.iter().zip(tolerances) {
        let nn = tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y]);
        let best = nn.item as usize;
        if nn.distance.sqrt() > tol || used[best] {
            return None;
        }
        used[best] = true;
        assignment.push(best);
    }
    Some(assignment)
}

fn project_all(h: &Matrix3<f64>, pts: &[Point2<f64>]) -> Option<Vec<Point2<f64>>> {
    pts.iter().map(|p| apply_homography(h, p)).collect()
}

/// Per-point tolerance: a fraction of the distance to the nearest projected
/// grid neighbour.
fn local_tolerances(
    spec: &PatternSpec,
    ij: &[(usize, usize)],
    projected: &[Point2<f64>],
    fraction: f64,
) -> Vec<f64> {
    let cols = spec.cols();
    ij.iter()
        .enumerate()
        .map(|(k, &(i, j))| {
            let mut nearest = f64::INFINITY;
            let mut consider = |n: usize| {
                nearest = nearest.min((projected[n] - projected[k]).norm());
            };
            if i > 0 {
                consider(k - 1);
            }
            if i + 1 < cols {
                consider(k + 1);
            }
            if j > 0 {
                consider(k - cols);
            }
            if j + 1 < spec.rows() {
                consider(k + cols);
            }
            nearest * fraction
        })
        .collect()
}

fn evaluate(
    h: &Matrix3<f64>,
    spec: &PatternSpec,
    ij: &[(usize, usize)],
    tmpl: &[Point2<f64>],
    candidates: &[Point2<f64>],
    tree: &KdTree<f64, 2>,
    fraction: f64,
) -> Option<Hypothesis> {
    let projected = project_all(h, tmpl)?;
    let tolerances = local_tolerances(spec, ij, &projected, fraction);
    let coarse = assign(&projected, &tolerances, tree, candidates.len())?;

    // Refit on every correspondence so that mild lens distortion does not
    // push the far side of the grid out of tolerance.
    let matched: Vec<_> = coarse.iter().map(|&k| candidates[k]).collect();
    let refined_h = estimate_homography(tmpl, &matched)?;
    let projected = project_all(&refined_h, tmpl)?;
    let tolerances = local_tolerances(spec, ij, &projected, fraction);
    let assignment = assign(&projected, &tolerances, tree, candidates.len())?;

    // Orientation and direction of the grid axes at the grid centre.
    let centre = Point2::new(
        tmpl.iter().map(|p| p.x).sum::<f64>() / tmpl.len() as f64,
        tmpl.iter().map(|p| p.y).sum::<f64>() / tmpl.len() as f64,
    );
    let c = apply_homography(&refined_h, &centre)?;
    let along_i = apply_homography(&refined_h, &Point2::new(centre.x + 1.0, centre.y))? - c;
    let along_j = apply_homography(&refined_h, &Point2::new(centre.x, centre.y + 1.0))? - c;

    // A mirrored grid cannot be produced by a camera in front of the target.
    if along_i.perp(&along_j) <= 0.0 {
        return None;
    }

    let score = along_i.normalize().x + along_j.normalize().y;
    Some(Hypothesis { assignment, score })
}

/// Orders `candidates` into pattern order (row `j` outer, column `i` inner).
///
/// Returns `None` unless there are exactly `cols * rows` candidates and a
/// consistent grid is found.
pub(crate) fn assemble_grid(
    candidates: &[Point2<f64>],
    spec: &PatternSpec,
    tolerance: f64,
) -> Option<Vec<Point2<f64>>> {
    if candidates.len() != spec.point_count() {
        return None;
    }

    let (ij, tmpl) = template(spec);

    let tmpl_hull = simplify_polygon(&tmpl, &convex_hull(&tmpl), HULL_FLATNESS);
    let img_hull = simplify_polygon(candidates, &convex_hull(candidates), HULL_FLATNESS);
    if tmpl_hull.len() < 4 || tmpl_hull.len() != img_hull.len() {
        log::trace!(
            "hull mismatch: template {} vertices, image {}",
            tmpl_hull.len(),
            img_hull.len()
        );
        return None;
    }

    let coords: Vec<[f64; 2]> = candidates.iter().map(|p| [p.x, p.y]).collect();
    let tree: KdTree<f64, 2> = (&coords).into();

    let src: Vec<_> = tmpl_hull.iter().map(|&k| tmpl[k]).collect();
    let n = img_hull.len();

    let mut best: Option<Hypothesis> = None;
    for shift in 0..n {
        let dst: Vec<_> = (0..n).map(|k| candidates[img_hull[(k + shift) % n]]).collect();
        let Some(h) = estimate_homography(&src, &dst) else {
            continue;
        };
        if let Some(hyp) = evaluate(&h, spec, &ij, &tmpl, candidates, &tree, tolerance) {
            if best.as_ref().map_or(true, |b| hyp.score > b.score) {
                best = Some(hyp);
            }
        }
    }

    best.map(|b| b.assignment.iter().map(|&k| candidates[k]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternType;
    use approx::assert_relative_eq;

    fn view() -> Matrix3<f64> {
        Matrix3::new(38.0, 4.0, 120.0, -3.0, 35.0, 90.0, 0.0002, 0.0001, 1.0)
    }

    fn projected_grid(spec: &PatternSpec, h: &Matrix3<f64>) -> Vec<Point2<f64>> {
        let (_, tmpl) = template(spec);
        tmpl.iter().map(|p| apply_homography(h, p).unwrap()).collect()
    }

    fn check_recovers(spec: PatternSpec) {
        let truth = projected_grid(&spec, &view());
        // Scramble deterministically.
        let mut shuffled = truth.clone();
        shuffled.reverse();
        shuffled.rotate_left(7);

        let ordered = assemble_grid(&shuffled, &spec, 0.35).unwrap();
        assert_eq!(ordered.len(), truth.len());
        for (a, b) in ordered.iter().zip(truth.iter()) {
            assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
            assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_chessboard_ordering() {
        check_recovers(PatternType::Chessboard.default_spec());
    }

    #[test]
    fn test_square_grid_ordering() {
        check_recovers(PatternSpec::new(PatternType::CirclesGrid, (5, 5), 10.0).unwrap());
    }

    #[test]
    fn test_asymmetric_grid_ordering() {
        check_recovers(PatternType::AsymmetricCirclesGrid.default_spec());
    }

    #[test]
    fn test_wrong_count_or_displaced_point_is_rejected() {
        let spec = PatternType::Chessboard.default_spec();
        let truth = projected_grid(&spec, &view());
        assert!(assemble_grid(&truth[1..], &spec, 0.35).is_none());

        // Interior point (i=3, j=2) pushed almost half a cell sideways.
        let mut displaced = truth.clone();
        displaced[2 * spec.cols() + 3].x += 15.0;
        assert!(assemble_grid(&displaced, &spec, 0.35).is_none());
    }
}
