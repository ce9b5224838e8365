//! Chessboard inner-corner detection.
//!
//! X-junctions come from the ChESS response of the `chess-corners` crate,
//! already at sub-pixel precision. Each junction is linked to the k nearest
//! junctions (kiddo k-d tree) that sit at a consistent spacing; a linked
//! group holding at least the expected number of corners keeps its
//! strongest responses and is handed to the grid assembler for ordering.

use chess_corners::{find_chess_corners_image, ChessConfig, CornerDescriptor};
use image::GrayImage;
use kiddo::{KdTree, SquaredEuclidean};
use log::trace;
use nalgebra::Point2;

use super::grid::assemble_grid;
use super::threshold::percentile_contrast;
use super::DetectorOptions;
use crate::pattern::PatternSpec;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Junction {
    pub position: Point2<f64>,
    pub response: f64,
}

fn adapt_chess_corner(c: &CornerDescriptor) -> Junction {
    Junction {
        position: Point2::new(c.x as f64, c.y as f64),
        response: c.response as f64,
    }
}

pub(crate) fn chess_config(options: &DetectorOptions) -> ChessConfig {
    let mut cfg = ChessConfig::single_scale();
    cfg.params.threshold_rel = options.chess_threshold_rel as _;
    cfg.params.nms_radius = options.chess_nms_radius as _;
    cfg
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Groups junctions that are connected through nearest-neighbour links.
///
/// `i` and `j` are linked when `j` is among the `k_neighbors` nearest
/// junctions of `i` and their distance is at most `link_ratio` times the
/// smaller of the two nearest-neighbour distances. Diagonal grid neighbours
/// pass at ratios above `sqrt(2)`. Groups come back largest first.
pub(crate) fn link_groups(
    junctions: &[Junction],
    k_neighbors: usize,
    link_ratio: f64,
) -> Vec<Vec<usize>> {
    if junctions.len() < 2 {
        return (0..junctions.len()).map(|i| vec![i]).collect();
    }

    let coords: Vec<[f64; 2]> = junctions
        .iter()
        .map(|j| [j.position.x, j.position.y])
        .collect();
    let tree: KdTree<f64, 2> = (&coords).into();

    // Self is always the first hit, hence the extra slot.
    let k = k_neighbors.max(1) + 1;
    let neighbours: Vec<Vec<(usize, f64)>> = coords
        .iter()
        .enumerate()
        .map(|(i, q)| {
            tree.nearest_n::<SquaredEuclidean>(q, k)
                .into_iter()
                .map(|nn| (nn.item as usize, nn.distance.sqrt()))
                .filter(|&(j, _)| j != i)
                .collect()
        })
        .collect();
    let spacing: Vec<f64> = neighbours
        .iter()
        .map(|n| n.iter().map(|&(_, d)| d).fold(f64::INFINITY, f64::min))
        .collect();

    let mut uf = UnionFind::new(junctions.len());
    for (i, list) in neighbours.iter().enumerate() {
        for &(j, d) in list {
            if d <= link_ratio * spacing[i].min(spacing[j]) {
                uf.union(i, j);
            }
        }
    }

    let mut by_root: Vec<Vec<usize>> = vec![Vec::new(); junctions.len()];
    for i in 0..junctions.len() {
        let r = uf.find(i);
        by_root[r].push(i);
    }
    let mut groups: Vec<Vec<usize>> = by_root.into_iter().filter(|g| !g.is_empty()).collect();
    groups.sort_by(|a, b| b.len().cmp(&a.len()));
    groups
}

/// The `expected` strongest junctions of a group, or `None` if the group is
/// too small.
pub(crate) fn strongest(
    junctions: &[Junction],
    group: &[usize],
    expected: usize,
) -> Option<Vec<Point2<f64>>> {
    if group.len() < expected {
        return None;
    }
    let mut members: Vec<&Junction> = group.iter().map(|&i| &junctions[i]).collect();
    members.sort_by(|a, b| b.response.total_cmp(&a.response));
    Some(members[..expected].iter().map(|j| j.position).collect())
}

/// Orders linked junctions into the pattern grid. Groups are tried largest
/// first; the first that assembles wins.
pub(crate) fn corners_from_junctions(
    junctions: &[Junction],
    spec: &PatternSpec,
    options: &DetectorOptions,
) -> Option<Vec<Point2<f64>>> {
    let expected = spec.point_count();
    for group in link_groups(junctions, options.k_neighbors, options.link_ratio) {
        let Some(candidates) = strongest(junctions, &group, expected) else {
            // Sorted by size, nothing further can hold the board.
            break;
        };
        if let Some(ordered) = assemble_grid(&candidates, spec, options.grid_tolerance) {
            return Some(ordered);
        }
    }
    None
}

/// Returns the inner corners in pattern order, or `None` if the board is not
/// fully visible.
pub(crate) fn find_chessboard_corners(
    image: &GrayImage,
    spec: &PatternSpec,
    options: &DetectorOptions,
) -> Option<Vec<Point2<f64>>> {
    // Fast check: a board needs real contrast somewhere in the frame.
    if percentile_contrast(image) < options.min_contrast {
        return None;
    }

    let junctions: Vec<Junction> = find_chess_corners_image(image, &chess_config(options))
        .iter()
        .map(adapt_chess_corner)
        .collect();
    trace!("{} ChESS junctions", junctions.len());
    if junctions.len() < spec.point_count() {
        return None;
    }

    corners_from_junctions(&junctions, spec, options)
}
