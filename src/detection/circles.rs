//! Symmetric and asymmetric circle-grid detection.

use image::GrayImage;
use nalgebra::Point2;

use super::blobs::{connected_components, Blob};
use super::grid::assemble_grid;
use super::{DetectorOptions, ThresholdMode};
use crate::pattern::PatternSpec;

/// Area of a filled ellipse with the blob's second moments, relative to the
/// blob area, must stay within this band around 1.
const FILL_TOLERANCE: f64 = 0.2;

fn is_circle_like(blob: &Blob, width: usize, height: usize, options: &DetectorOptions) -> bool {
    if blob.touches_border(width, height) {
        return false;
    }
    let (major, minor) = blob.principal_variances();
    if major <= 0.0 || minor / major < options.min_inertia_ratio {
        return false;
    }
    let ellipse_area = 4.0 * std::f64::consts::PI * (major * minor).sqrt();
    let fill = blob.area() as f64 / ellipse_area;
    (fill - 1.0).abs() <= FILL_TOLERANCE
}

/// Keeps the `n` blobs whose area is closest to the median area.
fn closest_to_median(mut blobs: Vec<Blob>, n: usize) -> Vec<Blob> {
    if blobs.len() <= n {
        return blobs;
    }
    let mut areas: Vec<usize> = blobs.iter().map(Blob::area).collect();
    areas.sort_unstable();
    let median = areas[areas.len() / 2] as i64;
    blobs.sort_by_key(|b| (b.area() as i64 - median).abs());
    blobs.truncate(n);
    blobs
}

/// Locates the centres of a (symmetric or asymmetric) circle grid, in pattern
/// order.
pub(crate) fn find_circle_centers(
    image: &GrayImage,
    spec: &PatternSpec,
    options: &DetectorOptions,
) -> Option<Vec<Point2<f64>>> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let max_area = (w * h) as f64 * options.max_blob_fraction;
    let expected = spec.point_count();

    // Global thresholding first: printed dots are uniformly dark.
    let mut modes = ThresholdMode::sequence(image, options);
    modes.rotate_right(1);

    for mode in modes {
        let mask = mode.apply(image, options);
        let blobs: Vec<Blob> = connected_components(&mask, options.min_blob_area, max_area as usize)
            .into_iter()
            .filter(|b| is_circle_like(b, w, h, options))
            .collect();
        if blobs.len() < expected {
            continue;
        }

        let centres: Vec<Point2<f64>> = closest_to_median(blobs, expected)
            .iter()
            .map(Blob::centroid)
            .collect();
        if let Some(points) = assemble_grid(&centres, spec, options.grid_tolerance) {
            log::debug!("circle grid found with {:?}", mode);
            return Some(points);
        }
    }
    None
}
