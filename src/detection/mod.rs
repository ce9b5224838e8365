//! Calibration pattern detection.
//!
//! The [`FeatureExtractor`] trait is the seam between the corner finder
//! worker and the actual detector. [`PatternDetector`] is the built-in
//! implementation: chessboard inner corners from ChESS X-junctions linked
//! through a k-d tree, and circle centres from thresholded blob moments.
//! Both end in the same homography-based grid ordering.
//!
//! A pattern that cannot be located is an ordinary outcome and is reported
//! as `found_all == false`, never as an error.

use image::GrayImage;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::pattern::{PatternSpec, PatternType};

mod blobs;
mod chessboard;
mod circles;
mod grid;
pub mod subpixel;
mod threshold;

pub use subpixel::{refine_corners, SubPixelOptions};

use threshold::{adaptive_dark_mask, global_dark_mask, otsu_threshold, Mask};

/// Outcome of one detection run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    /// `true` only if every feature of the pattern was located.
    pub found_all: bool,
    /// Feature positions in pattern order. Untrusted unless `found_all`.
    pub points: Vec<Point2<f64>>,
}

impl DetectionResult {
    pub fn not_found() -> Self {
        DetectionResult::default()
    }

    pub fn found(points: Vec<Point2<f64>>) -> Self {
        DetectionResult {
            found_all: true,
            points,
        }
    }
}

/// Locates pattern features in one luma image.
///
/// Implementations are stateless per call and are moved into the worker
/// thread, hence the `Send` bound.
pub trait FeatureExtractor: Send {
    fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> DetectionResult;
}

impl<F> FeatureExtractor for F
where
    F: Fn(&GrayImage, &PatternSpec) -> DetectionResult + Send,
{
    fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> DetectionResult {
        self(image, pattern)
    }
}

/// Tuning knobs of [`PatternDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    /// Minimum spread between the 5th and 95th intensity percentiles.
    pub min_contrast: u8,
    /// Adaptive threshold window half sizes are `min(width, height) / d` for
    /// each divisor `d`.
    pub adaptive_divisors: Vec<u32>,
    /// A pixel must be this far below its local mean to count as dark.
    pub adaptive_offset: f64,
    /// ChESS response threshold relative to the strongest response.
    pub chess_threshold_rel: f32,
    /// Non-maximum suppression radius of the ChESS detector, in pixels.
    pub chess_nms_radius: u32,
    /// Nearest junctions examined when linking chessboard corners.
    pub k_neighbors: usize,
    /// Two junctions are linked when their distance is at most this multiple
    /// of their nearest-neighbour spacing.
    pub link_ratio: f64,
    pub min_blob_area: usize,
    /// Largest circle blob as a fraction of the image area.
    pub max_blob_fraction: f64,
    /// Smallest accepted minor/major variance ratio of a circle blob.
    pub min_inertia_ratio: f64,
    /// Grid assignment tolerance as a fraction of the local feature spacing.
    pub grid_tolerance: f64,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        DetectorOptions {
            min_contrast: 40,
            adaptive_divisors: vec![8, 16, 32],
            adaptive_offset: 5.0,
            chess_threshold_rel: 0.2,
            chess_nms_radius: 2,
            k_neighbors: 8,
            link_ratio: 1.5,
            min_blob_area: 9,
            max_blob_fraction: 0.25,
            min_inertia_ratio: 0.2,
            grid_tolerance: 0.35,
        }
    }
}

/// How a luma image is turned into a dark mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ThresholdMode {
    Adaptive { half: usize },
    Otsu,
}

impl ThresholdMode {
    /// Adaptive windows from large to small, followed by Otsu.
    pub(crate) fn sequence(image: &GrayImage, options: &DetectorOptions) -> Vec<ThresholdMode> {
        let short_side = image.width().min(image.height());
        let mut modes: Vec<ThresholdMode> = Vec::new();
        for &d in &options.adaptive_divisors {
            if d == 0 {
                continue;
            }
            let half = (short_side / d).max(5) as usize;
            let mode = ThresholdMode::Adaptive { half };
            if !modes.contains(&mode) {
                modes.push(mode);
            }
        }
        modes.push(ThresholdMode::Otsu);
        modes
    }

    pub(crate) fn apply(&self, image: &GrayImage, options: &DetectorOptions) -> Mask {
        match *self {
            ThresholdMode::Adaptive { half } => {
                adaptive_dark_mask(image, half, options.adaptive_offset)
            }
            ThresholdMode::Otsu => global_dark_mask(image, otsu_threshold(image)),
        }
    }
}

/// Built-in detector for every [`PatternType`].
#[derive(Debug, Clone, Default)]
pub struct PatternDetector {
    options: DetectorOptions,
}

impl PatternDetector {
    pub fn new(options: DetectorOptions) -> Self {
        PatternDetector { options }
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }
}

impl FeatureExtractor for PatternDetector {
    fn detect(&self, image: &GrayImage, pattern: &PatternSpec) -> DetectionResult {
        let points = match pattern.pattern_type {
            PatternType::Chessboard => {
                chessboard::find_chessboard_corners(image, pattern, &self.options)
            }
            PatternType::CirclesGrid | PatternType::AsymmetricCirclesGrid => {
                circles::find_circle_centers(image, pattern, &self.options)
            }
        };
        match points {
            Some(points) if points.len() == pattern.point_count() => DetectionResult::found(points),
            _ => DetectionResult::not_found(),
        }
    }
}
