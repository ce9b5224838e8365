//! Calibration target description and its object-space geometry.

use std::fmt;
use std::str::FromStr;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::camera::CalibrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternType {
    Chessboard,
    CirclesGrid,
    AsymmetricCirclesGrid,
}

impl PatternType {
    pub fn name(&self) -> &'static str {
        match self {
            PatternType::Chessboard => "Chessboard",
            PatternType::CirclesGrid => "CirclesGrid",
            PatternType::AsymmetricCirclesGrid => "AsymmetricCirclesGrid",
        }
    }

    /// Grid size and spacing used when nothing else is configured.
    pub fn default_spec(self) -> PatternSpec {
        match self {
            PatternType::Chessboard => PatternSpec {
                pattern_type: self,
                grid_size: (7, 5),
                spacing: 30.0,
            },
            PatternType::CirclesGrid => PatternSpec {
                pattern_type: self,
                grid_size: (7, 5),
                spacing: 30.0,
            },
            PatternType::AsymmetricCirclesGrid => PatternSpec {
                pattern_type: self,
                grid_size: (4, 11),
                spacing: 20.0,
            },
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PatternType {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "chessboard" => Ok(PatternType::Chessboard),
            "circlesgrid" | "circles" => Ok(PatternType::CirclesGrid),
            "asymmetriccirclesgrid" | "asymmetriccircles" => {
                Ok(PatternType::AsymmetricCirclesGrid)
            }
            _ => Err(CalibrationError::InvalidParams(format!(
                "unknown pattern type '{}'",
                s
            ))),
        }
    }
}

/// A planar target: its kind, the number of features per row (`cols`) and
/// per column (`rows`), and the distance between neighbouring features.
///
/// For chessboards the grid counts inner corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub pattern_type: PatternType,
    pub grid_size: (usize, usize),
    pub spacing: f64,
}

impl Default for PatternSpec {
    fn default() -> Self {
        PatternType::Chessboard.default_spec()
    }
}

impl PatternSpec {
    pub fn new(
        pattern_type: PatternType,
        grid_size: (usize, usize),
        spacing: f64,
    ) -> Result<Self, CalibrationError> {
        let spec = PatternSpec {
            pattern_type,
            grid_size,
            spacing,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn cols(&self) -> usize {
        self.grid_size.0
    }

    pub fn rows(&self) -> usize {
        self.grid_size.1
    }

    /// Number of features in one full detection.
    pub fn point_count(&self) -> usize {
        self.grid_size.0 * self.grid_size.1
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.grid_size.0 < 2 || self.grid_size.1 < 2 {
            return Err(CalibrationError::InvalidParams(format!(
                "grid size must be at least 2x2, got {}x{}",
                self.grid_size.0, self.grid_size.1
            )));
        }
        if !self.spacing.is_finite() || self.spacing <= 0.0 {
            return Err(CalibrationError::InvalidParams(format!(
                "pattern spacing must be positive, got {}",
                self.spacing
            )));
        }
        Ok(())
    }

    /// Position of feature `(i, j)` in units of `spacing`, on the `z = 0` plane.
    ///
    /// `i` runs along a row (`0..cols`), `j` across rows (`0..rows`).
    /// Asymmetric circle grids stagger every other row by one spacing.
    pub fn grid_coordinate(&self, i: usize, j: usize) -> (f64, f64) {
        match self.pattern_type {
            PatternType::Chessboard | PatternType::CirclesGrid => (i as f64, j as f64),
            PatternType::AsymmetricCirclesGrid => ((2 * i + j % 2) as f64, j as f64),
        }
    }

    /// The object-point template shared by every sample, in detection order
    /// (row `j` outer, column `i` inner).
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        let mut points = Vec::with_capacity(self.point_count());
        for j in 0..self.rows() {
            for i in 0..self.cols() {
                let (x, y) = self.grid_coordinate(i, j);
                points.push(Point3::new(x * self.spacing, y * self.spacing, 0.0));
            }
        }
        points
    }
}
