//! Session configuration.
//!
//! Everything a calibration session needs is passed in through one
//! [`CalibrationConfig`]; there is no process-wide preference state.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::camera::{CalibrationError, Resolution};
use crate::detection::{DetectorOptions, SubPixelOptions};
use crate::optimization::SolverOptions;
use crate::pattern::PatternSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub pattern: PatternSpec,
    /// Samples to capture before calibrating automatically.
    pub max_samples: usize,
    /// Fewest samples [`crate::session::CalibrationSession::solve`] accepts.
    pub min_samples: usize,
    /// Fixed luma frame size of the video source.
    pub video: Resolution,
    pub detector: DetectorOptions,
    pub refine: SubPixelOptions,
    pub solver: SolverOptions,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            pattern: PatternSpec::default(),
            max_samples: 10,
            min_samples: 3,
            video: Resolution {
                width: 640,
                height: 480,
            },
            detector: DetectorOptions::default(),
            refine: SubPixelOptions::default(),
            solver: SolverOptions::default(),
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.pattern.validate()?;
        if self.min_samples == 0 {
            return Err(CalibrationError::InvalidParams(
                "min_samples must be at least 1".to_string(),
            ));
        }
        if self.max_samples < self.min_samples {
            return Err(CalibrationError::InvalidParams(format!(
                "max_samples ({}) must not be below min_samples ({})",
                self.max_samples, self.min_samples
            )));
        }
        if self.video.width == 0 || self.video.height == 0 {
            return Err(CalibrationError::InvalidParams(format!(
                "invalid video size {}x{}",
                self.video.width, self.video.height
            )));
        }
        if self.refine.half_window == 0 {
            return Err(CalibrationError::InvalidParams(
                "refine.half_window must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Loads and validates a YAML configuration. Missing keys take their
    /// default values.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config = Self::from_yaml_str(&contents)?;
        info!("loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, CalibrationError> {
        let config: CalibrationConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::ErrorAverage;
    use crate::pattern::PatternType;

    #[test]
    fn test_default_is_valid() {
        let config = CalibrationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pattern.pattern_type, PatternType::Chessboard);
        assert_eq!(config.pattern.grid_size, (7, 5));
        assert_eq!(config.refine.max_iterations, 100);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
pattern:
  pattern_type: AsymmetricCirclesGrid
  grid_size: [4, 11]
  spacing: 20.0
max_samples: 12
solver:
  average: SampleCount
"#;
        let config = CalibrationConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.pattern.pattern_type, PatternType::AsymmetricCirclesGrid);
        assert_eq!(config.max_samples, 12);
        assert_eq!(config.min_samples, 3);
        assert_eq!(config.solver.average, ErrorAverage::SampleCount);
        assert_eq!(config.solver.max_iterations, 100);
        assert_eq!(config.video.width, 640);
    }

    #[test]
    fn test_invalid_configs() {
        let bad = CalibrationConfig {
            max_samples: 2,
            min_samples: 3,
            ..CalibrationConfig::default()
        };
        assert!(bad.validate().is_err());

        let yaml = "video: { width: 0, height: 480 }\n";
        assert!(CalibrationConfig::from_yaml_str(yaml).is_err());

        let yaml = "pattern: { pattern_type: Chessboard, grid_size: [1, 5], spacing: 30.0 }\n";
        assert!(CalibrationConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/samples/calibration.yaml");
        let config = CalibrationConfig::load_from_yaml(path).unwrap();
        assert_eq!(config, CalibrationConfig::default());
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let path = std::env::temp_dir().join("calib_camera_config_test.yaml");
        let config = CalibrationConfig {
            max_samples: 15,
            ..CalibrationConfig::default()
        };
        config.save_to_yaml(&path).unwrap();
        let loaded = CalibrationConfig::load_from_yaml(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_file(&path);
    }
}
