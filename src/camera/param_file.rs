//! Persistence of [`CameraParameters`].
//!
//! Three formats are supported:
//!
//! * the binary `.dat` layout read by ARToolKit-style trackers: big-endian
//!   `i32 xsize`, `i32 ysize`, `f64 mat[3][4]` and `f64 dist_factor[9]`
//!   (176 bytes for distortion function version 4);
//! * YAML and JSON through `serde`.

use std::fs;
use std::path::Path;

use super::{CalibrationError, CameraParameters, Resolution, DIST_FUNCTION_VERSION};

/// Size in bytes of a version-4 parameter record.
pub const DAT_RECORD_SIZE: usize = 4 + 4 + 12 * 8 + 9 * 8;

/// Record sizes of the older distortion function versions, indexed by
/// `version - 1`. Only used to produce a useful error message.
const LEGACY_RECORD_SIZES: [usize; 3] = [136, 144, 152];

impl CameraParameters {
    /// Encodes the parameters in the binary `.dat` layout.
    pub fn to_dat_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DAT_RECORD_SIZE);
        bytes.extend_from_slice(&(self.resolution.width as i32).to_be_bytes());
        bytes.extend_from_slice(&(self.resolution.height as i32).to_be_bytes());
        for value in self.mat.iter().flatten() {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        for value in &self.dist_factor {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        bytes
    }

    /// Decodes a version-4 `.dat` record.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::InvalidParamFile`] if the length does not match a
    /// version-4 record, the image size is not positive, or the decoded
    /// values fail [`CameraParameters::validate_params`].
    pub fn from_dat_bytes(bytes: &[u8]) -> Result<Self, CalibrationError> {
        if bytes.len() != DAT_RECORD_SIZE {
            if let Some(version) = LEGACY_RECORD_SIZES.iter().position(|&n| n == bytes.len()) {
                return Err(CalibrationError::InvalidParamFile(format!(
                    "distortion function version {} is not supported",
                    version + 1
                )));
            }
            return Err(CalibrationError::InvalidParamFile(format!(
                "expected {} bytes, got {}",
                DAT_RECORD_SIZE,
                bytes.len()
            )));
        }

        let read_i32 = |offset: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[offset..offset + 4]);
            i32::from_be_bytes(buf)
        };
        let read_f64 = |offset: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[offset..offset + 8]);
            f64::from_be_bytes(buf)
        };

        let width = read_i32(0);
        let height = read_i32(4);
        if width <= 0 || height <= 0 {
            return Err(CalibrationError::InvalidParamFile(format!(
                "invalid image size {}x{}",
                width, height
            )));
        }

        let mut offset = 8;
        let mut mat = [[0.0; 4]; 3];
        for value in mat.iter_mut().flatten() {
            *value = read_f64(offset);
            offset += 8;
        }
        let mut dist_factor = [0.0; 9];
        for value in dist_factor.iter_mut() {
            *value = read_f64(offset);
            offset += 8;
        }

        let params = CameraParameters {
            resolution: Resolution {
                width: width as u32,
                height: height as u32,
            },
            mat,
            dist_factor,
            dist_function_version: DIST_FUNCTION_VERSION,
        };
        params
            .validate_params()
            .map_err(|e| CalibrationError::InvalidParamFile(e.to_string()))?;
        Ok(params)
    }

    /// Writes the parameters to `path` in the binary `.dat` layout.
    pub fn save_dat(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path.as_ref(), self.to_dat_bytes())?;
        log::info!("Camera parameters saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load_dat(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let bytes = fs::read(path)?;
        Self::from_dat_bytes(&bytes)
    }

    /// Saves the parameters to a YAML file.
    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path.as_ref(), yaml)?;
        log::info!("Camera parameters saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Loads parameters from a YAML file and validates them.
    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        let params: CameraParameters = serde_yaml::from_str(&contents)?;
        params.check_version()?;
        params.validate_params()?;
        Ok(params)
    }

    pub fn to_json(&self) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CalibrationError> {
        let params: CameraParameters = serde_json::from_str(json)?;
        params.check_version()?;
        params.validate_params()?;
        Ok(params)
    }

    fn check_version(&self) -> Result<(), CalibrationError> {
        if self.dist_function_version != DIST_FUNCTION_VERSION {
            return Err(CalibrationError::InvalidParamFile(format!(
                "distortion function version {} is not supported",
                self.dist_function_version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    fn sample_params() -> CameraParameters {
        let k = Matrix3::new(812.5, 0.0, 318.25, 0.0, 806.0, 241.75, 0.0, 0.0, 1.0);
        CameraParameters::from_calibration(
            Resolution {
                width: 640,
                height: 480,
            },
            &k,
            [-0.21, 0.04, 0.0007, -0.0003],
        )
        .unwrap()
    }

    #[test]
    fn test_dat_layout() {
        let params = sample_params();
        let bytes = params.to_dat_bytes();
        assert_eq!(bytes.len(), 176);
        assert_eq!(&bytes[0..4], &640i32.to_be_bytes());
        assert_eq!(&bytes[4..8], &480i32.to_be_bytes());
        // mat[0][2] is the fourth f64 after the header.
        assert_eq!(&bytes[8 + 2 * 8..8 + 3 * 8], &318.25f64.to_be_bytes());
        // dist_factor[8] is the last value in the record.
        assert_eq!(&bytes[168..176], &params.size_factor().to_be_bytes());

        let decoded = CameraParameters::from_dat_bytes(&bytes).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_dat_rejects_truncated_and_legacy_records() {
        let bytes = sample_params().to_dat_bytes();
        let err = CameraParameters::from_dat_bytes(&bytes[..100]).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidParamFile(_)));

        let err = CameraParameters::from_dat_bytes(&bytes[..136]).unwrap_err();
        assert!(err.to_string().contains("version 1"));
    }

    #[test]
    fn test_dat_rejects_bad_image_size() {
        let mut bytes = sample_params().to_dat_bytes();
        bytes[0..4].copy_from_slice(&0i32.to_be_bytes());
        assert!(CameraParameters::from_dat_bytes(&bytes).is_err());
    }

    #[test]
    fn test_yaml_and_json_files() {
        let params = sample_params();
        let dir = std::env::temp_dir();

        let yaml_path = dir.join(format!("calib_camera_params_{}.yaml", std::process::id()));
        params.save_to_yaml(&yaml_path).unwrap();
        let loaded = CameraParameters::load_from_yaml(&yaml_path).unwrap();
        let _ = std::fs::remove_file(&yaml_path);
        assert_eq!(loaded, params);

        let json = params.to_json().unwrap();
        assert!(json.contains("dist_factor"));
        let from_json = CameraParameters::from_json(&json).unwrap();
        assert_eq!(from_json.resolution, params.resolution);
        for (a, b) in from_json.dist_factor.iter().zip(params.dist_factor.iter()) {
            approx::assert_relative_eq!(a, b, max_relative = 1e-12);
        }

        let mut wrong_version = params.clone();
        wrong_version.dist_function_version = 3;
        let json = serde_json::to_string(&wrong_version).unwrap();
        assert!(CameraParameters::from_json(&json).is_err());
    }
}
