//! Export and visualization helpers: CSV dumps of accepted samples and
//! reprojection errors, and detection overlays for saved frames.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use image::{GrayImage, Rgb, RgbImage};
use log::info;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::camera::{CalibrationError, CameraParameters};
use crate::optimization::ReprojectionErrors;

/// Ensure the output directory exists
pub fn ensure_output_dir(dir: impl AsRef<Path>) -> Result<(), CalibrationError> {
    let dir = dir.as_ref();
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            CalibrationError::IOError(format!(
                "Failed to create output directory {}: {e}",
                dir.display()
            ))
        })?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SampleRow {
    sample: usize,
    index: usize,
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ErrorRow {
    sample: String,
    error: f64,
}

/// Writes one `sample,index,x,y` row per point.
pub fn write_samples_csv<W: io::Write>(
    samples: &[Vec<Point2<f64>>],
    writer: W,
) -> Result<(), CalibrationError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for (sample, points) in samples.iter().enumerate() {
        for (index, p) in points.iter().enumerate() {
            wtr.serialize(SampleRow {
                sample,
                index,
                x: p.x,
                y: p.y,
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Reads samples written by [`write_samples_csv`]. Rows must be grouped by
/// sample and ordered by index.
pub fn read_samples_csv<R: io::Read>(reader: R) -> Result<Vec<Vec<Point2<f64>>>, CalibrationError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut samples: Vec<Vec<Point2<f64>>> = Vec::new();
    for row in rdr.deserialize() {
        let row: SampleRow = row?;
        if row.sample == samples.len() {
            samples.push(Vec::new());
        }
        let points = samples
            .get_mut(row.sample)
            .filter(|points| points.len() == row.index)
            .ok_or_else(|| {
                CalibrationError::CsvError(format!(
                    "unexpected row sample={} index={}",
                    row.sample, row.index
                ))
            })?;
        points.push(Point2::new(row.x, row.y));
    }
    Ok(samples)
}

pub fn export_samples_csv(
    samples: &[Vec<Point2<f64>>],
    path: impl AsRef<Path>,
) -> Result<(), CalibrationError> {
    write_samples_csv(samples, File::create(path.as_ref())?)?;
    info!(
        "exported {} samples to {}",
        samples.len(),
        path.as_ref().display()
    );
    Ok(())
}

pub fn load_samples_csv(path: impl AsRef<Path>) -> Result<Vec<Vec<Point2<f64>>>, CalibrationError> {
    read_samples_csv(File::open(path.as_ref())?)
}

/// Writes `sample,error` rows: one per sample, then `min`, `avg` and `max`.
pub fn write_errors_csv<W: io::Write>(
    errors: &ReprojectionErrors,
    writer: W,
) -> Result<(), CalibrationError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for (k, e) in errors.per_sample.iter().enumerate() {
        wtr.serialize(ErrorRow {
            sample: k.to_string(),
            error: *e,
        })?;
    }
    for (name, value) in [("min", errors.min), ("avg", errors.avg), ("max", errors.max)] {
        wtr.serialize(ErrorRow {
            sample: name.to_string(),
            error: value,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn export_errors_csv(
    errors: &ReprojectionErrors,
    path: impl AsRef<Path>,
) -> Result<(), CalibrationError> {
    write_errors_csv(errors, File::create(path.as_ref())?)
}

/// Draws the detected points over a luma frame: green when the whole pattern
/// was found, red otherwise. Consecutive points are joined so the ordering is
/// visible.
pub fn create_detection_overlay(
    frame: &GrayImage,
    points: &[Point2<f64>],
    found_all: bool,
) -> RgbImage {
    let (width, height) = frame.dimensions();
    let mut img = RgbImage::from_fn(width, height, |x, y| {
        let v = frame.get_pixel(x, y)[0];
        Rgb([v, v, v])
    });
    let color = if found_all {
        Rgb([0, 220, 0])
    } else {
        Rgb([230, 0, 0])
    };

    let mut put = |x: i64, y: i64, c: Rgb<u8>| {
        if x >= 0 && y >= 0 && x < width as i64 && y < height as i64 {
            img.put_pixel(x as u32, y as u32, c);
        }
    };

    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let steps = (b - a).abs().max().ceil().max(1.0) as usize;
        for s in 0..=steps {
            let p = a + (b - a) * (s as f64 / steps as f64);
            put(p.x.round() as i64, p.y.round() as i64, Rgb([255, 200, 0]));
        }
    }

    // Draw each point as a small circle (radius 2)
    let radius = 2i64;
    for p in points {
        let (cx, cy) = (p.x.round() as i64, p.y.round() as i64);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    put(cx + dx, cy + dy, color);
                }
            }
        }
    }
    img
}

/// Logs the calibration outcome.
pub fn display_calibration_results(params: &CameraParameters, errors: &ReprojectionErrors) {
    let i = params.intrinsics();
    let [k1, k2, p1, p2] = params.distortion();
    info!("Calibration results:");
    info!(
        "  image size:  {}x{}",
        params.resolution.width, params.resolution.height
    );
    info!(
        "  intrinsics:  fx={:.4} fy={:.4} cx={:.4} cy={:.4}",
        i.fx, i.fy, i.cx, i.cy
    );
    info!(
        "  distortion:  k1={:.6} k2={:.6} p1={:.6} p2={:.6}",
        k1, k2, p1, p2
    );
    info!("  size factor: {:.6}", params.size_factor());
    for row in &params.mat {
        info!(
            "  [{:10.4} {:10.4} {:10.4} {:10.4}]",
            row[0], row[1], row[2], row[3]
        );
    }
    info!(
        "  error: min {:.4} avg {:.4} max {:.4} [pixel]",
        errors.min, errors.avg, errors.max
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn samples() -> Vec<Vec<Point2<f64>>> {
        vec![
            vec![Point2::new(1.5, 2.25), Point2::new(3.0, 4.0)],
            vec![Point2::new(10.0, 20.0), Point2::new(30.125, 40.5)],
        ]
    }

    #[test]
    fn test_samples_csv_layout() {
        let mut buf = Vec::new();
        write_samples_csv(&samples(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "sample,index,x,y");
        assert_eq!(lines[1], "0,0,1.5,2.25");
        assert_eq!(lines.len(), 5);

        let back = read_samples_csv(text.as_bytes()).unwrap();
        assert_eq!(back, samples());
    }

    #[test]
    fn test_samples_csv_rejects_gaps() {
        let text = "sample,index,x,y\n0,0,1,2\n0,2,3,4\n";
        assert!(read_samples_csv(text.as_bytes()).is_err());
        let text = "sample,index,x,y\n1,0,1,2\n";
        assert!(read_samples_csv(text.as_bytes()).is_err());
    }

    #[test]
    fn test_errors_csv() {
        let errors = ReprojectionErrors {
            min: 0.1,
            avg: 0.2,
            max: 0.4,
            per_sample: vec![0.1, 0.4],
        };
        let mut buf = Vec::new();
        write_errors_csv(&errors, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["sample,error", "0,0.1", "1,0.4", "min,0.1", "avg,0.2", "max,0.4"]
        );
    }

    #[test]
    fn test_overlay_colors() {
        let frame = GrayImage::from_pixel(20, 20, Luma([50]));
        let points = [Point2::new(5.0, 5.0), Point2::new(15.0, 5.0)];
        let img = create_detection_overlay(&frame, &points, true);
        assert_eq!(img.get_pixel(5, 5), &Rgb([0, 220, 0]));
        assert_eq!(img.get_pixel(10, 5), &Rgb([255, 200, 0]));
        assert_eq!(img.get_pixel(0, 19), &Rgb([50, 50, 50]));

        let img = create_detection_overlay(&frame, &points, false);
        assert_eq!(img.get_pixel(15, 5), &Rgb([230, 0, 0]));
    }

    #[test]
    fn test_file_export() {
        let dir = std::env::temp_dir().join("calib_camera_util_test");
        ensure_output_dir(&dir).unwrap();
        let path = dir.join("samples.csv");
        export_samples_csv(&samples(), &path).unwrap();
        assert_eq!(load_samples_csv(&path).unwrap(), samples());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
