//! Offline calibration from a set of still images.
//!
//! Every image is played through the calibration session as if it were a
//! live frame. Images where the whole pattern is found are accepted as
//! samples until the configured maximum is reached, then the camera is
//! calibrated.
//!
//! Usage:
//! ```bash
//! cargo run --example calibrate_images -- \
//!   --config samples/calibration.yaml \
//!   --output output/images \
//!   images/*.png
//! ```

use std::path::PathBuf;
use std::time::Duration;

use calib_camera::{
    util, CalibrationConfig, CalibrationSession, ErrorAverage, FrameSource, ImageSequenceSource,
};
use clap::Parser;
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Calibration settings (pattern, sample limits, detector options)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Directory for parameters, CSV dumps and detection overlays
    #[arg(short = 'o', long, default_value = "output/images")]
    output: PathBuf,

    /// Average reprojection errors over the sample count instead of count + 1
    #[arg(long)]
    mean_error: bool,

    /// Do not write detection overlays
    #[arg(long)]
    no_overlay: bool,

    /// Input images, all of the same size
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CalibrationConfig::load_from_yaml(path)?,
        None => CalibrationConfig::default(),
    };
    if cli.mean_error {
        config.solver.average = ErrorAverage::SampleCount;
    }

    println!("Loading {} images", cli.images.len());
    let mut source = ImageSequenceSource::open(&cli.images)?;
    config.video = source.resolution();
    config.validate()?;
    info!(
        "Pattern {} {}x{}, video {}x{}",
        config.pattern.pattern_type,
        config.pattern.cols(),
        config.pattern.rows(),
        config.video.width,
        config.video.height
    );

    let mut session = CalibrationSession::with_default_detector(config)?;
    util::ensure_output_dir(&cli.output)?;

    let mut index = 0;
    while !source.is_exhausted() && !session.is_full() {
        if !session.frame(&mut source)? {
            continue;
        }
        let path = &cli.images[index];
        index += 1;
        if !session.wait_for_detection(Duration::from_secs(30)) {
            warn!("{}: detection timed out", path.display());
            continue;
        }

        if !cli.no_overlay {
            let latest = session.latest_result();
            let overlay = util::create_detection_overlay(
                latest.frame.image(),
                &latest.points,
                latest.found_all,
            );
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("image_{index:03}"));
            overlay.save(cli.output.join(format!("{name}_corners.png")))?;
        }

        if session.accept_current_result() {
            println!(
                "{}: accepted ({}/{})",
                path.display(),
                session.sample_count(),
                session.max_samples()
            );
        } else {
            warn!("{}: pattern not found", path.display());
        }
    }

    if session.sample_count() < session.min_samples() {
        println!(
            "Only {} usable images, at least {} are needed",
            session.sample_count(),
            session.min_samples()
        );
        return Ok(());
    }

    let (params, errors) = session.solve()?;
    util::display_calibration_results(&params, &errors);

    params.save_dat(cli.output.join("camera_para.dat"))?;
    params.save_to_yaml(cli.output.join("camera_para.yaml"))?;
    std::fs::write(cli.output.join("camera_para.json"), params.to_json()?)?;
    util::export_samples_csv(session.samples(), cli.output.join("samples.csv"))?;
    util::export_errors_csv(&errors, cli.output.join("errors.csv"))?;
    println!("Results written to {}", cli.output.display());

    Ok(())
}
