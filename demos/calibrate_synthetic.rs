//! Synthetic Calibration Example
//!
//! Renders a calibration target from several known poses, feeds the images
//! through the interactive calibration flow exactly as a live camera would,
//! and compares the recovered intrinsics with the ground truth.
//!
//! Usage:
//! ```bash
//! cargo run --example calibrate_synthetic -- \
//!   --pattern chessboard \
//!   --views 10 \
//!   --output output/synthetic
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use calib_camera::synthetic::SyntheticCamera;
use calib_camera::{
    util, CalibrationConfig, CalibrationFlow, CalibrationSession, CameraParameters, FlowEvent,
    FlowState, ImageSequenceSource, PatternType, ReprojectionErrors,
};
use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{error, info, warn};
use parking_lot::Mutex;

/// Synthetic end-to-end calibration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pattern type (chessboard, circles_grid, asymmetric_circles_grid)
    #[arg(short = 'p', long, default_value = "chessboard")]
    pattern: String,

    /// Number of rendered views
    #[arg(short = 'n', long, default_value = "10")]
    views: usize,

    /// Distance from the camera to the target centre, in pattern units
    #[arg(short = 'd', long, default_value = "500")]
    distance: f64,

    /// Directory for the calibration outputs
    #[arg(short = 'o', long, default_value = "output/synthetic")]
    output: PathBuf,
}

type CalibrationOutcome = Arc<Mutex<Option<(CameraParameters, ReprojectionErrors)>>>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    let pattern_type: PatternType = cli.pattern.parse()?;
    let spec = pattern_type.default_spec();
    let camera = SyntheticCamera::default();

    info!(
        "Rendering {} views of a {} {}x{} target at distance {}",
        cli.views,
        spec.pattern_type,
        spec.cols(),
        spec.rows(),
        cli.distance
    );
    let poses = camera.views(&spec, cli.views, cli.distance);
    let images = poses.iter().map(|pose| camera.render(&spec, pose)).collect();
    let mut source = ImageSequenceSource::from_images(images)?;

    let config = CalibrationConfig {
        pattern: spec,
        max_samples: cli.views,
        min_samples: cli.views.min(3),
        video: camera.resolution,
        ..CalibrationConfig::default()
    };
    let session = CalibrationSession::with_default_detector(config)?;

    let outcome: CalibrationOutcome = Arc::new(Mutex::new(None));
    let sink_outcome = outcome.clone();
    let sink = move |params: &CameraParameters, errors: &ReprojectionErrors| {
        *sink_outcome.lock() = Some((params.clone(), errors.clone()));
    };
    let mut flow = CalibrationFlow::new(session, Box::new(sink));

    // Leave the welcome screen.
    flow.handle_event(FlowEvent::Capture)?;
    util::ensure_output_dir(&cli.output)?;

    let mut index = 0;
    while !source.is_exhausted() && flow.state() == FlowState::Capturing {
        if !flow.frame(&mut source)? {
            continue;
        }
        let session = flow.session_mut();
        if !session.wait_for_detection(Duration::from_secs(10)) {
            warn!("view {index}: detection timed out");
            index += 1;
            continue;
        }
        let latest = session.latest_result();
        let overlay =
            util::create_detection_overlay(latest.frame.image(), &latest.points, latest.found_all);
        overlay.save(cli.output.join(format!("view_{index:02}.png")))?;

        match flow.handle_event(FlowEvent::Capture) {
            Ok(true) => info!("view {index}: {}", flow.status_text()),
            Ok(false) => warn!("view {index}: pattern not found"),
            Err(e) => error!("view {index}: calibration failed: {e}"),
        }
        index += 1;
    }

    if flow.state() == FlowState::Capturing {
        flow.handle_event(FlowEvent::Calibrate)?;
    }

    let Some((params, errors)) = outcome.lock().take() else {
        error!("no calibration result ({})", flow.status_text());
        return Ok(());
    };

    util::display_calibration_results(&params, &errors);
    let truth = camera.intrinsics;
    let got = params.intrinsics();
    info!(
        "Ground truth fx={:.2} fy={:.2} cx={:.2} cy={:.2}",
        truth[(0, 0)],
        truth[(1, 1)],
        truth[(0, 2)],
        truth[(1, 2)]
    );
    info!(
        "Relative focal error: fx {:.4}% fy {:.4}%",
        100.0 * (got.fx - truth[(0, 0)]).abs() / truth[(0, 0)],
        100.0 * (got.fy - truth[(1, 1)]).abs() / truth[(1, 1)]
    );

    params.save_dat(cli.output.join("camera_para.dat"))?;
    params.save_to_yaml(cli.output.join("camera_para.yaml"))?;
    util::export_samples_csv(flow.session().samples(), cli.output.join("samples.csv"))?;
    util::export_errors_csv(&errors, cli.output.join("errors.csv"))?;
    info!("Results written to {}", cli.output.display());

    Ok(())
}
