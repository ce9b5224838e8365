use std::sync::Arc;
use std::time::Duration;

use approx::assert_relative_eq;
use calib_camera::synthetic::SyntheticCamera;
use calib_camera::{
    util, CalibrationConfig, CalibrationFlow, CalibrationSession, CameraParameters,
    DetectionResult, FlowEvent, FlowState, ImageSequenceSource, PatternSpec, PatternType,
    ReprojectionErrors,
};
use image::{GrayImage, Luma};
use nalgebra::Point2;
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(10);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Flat frames whose grey level selects one of the precomputed projections.
fn keyed_session(
    camera: &SyntheticCamera,
    spec: PatternSpec,
    views: usize,
) -> (CalibrationSession, ImageSequenceSource) {
    let projections: Vec<Vec<Point2<f64>>> = camera
        .views(&spec, views, 500.0)
        .iter()
        .map(|pose| camera.project_pattern(&spec, pose))
        .collect();

    let extractor = move |image: &GrayImage, _: &PatternSpec| {
        match projections.get(image.get_pixel(0, 0)[0] as usize) {
            Some(points) => DetectionResult::found(points.clone()),
            None => DetectionResult::not_found(),
        }
    };

    let config = CalibrationConfig {
        pattern: spec,
        max_samples: views,
        video: camera.resolution,
        ..CalibrationConfig::default()
    };
    let session = CalibrationSession::new(config, Box::new(extractor)).unwrap();

    let (w, h) = (camera.resolution.width, camera.resolution.height);
    let frames = (0..views)
        .map(|k| GrayImage::from_pixel(w, h, Luma([k as u8])))
        .collect();
    (session, ImageSequenceSource::from_images(frames).unwrap())
}

#[test]
fn test_flow_calibrates_once_when_full() {
    init_logger();
    let camera = SyntheticCamera::default();
    let spec = PatternType::Chessboard.default_spec();
    let (session, mut source) = keyed_session(&camera, spec, 10);

    let results: Arc<Mutex<Vec<(CameraParameters, ReprojectionErrors)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink_results = results.clone();
    let sink = move |params: &CameraParameters, errors: &ReprojectionErrors| {
        sink_results.lock().push((params.clone(), errors.clone()));
    };
    let mut flow = CalibrationFlow::new(session, Box::new(sink));
    assert!(flow.handle_event(FlowEvent::Capture).unwrap());

    while !source.is_exhausted() {
        assert!(flow.frame(&mut source).unwrap());
        assert!(flow.session_mut().wait_for_detection(WAIT));
        assert!(flow.handle_event(FlowEvent::Capture).unwrap());
    }
    assert_eq!(flow.state(), FlowState::Done);
    assert_eq!(flow.session().sample_count(), 10);

    // Further captures in Done start over; they never re-invoke the sink.
    assert!(!flow.handle_event(FlowEvent::Undo).unwrap());
    let results = results.lock();
    assert_eq!(results.len(), 1);

    let (params, errors) = &results[0];
    let i = params.intrinsics();
    assert_relative_eq!(i.fx, 800.0, max_relative = 0.01);
    assert_relative_eq!(i.fy, 800.0, max_relative = 0.01);
    assert_relative_eq!(i.cx, 322.0, max_relative = 0.01);
    assert_relative_eq!(i.cy, 238.0, max_relative = 0.01);
    assert!(errors.avg < 0.01);
    assert!(errors.min <= errors.max);
    assert_eq!(errors.per_sample.len(), 10);
    assert_eq!(params.resolution, camera.resolution);
}

#[test]
fn test_solve_is_repeatable_and_persists() {
    init_logger();
    let camera = SyntheticCamera::default();
    let spec = PatternType::Chessboard.default_spec();
    let (mut session, mut source) = keyed_session(&camera, spec, 6);

    while !source.is_exhausted() {
        assert!(session.frame(&mut source).unwrap());
        assert!(session.wait_for_detection(WAIT));
        assert!(session.accept_current_result());
    }
    assert!(session.is_full());
    assert!(!session.accept_current_result());

    let (first, first_errors) = session.solve().unwrap();
    let (second, _) = session.solve().unwrap();
    assert_eq!(session.sample_count(), 6);
    assert_relative_eq!(
        first.intrinsics().fx,
        second.intrinsics().fx,
        max_relative = 1e-9
    );

    let restored = CameraParameters::from_dat_bytes(&first.to_dat_bytes()).unwrap();
    assert_eq!(restored, first);

    let dir = std::env::temp_dir().join("calib_camera_pipeline_test");
    util::ensure_output_dir(&dir).unwrap();
    let samples_path = dir.join("samples.csv");
    util::export_samples_csv(session.samples(), &samples_path).unwrap();
    assert_eq!(util::load_samples_csv(&samples_path).unwrap(), session.samples());
    util::export_errors_csv(&first_errors, dir.join("errors.csv")).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_undo_then_recapture_keeps_point_count() {
    init_logger();
    let camera = SyntheticCamera::default();
    let spec = PatternType::Chessboard.default_spec();
    let (mut session, mut source) = keyed_session(&camera, spec, 3);

    assert!(session.frame(&mut source).unwrap());
    assert!(session.wait_for_detection(WAIT));
    assert!(session.accept_current_result());
    assert!(session.undo_last());
    assert!(session.accept_current_result());
    assert_eq!(session.samples()[0].len(), spec.point_count());
    assert_eq!(session.samples()[0].len(), 35);
}

#[test]
fn test_asymmetric_grid_object_points() {
    let spec = PatternSpec::new(PatternType::AsymmetricCirclesGrid, (4, 11), 20.0).unwrap();
    let points = spec.object_points();
    assert_eq!(points.len(), 44);
    // Feature (i = 1, j = 1) sits on the staggered second row.
    let p = points[4 + 1];
    assert_relative_eq!(p.x, 60.0);
    assert_relative_eq!(p.y, 20.0);
    assert_relative_eq!(p.z, 0.0);
}
