mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ethotrack_lib::config::StoreMode;
use ethotrack_lib::control::{RunController, RunPhase};
use ethotrack_lib::error::ErrorKind;
use ethotrack_lib::settings::AgentSettings;
use ethotrack_lib::store::{summarize_store, RunRecordStatus};

use common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_source_that_never_delivers_is_failed_by_the_watchdog() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("hang.db");
    let settings = AgentSettings {
        watchdog_deadline_ms: 300,
        acquisition_timeout_ms: 1_000,
        ..fast_settings()
    };
    let bound = Duration::from_millis(settings.watchdog_deadline_ms + settings.acquisition_timeout_ms);
    let terminator = Arc::new(RecordingTerminator::default());
    let controller = RunController::new(settings)
        .with_cameras(Arc::new(FixedCameras(vec![hanging_backend("picamera2")])))
        .with_terminator(terminator.clone());

    let started = Instant::now();
    controller
        .start(run_config(&store, StoreMode::Fresh, "centroid"))
        .await
        .unwrap();
    let failed = wait_for(&controller, bound, |s| s.session.status == RunPhase::Error).await;
    assert!(started.elapsed() <= bound);

    let diagnostic = failed.session.last_error.unwrap();
    assert_eq!(diagnostic.kind, ErrorKind::WatchdogTimeout);
    assert!(diagnostic.message.contains("stuck in Initialising"));
    assert!(diagnostic
        .message
        .contains("acquiring frame 0 from backend 'picamera2'"));

    // the loop honours cancellation, so the process is never killed
    let stopped = controller.stop().await;
    assert_eq!(stopped.session.status, RunPhase::Stopped);
    assert_eq!(stopped.session.last_error.unwrap().kind, ErrorKind::WatchdogTimeout);
    assert!(terminator.reasons.lock().unwrap().is_empty());

    let summary = summarize_store(&store).unwrap();
    assert_eq!(summary.runs[0].status, RunRecordStatus::Failed);
    assert!(summary.runs[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("stuck in Initialising"));
    assert_eq!(summary.regions[0].rows, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausting_every_backend_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("exhausted.db");
    let controller = controller(
        fast_settings(),
        vec![
            failing_backend("picamera2", "No module named 'libbcm_host'"),
            failing_backend("v4l2", "VIDIOC_STREAMON: device busy"),
        ],
    );

    controller
        .start(run_config(&store, StoreMode::Fresh, "centroid"))
        .await
        .unwrap();
    let failed = wait_for(&controller, Duration::from_secs(3), |s| {
        s.session.status == RunPhase::Error
    })
    .await;

    let diagnostic = failed.session.last_error.unwrap();
    assert_eq!(diagnostic.kind, ErrorKind::FrameSource);
    assert!(diagnostic.message.contains("all 2 camera backends exhausted"));
    assert!(diagnostic.message.contains("device busy"));

    // error is terminal for the run; stop reports it and settles on Stopped
    let stopped = controller.stop().await;
    assert_eq!(stopped.session.status, RunPhase::Stopped);
    assert_eq!(stopped.session.last_error.unwrap().kind, ErrorKind::FrameSource);

    let summary = summarize_store(&store).unwrap();
    assert_eq!(summary.runs[0].status, RunRecordStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_new_start_after_an_error_gets_a_new_run_id() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(
        fast_settings(),
        vec![failing_backend("v4l2", "VIDIOC_STREAMON: device busy")],
    );

    let first = controller
        .start(run_config(&dir.path().join("a.db"), StoreMode::Fresh, "centroid"))
        .await
        .unwrap();
    wait_for(&controller, Duration::from_secs(3), |s| {
        s.session.status == RunPhase::Error
    })
    .await;

    let second = controller
        .start(run_config(&dir.path().join("b.db"), StoreMode::Fresh, "centroid"))
        .await
        .unwrap();
    assert_ne!(first.session.run_id, second.session.run_id);

    controller.stop().await;
}
