#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use ethotrack_lib::camera::{backend_factory, BackendError, BackendFactory, CameraProvider, CaptureBackend};
use ethotrack_lib::config::{
    CameraConfig, ExperimentInfo, RegionConfig, ResultStoreConfig, RunConfig, StoreMode,
    TrackerConfig,
};
use ethotrack_lib::control::{RunController, StatusResponse, Terminator};
use ethotrack_lib::error::ConfigError;
use ethotrack_lib::settings::AgentSettings;
use ethotrack_lib::tracking::{
    FeatureColumn, FeatureValue, Features, Geometry, Rect, RegionalFailure, SqlType, SubImage,
    TrackerRegistry, TrackerSlot, TrackerState,
};
use image::{GrayImage, Luma};

pub const FRAME_WIDTH: u32 = 90;
pub const FRAME_HEIGHT: u32 = 30;

/// Settings scaled down so scenarios finish in well under a second or two.
pub fn fast_settings() -> AgentSettings {
    AgentSettings {
        machine_id: "test-rig".into(),
        machine_name: "bench".into(),
        acquisition_timeout_ms: 200,
        attempts_per_backend: 2,
        watchdog_deadline_ms: 5_000,
        watchdog_grace_ms: 1_000,
        flush_interval_ms: 50,
        flush_max_rows: 30,
        stop_timeout_ms: 5_000,
        ..AgentSettings::default()
    }
}

/// Three 30x30 arenas side by side.
pub fn three_regions() -> Vec<RegionConfig> {
    (0..3)
        .map(|idx| RegionConfig {
            id: idx + 1,
            geometry: Geometry::Rect(Rect {
                x: idx * 30,
                y: 0,
                width: 30,
                height: 30,
            }),
        })
        .collect()
}

pub fn run_config(store: &Path, mode: StoreMode, tracker: &str) -> RunConfig {
    RunConfig {
        regions: three_regions(),
        tracker: TrackerConfig {
            name: tracker.into(),
            parameters: serde_json::Value::Null,
        },
        result_store: ResultStoreConfig {
            path: store.to_path_buf(),
            mode,
            sampling_interval_ms: None,
        },
        camera: CameraConfig::default(),
        start_time: None,
        experiment: ExperimentInfo {
            name: "integration".into(),
            location: "bench".into(),
            code: "T1".into(),
        },
    }
}

/// A bright frame with one dark 4x4 subject in the middle of each arena.
pub fn arena_frame() -> GrayImage {
    let mut image = GrayImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Luma([210]));
    for arena in 0..3u32 {
        let cx = arena * 30 + 13;
        for y in 13..17 {
            for x in cx..cx + 4 {
                image.put_pixel(x, y, Luma([10]));
            }
        }
    }
    image
}

/// Hands out the same strategies whatever the camera section says.
pub struct FixedCameras(pub Vec<Arc<dyn BackendFactory>>);

impl CameraProvider for FixedCameras {
    fn strategies(&self, _config: &CameraConfig) -> Result<Vec<Arc<dyn BackendFactory>>, ConfigError> {
        Ok(self.0.clone())
    }
}

struct StaticImage {
    image: GrayImage,
    pace: Duration,
}

impl CaptureBackend for StaticImage {
    fn grab(&mut self) -> Result<Option<GrayImage>, BackendError> {
        std::thread::sleep(self.pace);
        Ok(Some(self.image.clone()))
    }
}

pub fn static_backend(name: &str) -> Arc<dyn BackendFactory> {
    backend_factory(name, || {
        Ok(Box::new(StaticImage {
            image: arena_frame(),
            pace: Duration::from_millis(5),
        }) as Box<dyn CaptureBackend>)
    })
}

/// A driver whose open call never returns.
pub fn hanging_backend(name: &str) -> Arc<dyn BackendFactory> {
    backend_factory(name, || {
        std::thread::sleep(Duration::from_secs(3600));
        Err(BackendError::new("woke up"))
    })
}

pub fn failing_backend(name: &str, message: &'static str) -> Arc<dyn BackendFactory> {
    backend_factory(name, move || Err(BackendError::new(message)))
}

/// First open hangs until the attempt times out; every reopen fails with the
/// error a mismatched camera stack produces.
pub fn wedged_then_incompatible(name: &str, opens: Arc<AtomicUsize>) -> Arc<dyn BackendFactory> {
    backend_factory(name, move || {
        if opens.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_secs(3600));
        }
        Err(BackendError::new(
            "AttributeError: 'Picamera2' object has no attribute 'allocator'",
        ))
    })
}

#[derive(Default)]
pub struct RecordingTerminator {
    pub reasons: Mutex<Vec<String>>,
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, reason: &str) {
        self.reasons.lock().unwrap().push(reason.to_string());
    }
}

/// Fails every frame for one region, succeeds for the others.
pub struct FailsForRegion {
    pub region_id: u32,
}

impl TrackerSlot for FailsForRegion {
    fn name(&self) -> &str {
        "fails_for_region"
    }

    fn columns(&self) -> Vec<FeatureColumn> {
        vec![FeatureColumn::new("frames", SqlType::Integer, "count")]
    }

    fn update(
        &self,
        prior: TrackerState,
        sub_image: &SubImage<'_>,
    ) -> (TrackerState, Result<Features, RegionalFailure>) {
        let frames = prior.take::<i64>().unwrap_or(0) + 1;
        let result = if sub_image.region_id == self.region_id {
            Err(RegionalFailure::new("subject lost"))
        } else {
            Ok(Features::new().with("frames", FeatureValue::Int(frames)))
        };
        (TrackerState::new(frames), result)
    }
}

pub fn registry_with_failing_region(region_id: u32) -> TrackerRegistry {
    let mut registry = TrackerRegistry::with_builtins();
    registry.register("fails_for_region", move |_| {
        Ok(Arc::new(FailsForRegion { region_id }) as Arc<dyn TrackerSlot>)
    });
    registry
}

pub fn controller(settings: AgentSettings, backends: Vec<Arc<dyn BackendFactory>>) -> RunController {
    RunController::new(settings)
        .with_cameras(Arc::new(FixedCameras(backends)))
        .with_terminator(Arc::new(RecordingTerminator::default()))
}

/// Polls `status()` until `predicate` holds, panicking after `within`.
pub async fn wait_for<F>(controller: &RunController, within: Duration, predicate: F) -> StatusResponse
where
    F: Fn(&StatusResponse) -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let status = controller.status().await;
        if predicate(&status) {
            return status;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {within:?}; last status: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
