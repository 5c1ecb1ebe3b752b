use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::camera::{BuiltinCameras, CameraProvider};
use crate::config::{RunConfig, StoreMode};
use crate::error::RunError;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::settings::AgentSettings;
use crate::store::StartEvent;
use crate::tracking::TrackerRegistry;

use super::persisted::{PersistedRun, RunStateFile};
use super::run_loop::{drive_run, RunContext};
use super::state::{RunPhase, RunSession, StatusCell};
use super::supervisor::{ProcessExit, Supervisor, Terminator, WatchdogOutcome};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(flatten)]
    pub session: RunSession,
    pub metrics: MetricsSnapshot,
}

struct ActiveRun {
    run_id: String,
    config: RunConfig,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    supervisor: JoinHandle<WatchdogOutcome>,
}

impl ActiveRun {
    fn is_live(&self, session: &RunSession) -> bool {
        !self.handle.is_finished()
            && session.run_id.as_deref() == Some(self.run_id.as_str())
            && !session.status.is_terminal()
    }
}

/// Owns the lifecycle of at most one run. Cheap to clone; every clone drives
/// the same run.
#[derive(Clone)]
pub struct RunController {
    status: StatusCell,
    settings: AgentSettings,
    registry: Arc<TrackerRegistry>,
    cameras: Arc<dyn CameraProvider>,
    terminator: Arc<dyn Terminator>,
    metrics: MetricsCollector,
    state_file: Option<RunStateFile>,
    active: Arc<Mutex<Option<ActiveRun>>>,
}

impl RunController {
    pub fn new(settings: AgentSettings) -> Self {
        let state_file = settings.state_dir.as_deref().map(RunStateFile::in_dir);
        Self {
            status: StatusCell::new(),
            settings,
            registry: Arc::new(TrackerRegistry::with_builtins()),
            cameras: Arc::new(BuiltinCameras),
            terminator: Arc::new(ProcessExit),
            metrics: MetricsCollector::new(),
            state_file,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_registry(mut self, registry: TrackerRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_cameras(mut self, cameras: Arc<dyn CameraProvider>) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<RunSession> {
        self.status.subscribe()
    }

    /// Validates the configuration and launches a run. Returns as soon as the
    /// run is `Initialising`; the camera is opened by the run task.
    pub async fn start(&self, config: RunConfig) -> Result<StatusResponse, RunError> {
        let event = match config.result_store.mode {
            StoreMode::Fresh => StartEvent::Fresh,
            StoreMode::Append => StartEvent::Append,
        };
        self.launch(config, event).await?;
        Ok(self.status().await)
    }

    /// Cancels the active run, waits for its final flush and leaves the
    /// session `Stopped`. Calling it again is a no-op.
    pub async fn stop(&self) -> StatusResponse {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(run) => self.wind_down(run).await,
            None => {
                // A run that failed on its own is reported, then stopped.
                let session = self.status.snapshot();
                if let (RunPhase::Error, Some(run_id)) = (session.status, session.run_id) {
                    if let Err(err) = self.status.transition(&run_id, RunPhase::Stopped) {
                        warn!("{err}");
                    }
                }
            }
        }
        drop(active);
        self.status().await
    }

    pub async fn status(&self) -> StatusResponse {
        StatusResponse {
            session: self.status.snapshot(),
            metrics: self.metrics.get_snapshot().await,
        }
    }

    /// Picks up a run left behind by a crash or a watchdog kill. The store is
    /// reopened in append mode so timestamps continue past what is on disk.
    pub async fn resume_pending(&self) -> Result<Option<StatusResponse>, RunError> {
        let Some(file) = &self.state_file else {
            return Ok(None);
        };
        let persisted = match file.load() {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!("cannot read run state file: {err:#}");
                return Ok(None);
            }
        };

        let mut config = persisted.config;
        if config.result_store.path.exists() {
            config.result_store.mode = StoreMode::Append;
        } else {
            warn!(
                "result store {} of interrupted run {} is gone; starting it fresh",
                config.result_store.path.display(),
                persisted.run_id
            );
            config.result_store.mode = StoreMode::Fresh;
        }
        info!(
            "resuming run interrupted at {} (previous run_id {})",
            persisted.saved_at.to_rfc3339(),
            persisted.run_id
        );

        if let Err(err) = self.launch(config, StartEvent::CrashRecovery).await {
            // Keeping the file would retry the same failure at every boot.
            if let Err(clear_err) = file.clear() {
                error!("failed to clear run state file: {clear_err:#}");
            }
            return Err(err);
        }
        Ok(Some(self.status().await))
    }

    async fn launch(&self, config: RunConfig, event: StartEvent) -> Result<String, RunError> {
        // Everything that can be checked without hardware is checked first.
        config.validate()?;
        let tracker = self.registry.build(&config.tracker)?;
        let strategies = self.cameras.strategies(&config.camera)?;

        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            let session = self.status.snapshot();
            if run.is_live(&session) {
                if run.config == config {
                    info!("run {} already active with this configuration", run.run_id);
                    return Ok(run.run_id.clone());
                }
                return Err(RunError::AlreadyActive(run.run_id.clone()));
            }
        }
        if let Some(previous) = active.take() {
            self.wind_down(previous).await;
        }

        let run_id = Uuid::new_v4().to_string();
        let start_time = config.start_time.unwrap_or_else(Utc::now);
        self.status.begin(&run_id, start_time).map_err(|_| {
            RunError::AlreadyActive(self.status.snapshot().run_id.unwrap_or_default())
        })?;
        self.metrics.reset().await;

        if let Some(file) = &self.state_file {
            let persisted = PersistedRun {
                run_id: run_id.clone(),
                saved_at: Utc::now(),
                config: config.clone(),
            };
            if let Err(err) = file.save(&persisted) {
                warn!("run {run_id} will not survive a crash: {err:#}");
            }
        }

        info!(
            "starting run {run_id}: {} regions, tracker '{}', store {} ({})",
            config.regions.len(),
            config.tracker.name,
            config.result_store.path.display(),
            event.as_str()
        );

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let ctx = RunContext {
            run_id: run_id.clone(),
            config: config.clone(),
            settings: self.settings.clone(),
            tracker,
            strategies,
            status: self.status.clone(),
            metrics: self.metrics.clone(),
            start_event: event,
            state_file: self.state_file.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(drive_run(ctx, finished.clone()));

        let supervisor = Supervisor::new(
            run_id.clone(),
            self.status.clone(),
            cancel.clone(),
            finished,
            self.settings.watchdog_deadline(),
            self.settings.watchdog_grace(),
            Arc::clone(&self.terminator),
        );
        let supervisor = tokio::spawn(supervisor.run());

        *active = Some(ActiveRun {
            run_id: run_id.clone(),
            config,
            cancel,
            handle,
            supervisor,
        });
        Ok(run_id)
    }

    async fn wind_down(&self, run: ActiveRun) {
        run.cancel.cancel();
        match tokio::time::timeout(self.settings.stop_timeout(), run.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("run {} task failed: {err}", run.run_id),
            Err(_) => error!(
                "run {} did not wind down within {}ms; leaving it detached",
                run.run_id, self.settings.stop_timeout_ms
            ),
        }
        run.supervisor.abort();

        let session = self.status.snapshot();
        if session.run_id.as_deref() == Some(run.run_id.as_str()) && !matches!(session.status, RunPhase::Stopped) {
            if let Err(err) = self.status.transition(&run.run_id, RunPhase::Stopped) {
                warn!("{err}");
            }
        }
        info!("run {} stopped", run.run_id);
    }
}
