use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Diagnostic;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    #[default]
    Stopped,
    Initialising,
    Running,
    Error,
}

impl RunPhase {
    pub fn can_transition_to(self, next: RunPhase) -> bool {
        matches!(
            (self, next),
            (RunPhase::Stopped, RunPhase::Initialising)
                | (RunPhase::Initialising, RunPhase::Running)
                | (RunPhase::Initialising, RunPhase::Error)
                | (RunPhase::Initialising, RunPhase::Stopped)
                | (RunPhase::Running, RunPhase::Stopped)
                | (RunPhase::Running, RunPhase::Error)
                | (RunPhase::Error, RunPhase::Stopped)
        )
    }

    /// `Stopped` and `Error` end a run; a new start gets a new run id.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Stopped | RunPhase::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Stopped => "stopped",
            RunPhase::Initialising => "initialising",
            RunPhase::Running => "running",
            RunPhase::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSession {
    pub run_id: Option<String>,
    pub status: RunPhase,
    pub start_time: Option<DateTime<Utc>>,
    /// Added to every frame timestamp so a resumed store stays monotonic.
    pub time_offset: i64,
    pub last_transition_at: DateTime<Utc>,
    #[serde(skip)]
    pub last_transition: Instant,
    /// What the run is currently waiting on, for humans and the watchdog.
    pub activity: Option<String>,
    pub last_error: Option<Diagnostic>,
}

impl Default for RunSession {
    fn default() -> Self {
        Self {
            run_id: None,
            status: RunPhase::Stopped,
            start_time: None,
            time_offset: 0,
            last_transition_at: Utc::now(),
            last_transition: Instant::now(),
            activity: None,
            last_error: None,
        }
    }
}

impl RunSession {
    fn is_run(&self, run_id: &str) -> bool {
        self.run_id.as_deref() == Some(run_id)
    }

    fn enter(&mut self, next: RunPhase) {
        info!(
            "run {} {} -> {}",
            self.run_id.as_deref().unwrap_or("-"),
            self.status.as_str(),
            next.as_str()
        );
        self.status = next;
        self.last_transition_at = Utc::now();
        self.last_transition = Instant::now();
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("run {run_id} cannot go from {from:?} to {to:?}")]
    Invalid {
        run_id: String,
        from: RunPhase,
        to: RunPhase,
    },
    #[error("run {0} is no longer the current run")]
    StaleRun(String),
}

/// Single owner of the run session. The watch sender serialises every
/// read-modify-write and wakes subscribers on state changes only.
#[derive(Clone)]
pub struct StatusCell {
    tx: Arc<watch::Sender<RunSession>>,
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunSession::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> RunSession {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSession> {
        self.tx.subscribe()
    }

    /// Starts a new run. A run left in `Error` is first moved to `Stopped`.
    pub fn begin(&self, run_id: &str, start_time: DateTime<Utc>) -> Result<(), TransitionError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|session| {
            if session.status == RunPhase::Error {
                session.enter(RunPhase::Stopped);
            }
            if session.status != RunPhase::Stopped {
                result = Err(TransitionError::Invalid {
                    run_id: run_id.to_string(),
                    from: session.status,
                    to: RunPhase::Initialising,
                });
                return false;
            }
            session.run_id = Some(run_id.to_string());
            session.start_time = Some(start_time);
            session.time_offset = 0;
            session.activity = None;
            session.last_error = None;
            session.enter(RunPhase::Initialising);
            true
        });
        result
    }

    pub fn transition(&self, run_id: &str, next: RunPhase) -> Result<RunPhase, TransitionError> {
        let mut result = Err(TransitionError::StaleRun(run_id.to_string()));
        self.tx.send_if_modified(|session| {
            if !session.is_run(run_id) {
                return false;
            }
            let from = session.status;
            if !from.can_transition_to(next) {
                warn!("rejected transition of run {run_id}: {from:?} -> {next:?}");
                result = Err(TransitionError::Invalid {
                    run_id: run_id.to_string(),
                    from,
                    to: next,
                });
                return false;
            }
            session.enter(next);
            if next.is_terminal() {
                session.activity = None;
            }
            result = Ok(from);
            true
        });
        result
    }

    /// Moves the run to `Error` only if it is still in `expected`. Returns
    /// whether the diagnostic was recorded.
    pub fn fail_from(&self, run_id: &str, expected: RunPhase, diagnostic: Diagnostic) -> bool {
        self.tx.send_if_modified(|session| {
            if !session.is_run(run_id) || session.status != expected {
                return false;
            }
            if !session.status.can_transition_to(RunPhase::Error) {
                return false;
            }
            session.last_error = Some(diagnostic);
            session.enter(RunPhase::Error);
            true
        })
    }

    /// Moves a live run to `Error`. A run already in `Error` keeps its first
    /// diagnostic.
    pub fn fail(&self, run_id: &str, diagnostic: Diagnostic) -> bool {
        self.tx.send_if_modified(|session| {
            if !session.is_run(run_id) {
                return false;
            }
            match session.status {
                RunPhase::Initialising | RunPhase::Running => {
                    session.last_error = Some(diagnostic);
                    session.enter(RunPhase::Error);
                    true
                }
                RunPhase::Error => {
                    warn!(
                        "run {run_id} already failed; dropping later error: {}",
                        diagnostic.message
                    );
                    false
                }
                RunPhase::Stopped => {
                    warn!(
                        "run {run_id} already stopped; dropping error: {}",
                        diagnostic.message
                    );
                    false
                }
            }
        })
    }

    /// Updates the activity text without waking subscribers.
    pub fn set_activity(&self, run_id: &str, activity: Option<String>) {
        self.tx.send_if_modified(|session| {
            if session.is_run(run_id) && !session.status.is_terminal() {
                session.activity = activity;
            }
            false
        });
    }

    pub fn set_time_offset(&self, run_id: &str, time_offset: i64) {
        self.tx.send_if_modified(|session| {
            if session.is_run(run_id) {
                session.time_offset = time_offset;
            }
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn diag(message: &str) -> Diagnostic {
        Diagnostic::new(ErrorKind::FrameSource, message)
    }

    #[test]
    fn transition_table() {
        use RunPhase::*;
        assert!(Stopped.can_transition_to(Initialising));
        assert!(Initialising.can_transition_to(Running));
        assert!(Running.can_transition_to(Error));
        assert!(Error.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
        assert!(!Running.can_transition_to(Initialising));
    }

    #[test]
    fn normal_lifecycle() {
        let cell = StatusCell::new();
        cell.begin("r1", Utc::now()).unwrap();
        assert_eq!(cell.snapshot().status, RunPhase::Initialising);
        assert_eq!(cell.transition("r1", RunPhase::Running), Ok(RunPhase::Initialising));
        assert_eq!(cell.transition("r1", RunPhase::Stopped), Ok(RunPhase::Running));
        assert!(cell.transition("r1", RunPhase::Running).is_err());
    }

    #[test]
    fn begin_refuses_a_live_run() {
        let cell = StatusCell::new();
        cell.begin("r1", Utc::now()).unwrap();
        let err = cell.begin("r2", Utc::now()).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { from: RunPhase::Initialising, .. }));
        assert_eq!(cell.snapshot().run_id.as_deref(), Some("r1"));
    }

    #[test]
    fn first_error_wins_and_survives_stop() {
        let cell = StatusCell::new();
        cell.begin("r1", Utc::now()).unwrap();
        assert!(cell.fail("r1", diag("camera exhausted")));
        assert!(!cell.fail("r1", diag("flush failed")));
        cell.transition("r1", RunPhase::Stopped).unwrap();

        let session = cell.snapshot();
        assert_eq!(session.status, RunPhase::Stopped);
        assert_eq!(session.last_error.unwrap().message, "camera exhausted");
    }

    #[test]
    fn stale_run_ids_are_ignored() {
        let cell = StatusCell::new();
        cell.begin("old", Utc::now()).unwrap();
        cell.transition("old", RunPhase::Stopped).unwrap();
        cell.begin("new", Utc::now()).unwrap();

        assert!(!cell.fail("old", diag("late failure")));
        assert_eq!(
            cell.transition("old", RunPhase::Running),
            Err(TransitionError::StaleRun("old".into()))
        );
        assert_eq!(cell.snapshot().status, RunPhase::Initialising);
    }

    #[test]
    fn fail_from_only_fires_in_the_expected_phase() {
        let cell = StatusCell::new();
        cell.begin("r1", Utc::now()).unwrap();
        cell.transition("r1", RunPhase::Running).unwrap();
        assert!(!cell.fail_from("r1", RunPhase::Initialising, diag("stuck")));
        assert_eq!(cell.snapshot().status, RunPhase::Running);
    }

    #[tokio::test]
    async fn activity_updates_do_not_wake_subscribers() {
        let cell = StatusCell::new();
        let mut rx = cell.subscribe();
        cell.begin("r1", Utc::now()).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        cell.set_activity("r1", Some("acquiring frame 0".into()));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(cell.snapshot().activity.as_deref(), Some("acquiring frame 0"));
    }
}
