//! Liveness watchdog for the initialisation phase of a run.

use std::{sync::Arc, time::Duration};

use log::{error, warn};
use tokio_util::sync::CancellationToken;

use crate::error::RunError;

use super::state::{RunPhase, StatusCell};

/// Exit status used when the watchdog has to kill the agent; the service
/// manager restarts it and the state file resumes the run.
const WATCHDOG_EXIT_CODE: i32 = 70;

/// Last-resort escalation when a run ignores cancellation.
pub trait Terminator: Send + Sync {
    fn terminate(&self, reason: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessExit;

impl Terminator for ProcessExit {
    fn terminate(&self, reason: &str) {
        error!("terminating process: {reason}");
        log::logger().flush();
        std::process::exit(WATCHDOG_EXIT_CODE);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// The run left `Initialising` in time (or is no longer ours to watch).
    Released,
    /// The run was stopped while the watchdog was waiting.
    Cancelled,
    /// Deadline hit; the loop wound down within the grace period.
    Fired,
    /// Deadline hit and the loop ignored cancellation.
    Terminated,
}

pub struct Supervisor {
    run_id: String,
    status: StatusCell,
    cancel: CancellationToken,
    finished: CancellationToken,
    deadline: Duration,
    grace: Duration,
    terminator: Arc<dyn Terminator>,
}

impl Supervisor {
    pub fn new(
        run_id: String,
        status: StatusCell,
        cancel: CancellationToken,
        finished: CancellationToken,
        deadline: Duration,
        grace: Duration,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            run_id,
            status,
            cancel,
            finished,
            deadline,
            grace,
            terminator,
        }
    }

    /// Sleeps until the run has spent `deadline` in `Initialising`, waking on
    /// every state change. Only reads the status cell and signals.
    pub async fn run(self) -> WatchdogOutcome {
        let mut rx = self.status.subscribe();

        loop {
            let (phase, since, ours) = {
                let session = rx.borrow_and_update();
                (
                    session.status,
                    session.last_transition,
                    session.run_id.as_deref() == Some(self.run_id.as_str()),
                )
            };
            if !ours || phase != RunPhase::Initialising {
                return WatchdogOutcome::Released;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return WatchdogOutcome::Cancelled,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return WatchdogOutcome::Released;
                    }
                }
                _ = tokio::time::sleep_until(since + self.deadline) => break,
            }
        }

        let activity = self
            .status
            .snapshot()
            .activity
            .unwrap_or_else(|| "no recorded activity".to_string());
        let message = format!(
            "run {} stuck in Initialising for more than {}ms while {}",
            self.run_id,
            self.deadline.as_millis(),
            activity
        );

        let diagnostic = RunError::WatchdogTimeout(message.clone()).diagnostic();
        if !self
            .status
            .fail_from(&self.run_id, RunPhase::Initialising, diagnostic)
        {
            // Lost the race against a transition; nothing to do.
            return WatchdogOutcome::Released;
        }
        error!("watchdog: {message}");
        self.cancel.cancel();

        tokio::select! {
            _ = self.finished.cancelled() => {
                warn!("watchdog: run {} wound down after cancellation", self.run_id);
                WatchdogOutcome::Fired
            }
            _ = tokio::time::sleep(self.grace) => {
                self.terminator.terminate(&message);
                WatchdogOutcome::Terminated
            }
        }
    }
}
