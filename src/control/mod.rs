pub mod commands;
pub mod controller;
pub mod persisted;
pub mod run_loop;
pub mod state;
pub mod supervisor;

pub use controller::{RunController, StatusResponse};
pub use persisted::{PersistedRun, RunStateFile};
pub use run_loop::{RunContext, RunLoop, StepOutcome};
pub use state::{RunPhase, RunSession, StatusCell, TransitionError};
pub use supervisor::{ProcessExit, Supervisor, Terminator, WatchdogOutcome};
