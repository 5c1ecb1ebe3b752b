mod connection;
mod helpers;
mod migrations;
mod runs;

pub mod inspect;
pub mod models;
pub mod result_log;

pub use connection::Database;
pub use inspect::{summarize_store, RegionSummary, StoreSummary};
pub use models::{Reading, RunRecord, RunRecordStatus, StartEvent};
pub use result_log::{ResultLog, ResultLogOptions};
