use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, params_from_iter};

use crate::config::StoreMode;
use crate::error::{ResumeError, RunError};
use crate::settings::AgentSettings;
use crate::tracking::slot::FeatureColumn;

use super::connection::Database;
use super::helpers::{feature_to_sql, quote_ident, region_table};
use super::inspect::{summarize_store, StoreSummary};
use super::models::{Reading, RunRecord, RunRecordStatus, StartEvent};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultLogOptions {
    pub flush_interval: Duration,
    pub flush_max_rows: usize,
    /// Gap left after the last stored timestamp when appending.
    pub sampling_interval_ms: u64,
}

impl ResultLogOptions {
    pub fn from_settings(settings: &AgentSettings, sampling_override: Option<u64>) -> Self {
        Self {
            flush_interval: settings.flush_interval(),
            flush_max_rows: settings.flush_max_rows.max(1),
            sampling_interval_ms: sampling_override.unwrap_or(settings.sampling_interval_ms),
        }
    }
}

/// Buffered, append-only writer over one result store.
pub struct ResultLog {
    db: Database,
    path: PathBuf,
    columns: Vec<FeatureColumn>,
    last_t: HashMap<u32, Option<i64>>,
    pending: Vec<Reading>,
    last_flush: Instant,
    options: ResultLogOptions,
    time_offset: i64,
    flushes: u64,
    rows_written: u64,
    closed: bool,
}

impl ResultLog {
    /// Opens (fresh) or resumes (append) the store at `path` and makes sure a
    /// table exists for every region.
    pub async fn open(
        path: &Path,
        mode: StoreMode,
        region_ids: &[u32],
        columns: &[FeatureColumn],
        options: ResultLogOptions,
    ) -> Result<Self, RunError> {
        let mut last_t: HashMap<u32, Option<i64>> =
            region_ids.iter().map(|id| (*id, None)).collect();

        let (db, time_offset) = match mode {
            StoreMode::Fresh => {
                erase_existing(path).map_err(RunError::storage)?;
                let db = Database::new(path.to_path_buf()).map_err(RunError::storage)?;
                (db, 0)
            }
            StoreMode::Append => {
                let summary = resume_summary(path)?;
                check_columns(&summary, region_ids, columns)?;
                for region in &summary.regions {
                    if let Some(entry) = last_t.get_mut(&region.region_id) {
                        *entry = region.last_t;
                    }
                }

                let db = Database::new(path.to_path_buf()).map_err(|err| {
                    ResumeError(format!("cannot reopen {}: {err:#}", path.display()))
                })?;
                let interrupted = db
                    .interrupt_incomplete_runs()
                    .await
                    .map_err(|err| ResumeError(format!("cannot recover run table: {err:#}")))?;
                if !interrupted.is_empty() {
                    log_warn!(
                        "marked {} unfinished run(s) as interrupted: {}",
                        interrupted.len(),
                        interrupted.join(", ")
                    );
                }

                let time_offset = match summary.last_timestamp() {
                    Some(t_last) => t_last + options.sampling_interval_ms as i64,
                    None => 0,
                };
                log_info!(
                    "resuming {} with time offset {}ms (last stored t = {:?})",
                    path.display(),
                    time_offset,
                    summary.last_timestamp()
                );
                (db, time_offset)
            }
        };

        create_region_tables(&db, region_ids, columns)
            .await
            .map_err(RunError::storage)?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
            columns: columns.to_vec(),
            last_t,
            pending: Vec::new(),
            last_flush: Instant::now(),
            options,
            time_offset,
            flushes: 0,
            rows_written: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Added to every frame timestamp of this run.
    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn last_timestamp(&self, region_id: u32) -> Option<i64> {
        self.last_t.get(&region_id).copied().flatten()
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffers one reading and returns the region's new last timestamp. Flushes
    /// when the buffer is full or the flush interval has passed.
    pub async fn append(&mut self, reading: Reading) -> Result<i64, RunError> {
        if self.closed {
            return Err(RunError::Storage(format!(
                "result log {} is closed",
                self.path.display()
            )));
        }
        let Some(last) = self.last_t.get_mut(&reading.region_id) else {
            return Err(RunError::Storage(format!(
                "region {} has no table in {}",
                reading.region_id,
                self.path.display()
            )));
        };
        if let Some(previous) = *last {
            if reading.t <= previous {
                return Err(RunError::Storage(format!(
                    "non-monotonic timestamp for region {}: {} after {}",
                    reading.region_id, reading.t, previous
                )));
            }
        }
        *last = Some(reading.t);
        let t = reading.t;
        self.pending.push(reading);

        if self.pending.len() >= self.options.flush_max_rows
            || self.last_flush.elapsed() >= self.options.flush_interval
        {
            self.flush().await?;
        }
        Ok(t)
    }

    /// Writes every buffered reading in one transaction. On failure the rows
    /// stay buffered so a later flush can retry them.
    pub async fn flush(&mut self) -> Result<(), RunError> {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.pending);
        let column_names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        let count = batch.len();

        let result = {
            let batch = batch.clone();
            self.db
                .execute(move |conn| {
                    let tx = conn.transaction()?;
                    {
                        let column_list = std::iter::once("t".to_string())
                            .chain(std::iter::once("missing".to_string()))
                            .chain(column_names.iter().cloned())
                            .map(|name| quote_ident(&name))
                            .collect::<Vec<_>>()
                            .join(", ");
                        let placeholders = (1..=column_names.len() + 2)
                            .map(|idx| format!("?{idx}"))
                            .collect::<Vec<_>>()
                            .join(", ");

                        for reading in &batch {
                            let sql = format!(
                                "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
                                quote_ident(&region_table(reading.region_id))
                            );
                            let mut stmt = tx.prepare_cached(&sql)?;
                            let mut values = Vec::with_capacity(column_names.len() + 2);
                            values.push(rusqlite::types::Value::Integer(reading.t));
                            values.push(rusqlite::types::Value::Integer(
                                reading.is_missing() as i64,
                            ));
                            for name in &column_names {
                                let value = reading
                                    .features
                                    .as_ref()
                                    .and_then(|features| features.get(name));
                                values.push(feature_to_sql(value));
                            }
                            stmt.execute(params_from_iter(values.iter())).with_context(|| {
                                format!(
                                    "failed to insert reading t={} for region {}",
                                    reading.t, reading.region_id
                                )
                            })?;
                        }
                    }
                    tx.commit().context("failed to commit readings")?;
                    Ok(())
                })
                .await
        };

        match result {
            Ok(()) => {
                self.flushes += 1;
                self.rows_written += count as u64;
                Ok(())
            }
            Err(err) => {
                log::error!("flush of {count} readings to {} failed: {err:#}", self.path.display());
                let mut restored = batch;
                restored.append(&mut self.pending);
                self.pending = restored;
                Err(RunError::storage(err.context("failed to flush readings")))
            }
        }
    }

    pub async fn write_metadata(&self, entries: Vec<(String, String)>) -> Result<(), RunError> {
        self.db
            .execute(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO METADATA (field, value) VALUES (?1, ?2)
                         ON CONFLICT(field) DO UPDATE SET value = excluded.value",
                    )?;
                    for (field, value) in &entries {
                        stmt.execute(params![field, value])?;
                    }
                }
                tx.commit().context("failed to commit metadata")?;
                Ok(())
            })
            .await
            .map_err(RunError::storage)
    }

    pub async fn record_start_event(
        &self,
        t: i64,
        event: StartEvent,
        run_id: &str,
    ) -> Result<(), RunError> {
        let run_id = run_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO START_EVENTS (t, event, run_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![t, event.as_str(), run_id, Utc::now().to_rfc3339()],
                )
                .context("failed to record start event")?;
                Ok(())
            })
            .await
            .map_err(RunError::storage)
    }

    pub async fn begin_run(&self, run: &RunRecord) -> Result<(), RunError> {
        self.db.insert_run(run).await.map_err(RunError::storage)
    }

    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunRecordStatus,
        last_error: Option<String>,
    ) -> Result<(), RunError> {
        self.db
            .mark_run_status(run_id, status, last_error, Some(Utc::now()))
            .await
            .map_err(RunError::storage)
    }

    /// Final flush plus `stop_date_time`. A second call does nothing.
    pub async fn close(&mut self) -> Result<(), RunError> {
        if self.closed {
            return Ok(());
        }
        self.flush().await?;
        self.write_metadata(vec![(
            "stop_date_time".to_string(),
            Utc::now().to_rfc3339(),
        )])
        .await?;
        self.closed = true;
        log_info!(
            "closed result store {} ({} rows in {} flushes)",
            self.path.display(),
            self.rows_written,
            self.flushes
        );
        Ok(())
    }
}

fn erase_existing(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    log::warn!(
        "fresh run requested; erasing existing result store {}",
        path.display()
    );
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        let candidate = PathBuf::from(candidate);
        if candidate.exists() {
            fs::remove_file(&candidate)
                .with_context(|| format!("failed to remove {}", candidate.display()))?;
        }
    }
    Ok(())
}

fn resume_summary(path: &Path) -> Result<StoreSummary, ResumeError> {
    summarize_store(path).map_err(|err| {
        ResumeError(format!(
            "cannot append to {}: {err:#}",
            path.display()
        ))
    })
}

fn check_columns(
    summary: &StoreSummary,
    region_ids: &[u32],
    columns: &[FeatureColumn],
) -> Result<(), ResumeError> {
    let expected: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    for region_id in region_ids {
        let Some(region) = summary.region(*region_id) else {
            continue;
        };
        let stored: Vec<&str> = region.columns.iter().map(String::as_str).collect();
        if stored != expected {
            return Err(ResumeError(format!(
                "region {region_id} stores columns [{}] but the tracker writes [{}]",
                stored.join(", "),
                expected.join(", ")
            )));
        }
    }
    Ok(())
}

async fn create_region_tables(
    db: &Database,
    region_ids: &[u32],
    columns: &[FeatureColumn],
) -> anyhow::Result<()> {
    let region_ids = region_ids.to_vec();
    let columns = columns.to_vec();
    db.execute(move |conn| {
        let tx = conn.transaction()?;
        let feature_defs: String = columns
            .iter()
            .map(|column| format!(", {} {}", quote_ident(&column.name), column.sql_type.as_str()))
            .collect();
        for region_id in &region_ids {
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    t INTEGER NOT NULL UNIQUE,
                    missing INTEGER NOT NULL DEFAULT 0{feature_defs}
                );",
                quote_ident(&region_table(*region_id))
            ))
            .with_context(|| format!("failed to create table for region {region_id}"))?;
        }
        for column in &columns {
            tx.execute(
                "INSERT INTO VAR_MAP (var_name, sql_type, functional_type) VALUES (?1, ?2, ?3)
                 ON CONFLICT(var_name) DO UPDATE SET sql_type = excluded.sql_type,
                     functional_type = excluded.functional_type",
                params![column.name, column.sql_type.as_str(), column.functional_type],
            )?;
        }
        tx.commit().context("failed to commit region tables")?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::inspect::region_timestamps;
    use crate::tracking::slot::{FeatureValue, Features, SqlType};

    fn columns() -> Vec<FeatureColumn> {
        vec![
            FeatureColumn::new("x", SqlType::Real, "x"),
            FeatureColumn::new("area", SqlType::Integer, "area"),
        ]
    }

    fn options(max_rows: usize) -> ResultLogOptions {
        ResultLogOptions {
            flush_interval: Duration::from_secs(3600),
            flush_max_rows: max_rows,
            sampling_interval_ms: 100,
        }
    }

    fn reading(region_id: u32, t: i64) -> Reading {
        Reading {
            region_id,
            t,
            features: Some(
                Features::new()
                    .with("x", FeatureValue::Real(t as f64 / 10.0))
                    .with("area", FeatureValue::Int(12)),
            ),
        }
    }

    #[tokio::test]
    async fn buffers_until_max_rows_then_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.db");
        let mut log = ResultLog::open(&path, StoreMode::Fresh, &[1, 2], &columns(), options(4))
            .await
            .unwrap();

        for t in [0, 100, 200] {
            log.append(reading(1, t)).await.unwrap();
        }
        assert_eq!(log.flushes(), 0);
        assert_eq!(log.pending_rows(), 3);

        log.append(Reading::missing(2, 0)).await.unwrap();
        assert_eq!(log.flushes(), 1);
        assert_eq!(log.pending_rows(), 0);

        log.close().await.unwrap();
        let summary = summarize_store(&path).unwrap();
        assert_eq!(summary.region(1).unwrap().rows, 3);
        assert_eq!(summary.region(2).unwrap().missing, 1);
        assert_eq!(summary.region(1).unwrap().columns, vec!["x", "area"]);
        assert!(summary.metadata_value("stop_date_time").is_some());
    }

    #[tokio::test]
    async fn rejects_non_increasing_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ResultLog::open(
            &dir.path().join("run.db"),
            StoreMode::Fresh,
            &[1],
            &columns(),
            options(100),
        )
        .await
        .unwrap();

        assert_eq!(log.append(reading(1, 50)).await.unwrap(), 50);
        let err = log.append(reading(1, 50)).await.unwrap_err();
        assert!(err.to_string().contains("non-monotonic"));
        assert_eq!(log.last_timestamp(1), Some(50));
    }

    #[tokio::test]
    async fn append_resumes_after_the_last_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.db");
        {
            let mut log = ResultLog::open(&path, StoreMode::Fresh, &[1, 2], &columns(), options(100))
                .await
                .unwrap();
            log.append(reading(1, 9_000)).await.unwrap();
            log.append(reading(2, 10_000)).await.unwrap();
            log.close().await.unwrap();
        }

        let mut log = ResultLog::open(&path, StoreMode::Append, &[1, 2], &columns(), options(100))
            .await
            .unwrap();
        assert_eq!(log.time_offset(), 10_100);
        assert_eq!(log.last_timestamp(2), Some(10_000));
        assert!(log.append(reading(2, 10_000)).await.is_err());
        log.append(reading(1, log.time_offset())).await.unwrap();
        log.close().await.unwrap();

        assert_eq!(region_timestamps(&path, 1).unwrap(), vec![9_000, 10_100]);
    }

    #[tokio::test]
    async fn append_refuses_missing_and_mismatched_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.db");

        let err = ResultLog::open(&path, StoreMode::Append, &[1], &columns(), options(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Resume(_)));
        assert!(!path.exists());

        {
            let mut log = ResultLog::open(&path, StoreMode::Fresh, &[1], &columns(), options(10))
                .await
                .unwrap();
            log.close().await.unwrap();
        }
        let other = vec![FeatureColumn::new("activity", SqlType::Integer, "distance")];
        let err = ResultLog::open(&path, StoreMode::Append, &[1], &other, options(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RunError::Resume(_)));
        assert!(err.to_string().contains("activity"));
    }

    #[tokio::test]
    async fn fresh_mode_erases_previous_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.db");
        {
            let mut log = ResultLog::open(&path, StoreMode::Fresh, &[1], &columns(), options(1))
                .await
                .unwrap();
            log.append(reading(1, 5)).await.unwrap();
            log.close().await.unwrap();
        }

        let mut log = ResultLog::open(&path, StoreMode::Fresh, &[1], &columns(), options(1))
            .await
            .unwrap();
        assert_eq!(log.time_offset(), 0);
        log.append(reading(1, 0)).await.unwrap();
        log.close().await.unwrap();
        log.close().await.unwrap();

        assert_eq!(region_timestamps(&path, 1).unwrap(), vec![0]);
    }
}
