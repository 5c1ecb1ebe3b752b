use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime},
    models::{RunRecord, RunRecordStatus},
};

fn row_to_run(row: &Row) -> Result<RunRecord> {
    let started_at: String = row.get("started_at")?;
    let stopped_at: Option<String> = row.get("stopped_at")?;
    let status: String = row.get("status")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(RunRecord {
        run_id: row.get("run_id")?,
        started_at: parse_datetime(&started_at, "started_at")?,
        stopped_at: parse_optional_datetime(stopped_at, "stopped_at")?,
        status: status.parse()?,
        time_offset: row.get("time_offset")?,
        last_error: row.get("last_error")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

pub(crate) fn load_runs(conn: &Connection) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, stopped_at, status, time_offset, last_error, updated_at
         FROM RUNS
         ORDER BY started_at ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut runs = Vec::new();
    while let Some(row) = rows.next()? {
        runs.push(row_to_run(row)?);
    }
    Ok(runs)
}

impl Database {
    pub async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let record = run.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO RUNS (run_id, started_at, stopped_at, status, time_offset, last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.run_id,
                    record.started_at.to_rfc3339(),
                    record.stopped_at.as_ref().map(|dt| dt.to_rfc3339()),
                    record.status.as_str(),
                    record.time_offset,
                    record.last_error,
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| "failed to insert run record")?;
            Ok(())
        })
        .await
    }

    pub async fn mark_run_status(
        &self,
        run_id: &str,
        status: RunRecordStatus,
        last_error: Option<String>,
        stopped_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let run_id = run_id.to_string();
        let updated_at = Utc::now();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE RUNS
                 SET status = ?1,
                     last_error = COALESCE(?2, last_error),
                     stopped_at = ?3,
                     updated_at = ?4
                 WHERE run_id = ?5",
                params![
                    status.as_str(),
                    last_error,
                    stopped_at.map(|dt| dt.to_rfc3339()),
                    updated_at.to_rfc3339(),
                    run_id,
                ],
            )
            .with_context(|| "failed to update run status")?;
            Ok(())
        })
        .await
    }

    /// Runs still marked `Running` were cut short by a crash or power loss.
    pub async fn interrupt_incomplete_runs(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            let run_ids = {
                let mut stmt = tx.prepare("SELECT run_id FROM RUNS WHERE status = 'Running'")?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                ids
            };
            tx.execute(
                "UPDATE RUNS SET status = ?1, updated_at = ?2 WHERE status = 'Running'",
                params![RunRecordStatus::Interrupted.as_str(), Utc::now().to_rfc3339()],
            )?;
            tx.commit().context("failed to commit run recovery")?;
            Ok(run_ids)
        })
        .await
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        self.execute(|conn| load_runs(conn)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run_id: &str) -> RunRecord {
        let now = Utc::now();
        RunRecord {
            run_id: run_id.into(),
            started_at: now,
            stopped_at: None,
            status: RunRecordStatus::Running,
            time_offset: 0,
            last_error: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn incomplete_runs_become_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();

        db.insert_run(&record("a")).await.unwrap();
        db.insert_run(&record("b")).await.unwrap();
        db.mark_run_status("a", RunRecordStatus::Completed, None, Some(Utc::now()))
            .await
            .unwrap();

        let interrupted = db.interrupt_incomplete_runs().await.unwrap();
        assert_eq!(interrupted, vec!["b".to_string()]);

        let runs = db.list_runs().await.unwrap();
        let statuses: Vec<_> = runs.iter().map(|run| (run.run_id.as_str(), run.status)).collect();
        assert!(statuses.contains(&("a", RunRecordStatus::Completed)));
        assert!(statuses.contains(&("b", RunRecordStatus::Interrupted)));
    }

    #[tokio::test]
    async fn failure_keeps_the_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.db")).unwrap();
        db.insert_run(&record("c")).await.unwrap();
        db.mark_run_status(
            "c",
            RunRecordStatus::Failed,
            Some("all 2 camera backends exhausted".into()),
            Some(Utc::now()),
        )
        .await
        .unwrap();

        let runs = db.list_runs().await.unwrap();
        assert_eq!(runs[0].status, RunRecordStatus::Failed);
        assert_eq!(runs[0].last_error.as_deref(), Some("all 2 camera backends exhausted"));
        assert!(runs[0].stopped_at.is_some());
    }
}
