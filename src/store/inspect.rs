//! Read-side queries over a result store file, used for append-mode resume
//! and by the `inspect` command.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

use super::helpers::{quote_ident, region_id_from_table, region_table};
use super::models::RunRecord;
use super::runs::load_runs;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegionSummary {
    pub region_id: u32,
    pub rows: u64,
    pub missing: u64,
    pub first_t: Option<i64>,
    pub last_t: Option<i64>,
    /// Feature columns, without the reserved ones.
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartEventRecord {
    pub t: i64,
    pub event: String,
    pub run_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSummary {
    pub regions: Vec<RegionSummary>,
    pub metadata: Vec<(String, String)>,
    pub start_events: Vec<StartEventRecord>,
    pub runs: Vec<RunRecord>,
}

impl StoreSummary {
    /// Latest timestamp across every region table.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.regions.iter().filter_map(|region| region.last_t).max()
    }

    pub fn region(&self, region_id: u32) -> Option<&RegionSummary> {
        self.regions.iter().find(|region| region.region_id == region_id)
    }

    pub fn metadata_value(&self, field: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(key, _)| key == field)
            .map(|(_, value)| value.as_str())
    }
}

/// Opens an existing store without creating it. Fails on a missing file and on
/// anything that is not an ethotrack store.
fn open_existing(path: &Path) -> Result<Connection> {
    if !path.is_file() {
        bail!("result store {} does not exist", path.display());
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open result store {}", path.display()))?;

    let has_metadata: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'METADATA'",
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("{} is not a readable SQLite database", path.display()))?;
    if has_metadata == 0 {
        bail!("{} is not an ethotrack result store (no METADATA table)", path.display());
    }
    Ok(conn)
}

pub fn summarize_store(path: &Path) -> Result<StoreSummary> {
    let conn = open_existing(path)?;

    let tables: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'ROI\\_%' ESCAPE '\\'",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        names
    };

    let mut regions = Vec::new();
    for table in tables {
        let Some(region_id) = region_id_from_table(&table) else {
            continue;
        };
        regions.push(
            summarize_region(&conn, region_id)
                .with_context(|| format!("failed to read table {table}"))?,
        );
    }
    regions.sort_by_key(|region| region.region_id);

    let metadata = {
        let mut stmt = conn.prepare("SELECT field, value FROM METADATA ORDER BY field")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let start_events = {
        let mut stmt =
            conn.prepare("SELECT t, event, run_id, created_at FROM START_EVENTS ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StartEventRecord {
                    t: row.get(0)?,
                    event: row.get(1)?,
                    run_id: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let runs = load_runs(&conn)?;

    Ok(StoreSummary {
        regions,
        metadata,
        start_events,
        runs,
    })
}

fn summarize_region(conn: &Connection, region_id: u32) -> Result<RegionSummary> {
    let table = quote_ident(&region_table(region_id));

    let columns = {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        names
    };
    for required in ["t", "missing"] {
        if !columns.iter().any(|name| name == required) {
            bail!("region table for {region_id} has no '{required}' column");
        }
    }

    let (rows, missing, first_t, last_t): (i64, Option<i64>, Option<i64>, Option<i64>) = conn
        .query_row(
            &format!("SELECT COUNT(*), SUM(missing), MIN(t), MAX(t) FROM {table}"),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    Ok(RegionSummary {
        region_id,
        rows: rows.max(0) as u64,
        missing: missing.unwrap_or(0).max(0) as u64,
        first_t,
        last_t,
        columns: columns
            .into_iter()
            .filter(|name| !matches!(name.as_str(), "id" | "t" | "missing"))
            .collect(),
    })
}

/// Every timestamp of one region, in storage order.
pub fn region_timestamps(path: &Path, region_id: u32) -> Result<Vec<i64>> {
    let conn = open_existing(path)?;
    let table = quote_ident(&region_table(region_id));
    let mut stmt = conn.prepare(&format!("SELECT t FROM {table} ORDER BY id"))?;
    let stamps = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(stamps)
}

/// Timestamps of one region that were stored as missing.
pub fn missing_timestamps(path: &Path, region_id: u32) -> Result<Vec<i64>> {
    let conn = open_existing(path)?;
    let table = quote_ident(&region_table(region_id));
    let mut stmt = conn.prepare(&format!("SELECT t FROM {table} WHERE missing = 1 ORDER BY id"))?;
    let stamps = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(stamps)
}
