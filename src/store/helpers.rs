use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use crate::tracking::slot::FeatureValue;

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn region_table(region_id: u32) -> String {
    format!("ROI_{region_id}")
}

pub fn region_id_from_table(name: &str) -> Option<u32> {
    name.strip_prefix("ROI_")?.parse().ok()
}

/// Quotes an identifier for interpolation into SQL. Column names are
/// validated before they reach here; quoting keeps keywords usable.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn feature_to_sql(value: Option<&FeatureValue>) -> Value {
    match value {
        Some(FeatureValue::Int(v)) => Value::Integer(*v),
        Some(FeatureValue::Real(v)) => Value::Real(*v),
        Some(FeatureValue::Text(v)) => Value::Text(v.clone()),
        None => Value::Null,
    }
}
