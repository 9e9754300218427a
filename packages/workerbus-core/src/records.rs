//! Merging extracted asset rows into stored report records.
//!
//! Extraction yields one row per asset, market sheet first, then cost. A
//! merge only happens when the extracted count matches what is stored; each
//! stored record keeps its own fields unless the extracted row overrides them.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::info;

/// One asset row, keyed by lower-cased column header.
pub type AssetRecord = Map<String, Value>;

/// Columns whose values are never reformatted as dates.
const NUMERIC_FIELDS: &[&str] = &[
    "final_value",
    "market_approach_value",
    "cost_approach_value",
    "value",
    "amount",
    "price",
    "quantity",
];

static DAY_FIRST_SLASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})/(\d{1,2})/(\d{4})").expect("valid regex"));
static YEAR_FIRST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})-(\d{1,2})-(\d{1,2})").expect("valid regex"));
static DAY_FIRST_DASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2})-(\d{1,2})-(\d{4})").expect("valid regex"));
static DATE_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,4}[/\-]\d{1,2}[/\-]\d{1,4}").expect("valid regex"));

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("report {0} not found")]
    NotFound(String),

    #[error("asset count mismatch: stored {stored}, extracted {extracted}")]
    CountMismatch { stored: usize, extracted: usize },
}

/// A report as persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredReport {
    pub report_id: String,
    pub asset_data: Vec<AssetRecord>,
    pub updated_at: DateTime<Utc>,
}

impl StoredReport {
    pub fn new(report_id: &str, asset_data: Vec<AssetRecord>) -> Self {
        Self {
            report_id: report_id.to_string(),
            asset_data,
            updated_at: Utc::now(),
        }
    }
}

/// Persistence for report records.
pub trait RecordStore {
    fn find(&self, report_id: &str) -> Option<StoredReport>;

    /// Replace a report's asset data. Last write wins.
    fn update(&mut self, report_id: &str, records: Vec<AssetRecord>) -> Result<StoredReport, RecordError>;
}

/// In-memory [`RecordStore`].
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    reports: HashMap<String, StoredReport>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, report: StoredReport) {
        self.reports.insert(report.report_id.clone(), report);
    }
}

impl RecordStore for MemoryRecordStore {
    fn find(&self, report_id: &str) -> Option<StoredReport> {
        self.reports.get(report_id).cloned()
    }

    fn update(&mut self, report_id: &str, records: Vec<AssetRecord>) -> Result<StoredReport, RecordError> {
        let report = self
            .reports
            .get_mut(report_id)
            .ok_or_else(|| RecordError::NotFound(report_id.to_string()))?;
        report.asset_data = records;
        report.updated_at = Utc::now();
        Ok(report.clone())
    }
}

/// Reformat a date-looking cell as `YYYY-MM-DD`. Anything else is returned
/// unchanged.
pub fn normalize_date(value: &str) -> String {
    if let Some(c) = DAY_FIRST_SLASH.captures(value) {
        return format!("{}-{:0>2}-{:0>2}", &c[3], &c[2], &c[1]);
    }
    if let Some(c) = YEAR_FIRST.captures(value) {
        return format!("{}-{:0>2}-{:0>2}", &c[1], &c[2], &c[3]);
    }
    if let Some(c) = DAY_FIRST_DASH.captures(value) {
        return format!("{}-{:0>2}-{:0>2}", &c[3], &c[2], &c[1]);
    }
    value.to_string()
}

fn normalize_cell(header: &str, value: Value) -> Value {
    let numeric = NUMERIC_FIELDS.contains(&header);
    match value {
        Value::Null => Value::String(String::new()),
        Value::String(s) if !numeric && DATE_LIKE.is_match(&s) => Value::String(normalize_date(&s)),
        Value::String(s) => Value::String(s),
        Value::Number(n) => Value::String(n.to_string()),
        other => other,
    }
}

fn normalize_row(row: AssetRecord, approach: &str) -> AssetRecord {
    let mut out: AssetRecord = row
        .into_iter()
        .map(|(header, value)| {
            let header = header.trim().to_lowercase();
            let value = normalize_cell(&header, value);
            (header, value)
        })
        .collect();

    let final_value = out
        .get("final_value")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .unwrap_or("0")
        .to_string();
    out.insert(format!("{}_approach_value", approach), Value::String(final_value));
    out.insert(format!("{}_approach", approach), Value::String("1".to_string()));
    out.insert("baseData".to_string(), Value::String(String::new()));
    out
}

/// Tag market rows and cost rows with their valuation approach and return
/// them in that order.
pub fn normalize_asset_rows(market: Vec<AssetRecord>, cost: Vec<AssetRecord>) -> Vec<AssetRecord> {
    market
        .into_iter()
        .map(|row| normalize_row(row, "market"))
        .chain(cost.into_iter().map(|row| normalize_row(row, "cost")))
        .collect()
}

/// Overlay extracted rows onto the stored report's records, index by index.
///
/// Nothing is written unless the counts match.
pub fn merge_extracted<S: RecordStore + ?Sized>(
    store: &mut S,
    report_id: &str,
    extracted: Vec<AssetRecord>,
) -> Result<StoredReport, RecordError> {
    let existing = store
        .find(report_id)
        .ok_or_else(|| RecordError::NotFound(report_id.to_string()))?;

    let stored = existing.asset_data.len();
    if stored != extracted.len() {
        return Err(RecordError::CountMismatch {
            stored,
            extracted: extracted.len(),
        });
    }

    let merged: Vec<AssetRecord> = existing
        .asset_data
        .into_iter()
        .zip(extracted)
        .map(|(mut record, row)| {
            record.extend(row);
            record
        })
        .collect();

    let saved = store.update(report_id, merged)?;
    info!(report_id, assets = saved.asset_data.len(), "[records] report updated");
    Ok(saved)
}
