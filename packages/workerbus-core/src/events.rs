//! Rooms and event payloads shared by the worker side and the hub.

use crate::worker::protocol::ProgressEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// A subscription group. Every job fans out to both granularities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Coarse batch status: `batch_<jobKey>`
    Batch(String),
    /// Per-unit progress: `progress_<jobKey>`
    Progress(String),
}

impl Room {
    pub fn both(job_key: &str) -> [Room; 2] {
        [
            Room::Batch(job_key.to_string()),
            Room::Progress(job_key.to_string()),
        ]
    }

    pub fn job_key(&self) -> &str {
        match self {
            Room::Batch(key) | Room::Progress(key) => key,
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::Batch(key) => write!(f, "batch_{}", key),
            Room::Progress(key) => write!(f, "progress_{}", key),
        }
    }
}

/// Names of events delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Progress,
    Complete,
    Stopped,
    Error,
    Started,
    Paused,
    Resumed,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Progress => "progress",
            EventName::Complete => "complete",
            EventName::Stopped => "stopped",
            EventName::Error => "error",
            EventName::Started => "started",
            EventName::Paused => "paused",
            EventName::Resumed => "resumed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of job-scoped events sent to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEventPayload {
    pub report_id: String,
    pub batch_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
    pub failed_records: u64,
    pub num_tabs: u64,
    /// Worker-specific fields passed through untouched (tab id, macro id, ...)
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl JobEventPayload {
    /// Payload for a job that only has a key and a status.
    pub fn for_job(job_key: &str, status: &str) -> Self {
        Self {
            report_id: job_key.to_string(),
            batch_id: job_key.to_string(),
            status: status.to_string(),
            message: None,
            error: None,
            current: 0,
            total: 0,
            percentage: 0.0,
            failed_records: 0,
            num_tabs: 1,
            details: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn from_progress(event: &ProgressEvent) -> Self {
        Self {
            report_id: event.job_key.clone(),
            batch_id: event.job_key.clone(),
            status: event.status.as_str().to_string(),
            message: event.message.clone(),
            error: event.error.clone(),
            current: event.current,
            total: event.total,
            percentage: event.percentage(),
            failed_records: event.failed_records,
            num_tabs: event.concurrency,
            details: event.extra.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
