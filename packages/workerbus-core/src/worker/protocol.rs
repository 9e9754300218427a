//! Wire protocol spoken with the worker process.
//!
//! Both directions are newline-delimited JSON objects:
//! - outbound: `{"action": "...", "id": N, ...fields}`
//! - inbound response: `{"id": N, "status": "...", ...fields}`
//! - inbound progress: `{"type": "PROGRESS", "reportId": "...", "status": "...", ...}`
//!
//! Inbound frames share one shape on the wire; [`Frame::decode`] splits them
//! into explicit variants before anything else looks at them.

use crate::error::{BusError, Result};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Field carrying the job key on progress events and job-scoped responses.
pub const JOB_KEY_FIELD: &str = "reportId";

/// `type` tag that marks an unsolicited progress frame.
pub const PROGRESS_TYPE: &str = "PROGRESS";

/// Actions understood by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "check_browser")]
    CheckBrowser,
    #[serde(rename = "new_window")]
    NewWindow,
    #[serde(rename = "login")]
    Login,
    #[serde(rename = "otp")]
    Otp,
    #[serde(rename = "validate_excel_data")]
    ValidateExcelData,
    #[serde(rename = "handle_cancelled_report")]
    HandleCancelledReport,
    #[serde(rename = "delete_report")]
    DeleteReport,
    #[serde(rename = "create_assets")]
    CreateAssets,
    #[serde(rename = "grab_ids")]
    GrabIds,
    #[serde(rename = "edit_macros")]
    EditMacros,
    #[serde(rename = "check_macro_status")]
    CheckMacroStatus,
    #[serde(rename = "half_check_macro_status")]
    HalfCheckMacroStatus,
    #[serde(rename = "processTaqeemBatch")]
    ProcessBatch,
    #[serde(rename = "getCompanies")]
    GetCompanies,
    #[serde(rename = "pause")]
    Pause,
    #[serde(rename = "resume")]
    Resume,
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "close")]
    Close,
}

impl Action {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Ping => "ping",
            Action::CheckBrowser => "check_browser",
            Action::NewWindow => "new_window",
            Action::Login => "login",
            Action::Otp => "otp",
            Action::ValidateExcelData => "validate_excel_data",
            Action::HandleCancelledReport => "handle_cancelled_report",
            Action::DeleteReport => "delete_report",
            Action::CreateAssets => "create_assets",
            Action::GrabIds => "grab_ids",
            Action::EditMacros => "edit_macros",
            Action::CheckMacroStatus => "check_macro_status",
            Action::HalfCheckMacroStatus => "half_check_macro_status",
            Action::ProcessBatch => "processTaqeemBatch",
            Action::GetCompanies => "getCompanies",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Stop => "stop",
            Action::Close => "close",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound command. Built by the correlator once an id is allocated.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
    pub action: Action,
    pub id: u64,
}

impl Command {
    /// `action` and `id` always win over same-named payload fields.
    pub fn new(id: u64, action: Action, mut payload: Map<String, Value>) -> Self {
        payload.remove("action");
        payload.remove("id");
        Self {
            payload,
            action,
            id,
        }
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| BusError::WriteFailed(format!("failed to encode command: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

/// Status carried by progress events (and echoed by job-scoped responses).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Progress,
    Completed,
    Failed,
    Error,
    Stopped,
    Success,
    Other(String),
}

impl JobStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "PROGRESS" => JobStatus::Progress,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "ERROR" => JobStatus::Error,
            "STOPPED" => JobStatus::Stopped,
            "SUCCESS" => JobStatus::Success,
            other => JobStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Progress => "PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Error => "ERROR",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Success => "SUCCESS",
            JobStatus::Other(s) => s,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Error)
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Reply to a specific command, matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub id: u64,
    pub status: String,
    /// Everything else the worker sent back.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandResponse {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Job key when the response is scoped to a job.
    pub fn job_key(&self) -> Option<String> {
        job_key_of(&self.fields)
    }

    pub fn job_status(&self) -> JobStatus {
        JobStatus::parse(&self.status)
    }

    /// The worker explicitly reported that the command failed.
    pub fn is_failure(&self) -> bool {
        self.job_status().is_failure()
    }

    /// Human-readable reason for a failed command.
    pub fn failure_message(&self) -> String {
        string_field(&self.fields, "error")
            .or_else(|| string_field(&self.fields, "message"))
            .unwrap_or_else(|| format!("worker reported {}", self.status))
    }
}

/// Asynchronous progress report for a long-running job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_key: String,
    pub status: JobStatus,
    pub current: u64,
    pub total: u64,
    pub percentage: Option<f64>,
    pub failed_records: u64,
    /// Number of parallel browser tabs the worker is using.
    pub concurrency: u64,
    pub message: Option<String>,
    pub error: Option<String>,
    /// The frame as received, minus the fields decoded above.
    pub extra: Map<String, Value>,
}

impl ProgressEvent {
    fn from_fields(job_key: String, mut fields: Map<String, Value>) -> Self {
        let status = string_field(&fields, "status")
            .map(|s| JobStatus::parse(&s))
            .unwrap_or(JobStatus::Progress);
        let current = first_u64(&fields, &["current", "assetIndex"]).unwrap_or(0);
        let total = first_u64(&fields, &["total"]).unwrap_or(0);
        let percentage = fields.get("percentage").and_then(number_f64);
        let failed_records = first_u64(&fields, &["failed_records", "failedRecords"]).unwrap_or(0);
        let concurrency = first_u64(&fields, &["numTabs", "tabsNum"]).unwrap_or(1);
        let message = string_field(&fields, "message");
        let error = string_field(&fields, "error");

        for key in [
            "type",
            JOB_KEY_FIELD,
            "status",
            "current",
            "total",
            "percentage",
            "failed_records",
            "failedRecords",
            "numTabs",
            "tabsNum",
            "message",
            "error",
        ] {
            fields.remove(key);
        }

        Self {
            job_key,
            status,
            current,
            total,
            percentage,
            failed_records,
            concurrency,
            message,
            error,
            extra: fields,
        }
    }

    /// Reported percentage, or one derived from `current / total`.
    pub fn percentage(&self) -> f64 {
        if let Some(p) = self.percentage {
            return p;
        }
        if self.total > 0 {
            (self.current as f64 * 100.0 / self.total as f64).min(100.0)
        } else {
            0.0
        }
    }
}

/// An inbound frame after classification.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(CommandResponse),
    Progress(ProgressEvent),
}

impl Frame {
    /// Decode one line from the worker.
    ///
    /// A frame with an integer `id` is a command response. Otherwise a frame
    /// tagged `"type": "PROGRESS"` and carrying a job key is a progress event.
    /// Anything else is malformed.
    pub fn decode(line: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| BusError::MalformedFrame(format!("{}: {}", e, truncate(line, 200))))?;

        let Value::Object(mut fields) = value else {
            return Err(BusError::MalformedFrame(format!(
                "expected a JSON object: {}",
                truncate(line, 200)
            )));
        };

        if let Some(id) = fields.get("id").and_then(Value::as_u64) {
            fields.remove("id");
            let status = fields
                .remove("status")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            return Ok(Frame::Response(CommandResponse { id, status, fields }));
        }

        if fields.get("type").and_then(Value::as_str) != Some(PROGRESS_TYPE) {
            return Err(BusError::MalformedFrame(format!(
                "untagged frame without a correlation id: {}",
                truncate(line, 200)
            )));
        }

        match job_key_of(&fields) {
            Some(job_key) => Ok(Frame::Progress(ProgressEvent::from_fields(job_key, fields))),
            None => Err(BusError::MalformedFrame(format!(
                "progress frame without a job key: {}",
                truncate(line, 200)
            ))),
        }
    }
}

fn job_key_of(fields: &Map<String, Value>) -> Option<String> {
    match fields.get(JOB_KEY_FIELD)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// First field among `keys` holding a non-zero count (number or numeric string).
fn first_u64(fields: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .filter_map(|v| match v {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .find(|n| *n > 0)
}

fn number_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
