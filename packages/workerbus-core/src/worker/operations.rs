//! Typed worker operations.
//!
//! Thin wrappers over [`WorkerHandle::send`] that build each action's payload
//! with the field names the worker reads.

use super::actor::WorkerHandle;
use super::protocol::{Action, CommandResponse, JOB_KEY_FIELD};
use crate::error::{BusError, Result};
use serde_json::{json, Map, Value};

/// Upper bound on concurrent browser tabs.
pub const MAX_TABS: u32 = 10;

/// Tabs used when a caller does not say.
pub const DEFAULT_TABS: u32 = 3;

/// Clamp a requested tab count into `1..=MAX_TABS`.
pub fn clamp_tabs(tabs: u32) -> u32 {
    tabs.clamp(1, MAX_TABS)
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn job_payload(job_key: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(JOB_KEY_FIELD.to_string(), Value::String(job_key.to_string()));
    map
}

impl WorkerHandle {
    pub async fn ping(&self) -> Result<CommandResponse> {
        self.send(Action::Ping, Map::new()).await
    }

    pub async fn check_browser(&self) -> Result<CommandResponse> {
        self.send(Action::CheckBrowser, Map::new()).await
    }

    pub async fn new_window(&self) -> Result<CommandResponse> {
        self.send(Action::NewWindow, Map::new()).await
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        method: Option<&str>,
    ) -> Result<CommandResponse> {
        self.send(Action::Login, login_payload(email, password, method))
            .await
    }

    pub async fn submit_otp(&self, otp: &str, record_id: Option<&str>) -> Result<CommandResponse> {
        self.send(Action::Otp, otp_payload(otp, record_id)).await
    }

    pub async fn validate_excel_data(&self, report_id: &str) -> Result<CommandResponse> {
        self.send(Action::ValidateExcelData, job_payload(report_id)).await
    }

    pub async fn handle_cancelled_report(&self, report_id: &str) -> Result<CommandResponse> {
        self.send(Action::HandleCancelledReport, job_payload(report_id))
            .await
    }

    pub async fn delete_report(&self, report_id: &str) -> Result<CommandResponse> {
        self.send(Action::DeleteReport, job_payload(report_id)).await
    }

    /// Create `macro_count` assets for a report. A count below one is
    /// rejected before anything reaches the worker.
    pub async fn create_assets(
        &self,
        report_id: &str,
        macro_count: i64,
        tabs: u32,
    ) -> Result<CommandResponse> {
        if macro_count < 1 {
            return Err(BusError::InvalidArgument(format!(
                "invalid macro count: {}",
                macro_count
            )));
        }
        let mut body = job_payload(report_id);
        body.insert("macroCount".to_string(), json!(macro_count));
        body.insert("tabsNum".to_string(), json!(clamp_tabs(tabs)));
        self.send(Action::CreateAssets, body).await
    }

    pub async fn grab_ids(&self, report_id: &str, tabs: u32) -> Result<CommandResponse> {
        self.send(Action::GrabIds, tabbed(report_id, tabs)).await
    }

    pub async fn edit_macros(&self, report_id: &str, tabs: u32) -> Result<CommandResponse> {
        self.send(Action::EditMacros, control_payload_tabbed(report_id, tabs))
            .await
    }

    pub async fn check_macro_status(&self, report_id: &str, tabs: u32) -> Result<CommandResponse> {
        self.send(Action::CheckMacroStatus, tabbed(report_id, tabs))
            .await
    }

    pub async fn half_check_macro_status(
        &self,
        report_id: &str,
        tabs: u32,
    ) -> Result<CommandResponse> {
        self.send(Action::HalfCheckMacroStatus, tabbed(report_id, tabs))
            .await
    }

    /// Start processing a batch of reports. The batch id is the job key.
    pub async fn process_batch(
        &self,
        batch_id: &str,
        report_ids: &[String],
        tabs: u32,
    ) -> Result<CommandResponse> {
        self.send(Action::ProcessBatch, batch_payload(batch_id, report_ids, tabs))
            .await
    }

    pub async fn get_companies(&self) -> Result<CommandResponse> {
        self.send(Action::GetCompanies, Map::new()).await
    }

    pub async fn pause(&self, job_key: &str) -> Result<CommandResponse> {
        self.send(Action::Pause, control_payload(job_key)).await
    }

    pub async fn resume(&self, job_key: &str) -> Result<CommandResponse> {
        self.send(Action::Resume, control_payload(job_key)).await
    }

    pub async fn stop(&self, job_key: &str) -> Result<CommandResponse> {
        self.send(Action::Stop, control_payload(job_key)).await
    }

    /// Close the browser without stopping the worker process.
    pub async fn close_browser(&self) -> Result<CommandResponse> {
        self.send(Action::Close, Map::new()).await
    }
}

fn login_payload(email: &str, password: &str, method: Option<&str>) -> Map<String, Value> {
    payload(json!({
        "email": email,
        "password": password,
        "method": method,
    }))
}

fn otp_payload(otp: &str, record_id: Option<&str>) -> Map<String, Value> {
    payload(json!({ "otp": otp, "recordId": record_id }))
}

fn batch_payload(batch_id: &str, report_ids: &[String], tabs: u32) -> Map<String, Value> {
    let mut body = control_payload_tabbed(batch_id, tabs);
    body.insert("reportIds".to_string(), json!(report_ids));
    body
}

fn control_payload_tabbed(job_key: &str, tabs: u32) -> Map<String, Value> {
    let mut body = tabbed(job_key, tabs);
    body.insert("batchId".to_string(), json!(job_key));
    body
}

fn tabbed(job_key: &str, tabs: u32) -> Map<String, Value> {
    let mut body = job_payload(job_key);
    body.insert("tabsNum".to_string(), json!(clamp_tabs(tabs)));
    body
}

// Pause/resume/stop address the job by batch id as well.
fn control_payload(job_key: &str) -> Map<String, Value> {
    let mut body = job_payload(job_key);
    body.insert("batchId".to_string(), json!(job_key));
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventName, Room};
    use crate::worker::{EventSink, Worker, WorkerConfig};
    use std::sync::Arc;

    struct NullSink;

    impl EventSink for NullSink {
        fn publish(&self, _room: Room, _event: EventName, _payload: Value) {}
        fn end_session(&self, _job_key: &str) {}
    }

    #[test]
    fn test_clamp_tabs() {
        assert_eq!(clamp_tabs(0), 1);
        assert_eq!(clamp_tabs(3), 3);
        assert_eq!(clamp_tabs(10), 10);
        assert_eq!(clamp_tabs(25), 10);
    }

    #[test]
    fn test_payload_shapes() {
        let reports = vec!["r1".to_string(), "r2".to_string()];
        let cases = vec![
            (
                "login",
                login_payload("a@b.c", "pw", None),
                json!({"email": "a@b.c", "password": "pw", "method": null}),
            ),
            (
                "login with method",
                login_payload("a@b.c", "pw", Some("sms")),
                json!({"email": "a@b.c", "password": "pw", "method": "sms"}),
            ),
            (
                "otp",
                otp_payload("123456", None),
                json!({"otp": "123456", "recordId": null}),
            ),
            (
                "otp with record",
                otp_payload("123456", Some("rec-9")),
                json!({"otp": "123456", "recordId": "rec-9"}),
            ),
            ("delete report", job_payload("42"), json!({"reportId": "42"})),
            (
                "grab ids",
                tabbed("42", 50),
                json!({"reportId": "42", "tabsNum": 10}),
            ),
            (
                "check macro status",
                tabbed("42", 0),
                json!({"reportId": "42", "tabsNum": 1}),
            ),
            (
                "edit macros",
                control_payload_tabbed("42", 4),
                json!({"reportId": "42", "batchId": "42", "tabsNum": 4}),
            ),
            (
                "process batch",
                batch_payload("B1", &reports, 3),
                json!({"reportId": "B1", "batchId": "B1", "reportIds": ["r1", "r2"], "tabsNum": 3}),
            ),
            (
                "stop",
                control_payload("B1"),
                json!({"reportId": "B1", "batchId": "B1"}),
            ),
        ];

        for (name, body, expected) in cases {
            assert_eq!(Value::Object(body), expected, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_create_assets_rejects_zero_macros_without_spawning() {
        let config = WorkerConfig {
            program: "/nonexistent/workerbus-test-binary".into(),
            args: Vec::new(),
            ..WorkerConfig::default()
        };
        let worker = Worker::spawn(config, Arc::new(NullSink));

        // A send would fail with StartFailed; validation must come first.
        let result = worker.create_assets("42", 0, 3).await;
        assert!(matches!(result, Err(BusError::InvalidArgument(_))));
        worker.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_assets_sends_clamped_tabs() {
        // Echo the received tab count back in the response
        let script = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  tabs=$(printf '%s\n' "$line" | sed -n 's/.*"tabsNum":\([0-9]*\).*/\1/p')
  printf '{"id":%s,"status":"SUCCESS","tabs":%s}\n' "$id" "$tabs"
done"#;
        let config = WorkerConfig {
            program: "sh".into(),
            args: vec!["-c".to_string(), script.to_string()],
            ..WorkerConfig::default()
        };
        let worker = Worker::spawn(config, Arc::new(NullSink));

        let response = worker.create_assets("42", 5, 40).await.unwrap();
        assert_eq!(response.get("tabs"), Some(&json!(10)));
        worker.shutdown().await;
    }
}
