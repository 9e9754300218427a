use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};
use workerbus_core::hub::{ActiveSession, DisconnectReason};
use workerbus_core::worker::{clamp_tabs, JobStatus};
use workerbus_core::{BusError, CommandResponse, EventSink, JobEventPayload, Room};

use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Identify { owner_id: String },
    #[serde(rename_all = "camelCase")]
    JoinBatch { job_key: String },
    #[serde(rename_all = "camelCase")]
    LeaveBatch { job_key: String },
    #[serde(rename_all = "camelCase")]
    JoinProgress { job_key: String },
    #[serde(rename_all = "camelCase")]
    LeaveProgress { job_key: String },
    #[serde(rename_all = "camelCase")]
    StartProcessing {
        batch_id: String,
        #[serde(default)]
        report_ids: Vec<String>,
        #[serde(default)]
        num_tabs: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    PauseProcessing { batch_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeProcessing { batch_id: String },
    #[serde(rename_all = "camelCase")]
    StopProcessing { batch_id: String },
    GetActiveSessions,
    #[serde(rename_all = "camelCase")]
    GetProgressStatus { job_key: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "event")]
    Event { name: String, payload: Value },
    #[serde(rename = "connection_info")]
    ConnectionInfo {
        #[serde(rename = "connectionId")]
        connection_id: u64,
    },
}

impl ServerMessage {
    fn to_text(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("[ws] failed to encode message: {}", e);
                None
            }
        }
    }
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Generate unique connection ID
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let mut deliveries = state.hub.register(conn_id);
    info!(conn_id, "[ws] client connected");

    let info = ServerMessage::ConnectionInfo {
        connection_id: conn_id,
    };
    let sent = match info.to_text() {
        Some(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        None => false,
    };
    if !sent {
        // Connection failed immediately
        state.hub.disconnect(conn_id, DisconnectReason::Transient);
        return;
    }

    // Forward hub deliveries to the WebSocket in order
    let mut send_task = tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let msg = ServerMessage::Event {
                name: delivery.name,
                payload: delivery.payload,
            };
            let Some(text) = msg.to_text() else { continue };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        id: conn_id,
        owner: None,
        state: state.clone(),
    };
    let mut recv_task =
        tokio::spawn(async move { read_messages(&mut receiver, &mut conn).await });

    // Wait for either task to finish
    let reason = tokio::select! {
        result = &mut recv_task => {
            send_task.abort();
            result.unwrap_or(DisconnectReason::Transient)
        }
        _ = &mut send_task => {
            recv_task.abort();
            DisconnectReason::Transient
        }
    };

    info!(conn_id, ?reason, "[ws] client disconnected");
    state.hub.disconnect(conn_id, reason);
}

/// Handle client frames until the client goes away. A Close frame is an
/// intentional disconnect; anything else ending the stream is transient.
async fn read_messages<S>(receiver: &mut S, conn: &mut Connection) -> DisconnectReason
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => conn.handle(client_msg).await,
                Err(e) => {
                    debug!(conn_id = conn.id, "[ws] unreadable client message: {}", e);
                    conn.reply_error(format!("invalid message: {}", e));
                }
            },
            Ok(Message::Close(_)) => return DisconnectReason::Intentional,
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id = conn.id, "[ws] receive error: {}", e);
                break;
            }
        }
    }
    DisconnectReason::Transient
}

/// Per-connection command handling.
struct Connection {
    id: u64,
    owner: Option<String>,
    state: Arc<AppState>,
}

impl Connection {
    async fn handle(&mut self, msg: ClientMessage) {
        let hub = &self.state.hub;
        match msg {
            ClientMessage::Identify { owner_id } => {
                if owner_id.trim().is_empty() {
                    self.reply_error("ownerId is required".to_string());
                    return;
                }
                match hub.identify(self.id, &owner_id).await {
                    Ok(()) => {
                        info!(conn_id = self.id, owner = %owner_id, "[ws] connection identified");
                        self.owner = Some(owner_id);
                    }
                    Err(e) => self.reply_error(e.to_string()),
                }
            }
            ClientMessage::JoinBatch { job_key } => self.with_room(job_key, Room::Batch, true),
            ClientMessage::LeaveBatch { job_key } => self.with_room(job_key, Room::Batch, false),
            ClientMessage::JoinProgress { job_key } => self.with_room(job_key, Room::Progress, true),
            ClientMessage::LeaveProgress { job_key } => {
                self.with_room(job_key, Room::Progress, false)
            }
            ClientMessage::StartProcessing {
                batch_id,
                report_ids,
                num_tabs,
            } => self.start_processing(batch_id, report_ids, num_tabs),
            ClientMessage::PauseProcessing { batch_id } => {
                self.control(batch_id, ControlAction::Pause)
            }
            ClientMessage::ResumeProcessing { batch_id } => {
                self.control(batch_id, ControlAction::Resume)
            }
            ClientMessage::StopProcessing { batch_id } => {
                self.control(batch_id, ControlAction::Stop)
            }
            ClientMessage::GetActiveSessions => match hub.list_sessions().await {
                Ok(rows) => hub.send_to(self.id, "active_sessions", json!(rows)),
                Err(e) => self.reply_error(e.to_string()),
            },
            ClientMessage::GetProgressStatus { job_key } => {
                if job_key.is_empty() {
                    self.reply_error("jobKey is required".to_string());
                    return;
                }
                match hub.session_status(&job_key).await {
                    Ok(status) => hub.send_to(self.id, "progress_status", json!(status)),
                    Err(e) => self.reply_error(e.to_string()),
                }
            }
        }
    }

    fn reply_error(&self, error: String) {
        let payload = json!({
            "status": "FAILED",
            "error": error,
            "timestamp": Utc::now(),
        });
        self.state.hub.send_to(self.id, "error", payload);
    }

    fn with_room(&self, job_key: String, room: fn(String) -> Room, join: bool) {
        if job_key.is_empty() {
            self.reply_error("jobKey is required".to_string());
            return;
        }
        let room = room(job_key);
        if join {
            self.state.hub.join(self.id, room);
        } else {
            self.state.hub.leave(self.id, room);
        }
    }

    fn start_processing(&self, batch_id: String, report_ids: Vec<String>, num_tabs: Option<u32>) {
        if batch_id.is_empty() {
            self.reply_error("batchId is required".to_string());
            return;
        }
        if report_ids.is_empty() {
            self.reply_job_error(&batch_id, "reportIds must not be empty".to_string());
            return;
        }

        // Never more tabs than reports
        let tabs = clamp_tabs(num_tabs.unwrap_or(1)).min(report_ids.len() as u32);
        info!(
            conn_id = self.id,
            batch_id = %batch_id,
            reports = report_ids.len(),
            tabs,
            "[ws] processing started"
        );

        let hub = &self.state.hub;
        hub.join(self.id, Room::Batch(batch_id.clone()));
        hub.start_session(ActiveSession::new(
            &batch_id,
            self.owner.clone(),
            report_ids.clone(),
            tabs,
        ));
        let mut started = JobEventPayload::for_job(&batch_id, "STARTED");
        started.total = report_ids.len() as u64;
        started.num_tabs = u64::from(tabs);
        hub.publish_named(Room::Batch(batch_id.clone()), "started", started.to_value());

        let state = self.state.clone();
        let conn_id = self.id;
        tokio::spawn(async move {
            match state.worker.process_batch(&batch_id, &report_ids, tabs).await {
                Ok(response) => {
                    debug!(batch_id = %batch_id, status = %response.job_status().as_str(), "[ws] batch acknowledged")
                }
                // The router already told the batch room, which the requester joined
                Err(BusError::ActionFailed {
                    job_key: Some(_), ..
                }) => {
                    warn!(batch_id = %batch_id, "[ws] batch rejected by worker");
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, "[ws] batch failed to start: {}", e);
                    let payload = JobEventPayload::for_job(&batch_id, "FAILED").with_error(e.to_string());
                    state.hub.send_to(conn_id, "error", payload.to_value());
                    EventSink::end_session(&state.hub, &batch_id);
                }
            }
        });
    }

    fn control(&self, batch_id: String, action: ControlAction) {
        if batch_id.is_empty() {
            self.reply_error("batchId is required".to_string());
            return;
        }

        let state = self.state.clone();
        let conn_id = self.id;
        tokio::spawn(async move {
            let result = with_deadline(&state, action.send(&state, &batch_id)).await;
            match result {
                Ok(response) => action.apply(&state, &batch_id, &response),
                Err(e) => {
                    warn!(batch_id = %batch_id, action = action.name(), "[ws] control command failed: {}", e);
                    let payload = JobEventPayload::for_job(&batch_id, "FAILED").with_error(e.to_string());
                    state.hub.send_to(conn_id, "error", payload.to_value());
                }
            }
        });
    }

    fn reply_job_error(&self, batch_id: &str, error: String) {
        let payload = JobEventPayload::for_job(batch_id, "FAILED").with_error(error);
        self.state.hub.send_to(self.id, "error", payload.to_value());
    }
}

async fn with_deadline<F>(state: &AppState, fut: F) -> Result<CommandResponse, BusError>
where
    F: Future<Output = Result<CommandResponse, BusError>>,
{
    tokio::time::timeout(state.command_deadline, fut)
        .await
        .map_err(|_| BusError::Timeout)?
}

#[derive(Debug, Clone, Copy)]
enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl ControlAction {
    fn name(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Stop => "stop",
        }
    }

    async fn send(&self, state: &AppState, batch_id: &str) -> Result<CommandResponse, BusError> {
        match self {
            ControlAction::Pause => state.worker.pause(batch_id).await,
            ControlAction::Resume => state.worker.resume(batch_id).await,
            ControlAction::Stop => state.worker.stop(batch_id).await,
        }
    }

    /// Announce the worker's acknowledgement to the batch room.
    fn apply(&self, state: &AppState, batch_id: &str, response: &CommandResponse) {
        let hub = &state.hub;
        let room = Room::Batch(batch_id.to_string());
        match (self, response.job_status()) {
            (ControlAction::Pause, JobStatus::Other(s)) if s == "PAUSED" => {
                hub.set_session_status(batch_id, "PAUSED");
                hub.publish_named(room, "paused", JobEventPayload::for_job(batch_id, "PAUSED").to_value());
            }
            (ControlAction::Resume, JobStatus::Other(s)) if s == "RESUMED" => {
                hub.set_session_status(batch_id, "PROCESSING");
                hub.publish_named(room, "resumed", JobEventPayload::for_job(batch_id, "RESUMED").to_value());
            }
            // Responses carrying the job key were already announced by the router
            (ControlAction::Stop, JobStatus::Stopped) if response.job_key().is_none() => {
                hub.publish_named(room, "stopped", JobEventPayload::for_job(batch_id, "STOPPED").to_value());
                EventSink::end_session(hub, batch_id);
            }
            (_, status) => {
                debug!(batch_id, action = self.name(), status = status.as_str(), "[ws] control acknowledged");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use workerbus_core::hub::Delivery;
    use workerbus_core::{Hub, HubConfig, Worker, WorkerConfig};

    /// Acknowledges each action the way the worker does. `STOP_FIELDS`,
    /// `BATCH_STATUS` and `BATCH_FIELDS` shape the stop and batch replies.
    const CONTROL_WORKER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"action":"pause"'*) printf '{"id":%s,"status":"PAUSED"}\n' "$id" ;;
    *'"action":"resume"'*) printf '{"id":%s,"status":"RESUMED"}\n' "$id" ;;
    *'"action":"stop"'*) printf '{"id":%s,"status":"STOPPED"%s}\n' "$id" "$STOP_FIELDS" ;;
    *'"action":"processTaqeemBatch"'*)
      printf '{"id":%s,"status":"%s"%s}\n' "$id" "${BATCH_STATUS:-SUCCESS}" "$BATCH_FIELDS" ;;
    *) printf '{"id":%s,"status":"SUCCESS"}\n' "$id" ;;
  esac
done"#;

    fn app_state(env: &[(&str, &str)]) -> Arc<AppState> {
        let hub = Hub::spawn(HubConfig::default());
        let mut config = WorkerConfig {
            program: "sh".into(),
            args: vec!["-c".to_string(), CONTROL_WORKER.to_string()],
            ..WorkerConfig::default()
        };
        for (key, value) in env {
            config.env.insert(key.to_string(), value.to_string());
        }
        let worker = Worker::spawn(config, Arc::new(hub.clone()));
        Arc::new(AppState::new(worker, hub))
    }

    fn connect(state: &Arc<AppState>) -> (Connection, UnboundedReceiver<Delivery>) {
        let id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let deliveries = state.hub.register(id);
        let conn = Connection {
            id,
            owner: None,
            state: state.clone(),
        };
        (conn, deliveries)
    }

    /// Next delivery called `name`, skipping others.
    async fn next_named(rx: &mut UnboundedReceiver<Delivery>, name: &str) -> Delivery {
        loop {
            let delivery = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap_or_else(|_| panic!("no {} event", name))
                .unwrap();
            if delivery.name == name {
                return delivery;
            }
        }
    }

    /// Count further deliveries called `name` arriving within a short window.
    async fn count_more(rx: &mut UnboundedReceiver<Delivery>, name: &str) -> usize {
        let mut count = 0;
        while let Ok(Some(delivery)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            if delivery.name == name {
                count += 1;
            }
        }
        count
    }

    fn start(batch_id: &str, reports: usize, num_tabs: Option<u32>) -> ClientMessage {
        ClientMessage::StartProcessing {
            batch_id: batch_id.to_string(),
            report_ids: (1..=reports).map(|i| format!("r{}", i)).collect(),
            num_tabs,
        }
    }

    fn text(s: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(s.into()))
    }

    #[tokio::test]
    async fn test_close_frame_is_intentional() {
        let state = app_state(&[]);
        let (mut conn, mut rx) = connect(&state);

        let mut frames = stream::iter(vec![
            text(r#"{"type":"join_batch","jobKey":"B1"}"#),
            Ok(Message::Close(None)),
            text(r#"{"type":"join_batch","jobKey":"B2"}"#),
        ]);
        let reason = read_messages(&mut frames, &mut conn).await;
        assert_eq!(reason, DisconnectReason::Intentional);

        let joined = next_named(&mut rx, "room_joined").await;
        assert_eq!(joined.payload["room"], "batch_B1");
        assert_eq!(count_more(&mut rx, "room_joined").await, 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_is_transient() {
        let state = app_state(&[]);
        let (mut conn, mut rx) = connect(&state);

        let mut ended = stream::iter(vec![text("not json")]);
        assert_eq!(
            read_messages(&mut ended, &mut conn).await,
            DisconnectReason::Transient
        );
        assert_eq!(next_named(&mut rx, "error").await.payload["status"], "FAILED");

        let mut broken = stream::iter(vec![Err(axum::Error::new(std::io::Error::other("reset")))]);
        assert_eq!(
            read_messages(&mut broken, &mut conn).await,
            DisconnectReason::Transient
        );
    }

    #[tokio::test]
    async fn test_start_processing_caps_tabs_and_announces() {
        let state = app_state(&[]);
        let (mut conn, mut rx) = connect(&state);
        conn.handle(ClientMessage::Identify {
            owner_id: "alice".to_string(),
        })
        .await;

        conn.handle(start("B1", 2, Some(8))).await;
        let joined = next_named(&mut rx, "room_joined").await;
        assert_eq!(joined.payload["room"], "batch_B1");
        let started = next_named(&mut rx, "started").await;
        assert_eq!(started.payload["batchId"], "B1");
        assert_eq!(started.payload["total"], 2);
        assert_eq!(started.payload["numTabs"], 2);

        conn.handle(start("B2", 5, None)).await;
        let started = next_named(&mut rx, "started").await;
        assert_eq!(started.payload["batchId"], "B2");
        assert_eq!(started.payload["numTabs"], 1);

        let rows = state.hub.list_sessions().await.unwrap();
        assert_eq!(rows.len(), 2);
        let b1 = rows.iter().find(|row| row.batch_id == "B1").unwrap();
        assert_eq!(b1.total_reports, 2);
        assert_eq!(b1.status, "PROCESSING");
        assert_eq!(b1.user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_pause_and_resume_update_session() {
        let state = app_state(&[]);
        let (mut conn, mut rx) = connect(&state);
        conn.handle(start("B1", 3, Some(2))).await;
        next_named(&mut rx, "started").await;

        conn.handle(ClientMessage::PauseProcessing {
            batch_id: "B1".to_string(),
        })
        .await;
        let paused = next_named(&mut rx, "paused").await;
        assert_eq!(paused.payload["status"], "PAUSED");
        let status = state.hub.session_status("B1").await.unwrap();
        assert_eq!(status.session.unwrap().status, "PAUSED");

        conn.handle(ClientMessage::ResumeProcessing {
            batch_id: "B1".to_string(),
        })
        .await;
        let resumed = next_named(&mut rx, "resumed").await;
        assert_eq!(resumed.payload["status"], "RESUMED");
        let status = state.hub.session_status("B1").await.unwrap();
        assert_eq!(status.session.unwrap().status, "PROCESSING");
    }

    async fn stop_once(stop_fields: &str) {
        let state = app_state(&[("STOP_FIELDS", stop_fields)]);
        let (mut conn, mut rx) = connect(&state);
        conn.handle(start("B1", 1, None)).await;
        next_named(&mut rx, "started").await;

        conn.handle(ClientMessage::StopProcessing {
            batch_id: "B1".to_string(),
        })
        .await;
        let stopped = next_named(&mut rx, "stopped").await;
        assert_eq!(stopped.payload["status"], "STOPPED");
        assert_eq!(count_more(&mut rx, "stopped").await, 0);
        assert!(!state.hub.session_status("B1").await.unwrap().active);
    }

    #[tokio::test]
    async fn test_stop_reply_with_job_key_announced_once() {
        stop_once(r#","reportId":"B1""#).await;
    }

    #[tokio::test]
    async fn test_stop_reply_without_job_key_announced_once() {
        stop_once("").await;
    }

    async fn failed_batch_errors(batch_fields: &str) -> usize {
        let state = app_state(&[("BATCH_STATUS", "FAILED"), ("BATCH_FIELDS", batch_fields)]);
        let (mut conn, mut rx) = connect(&state);
        conn.handle(start("B1", 2, None)).await;

        let error = next_named(&mut rx, "error").await;
        assert_eq!(error.payload["status"], "FAILED");
        assert!(error.payload["error"].as_str().unwrap().contains("no browser"));
        let more = count_more(&mut rx, "error").await;
        assert!(!state.hub.session_status("B1").await.unwrap().active);
        1 + more
    }

    #[tokio::test]
    async fn test_failed_batch_reports_one_error() {
        assert_eq!(failed_batch_errors(r#","reportId":"B1","error":"no browser""#).await, 1);
        assert_eq!(failed_batch_errors(r#","error":"no browser""#).await, 1);
    }

    #[test]
    fn test_client_message_shapes() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"identify","ownerId":"u1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Identify { owner_id } if owner_id == "u1"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"start_processing","batchId":"B1","reportIds":["1","2"],"numTabs":4}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::StartProcessing {
                batch_id,
                report_ids,
                num_tabs,
            } => {
                assert_eq!(batch_id, "B1");
                assert_eq!(report_ids.len(), 2);
                assert_eq!(num_tabs, Some(4));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get_active_sessions"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::GetActiveSessions));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_progress","jobKey":"42"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinProgress { job_key } if job_key == "42"));
    }

    #[test]
    fn test_unknown_client_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let msg = ServerMessage::Event {
            name: "complete".to_string(),
            payload: json!({"percentage": 100.0}),
        };
        let value: Value = serde_json::from_str(&msg.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["name"], "complete");
        assert_eq!(value["payload"]["percentage"], 100.0);

        let info = ServerMessage::ConnectionInfo { connection_id: 7 };
        let value: Value = serde_json::from_str(&info.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "connection_info");
        assert_eq!(value["connectionId"], 7);
    }
}
