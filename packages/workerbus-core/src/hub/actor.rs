//! Hub actor: rooms, sessions and per-owner connection counting.

use super::rooms::{Delivery, Rooms, SubscriberId};
use super::sessions::{
    ActiveSession, CleanupTicket, DisconnectOutcome, DisconnectReason, SessionRegistry,
    SessionStatus, SessionSummary, DEFAULT_GRACE_PERIOD,
};
use crate::error::HubError;
use crate::events::{EventName, Room};
use crate::worker::EventSink;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Configuration for the hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Wait after an owner's last transient disconnect before cleanup
    pub grace_period: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Commands handled by the hub actor.
#[derive(Debug)]
pub enum HubCommand {
    Register {
        id: SubscriberId,
        tx: mpsc::UnboundedSender<Delivery>,
    },
    Identify {
        id: SubscriberId,
        owner: String,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Disconnect {
        id: SubscriberId,
        reason: DisconnectReason,
    },
    Join {
        id: SubscriberId,
        room: Room,
    },
    Leave {
        id: SubscriberId,
        room: Room,
    },
    Publish {
        room: Room,
        name: String,
        payload: Value,
    },
    SendTo {
        id: SubscriberId,
        name: String,
        payload: Value,
    },
    StartSession(ActiveSession),
    EndSession {
        job_key: String,
    },
    SetSessionStatus {
        job_key: String,
        status: String,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    SessionStatus {
        job_key: String,
        reply: oneshot::Sender<SessionStatus>,
    },
    Shutdown,
}

/// Owns every piece of subscriber state.
pub struct Hub {
    rooms: Rooms,
    sessions: SessionRegistry,
    /// Live connections per identified owner
    owners: HashMap<String, usize>,
    commands_rx: mpsc::UnboundedReceiver<HubCommand>,
    expiry_rx: mpsc::UnboundedReceiver<CleanupTicket>,
}

impl Hub {
    pub fn new(config: HubConfig) -> (Self, HubHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let hub = Self {
            rooms: Rooms::new(),
            sessions: SessionRegistry::new(config.grace_period, expiry_tx),
            owners: HashMap::new(),
            commands_rx,
            expiry_rx,
        };
        (hub, HubHandle { commands_tx })
    }

    pub fn spawn(config: HubConfig) -> HubHandle {
        let (hub, handle) = Self::new(config);
        tokio::spawn(hub.run());
        handle
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => {
                    match command {
                        Some(HubCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(ticket) = self.expiry_rx.recv() => {
                    if let Some(removed) = self.sessions.expire(&ticket) {
                        debug!(owner = %ticket.owner, removed, "[hub] delayed cleanup done");
                    }
                }
            }
        }
        info!("[hub] shutting down");
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { id, tx } => {
                self.rooms.register(id, tx);
                debug!(id, "[hub] subscriber registered");
            }
            HubCommand::Identify { id, owner, reply } => {
                let result = self.identify(id, &owner);
                let _ = reply.send(result);
            }
            HubCommand::Disconnect { id, reason } => self.disconnect(id, reason),
            HubCommand::Join { id, room } => match self.rooms.join(id, room.clone()) {
                Ok(_) => {
                    self.rooms.send_to(id, "room_joined", room_payload(&room));
                }
                Err(e) => warn!(id, %room, "[hub] join failed: {}", e),
            },
            HubCommand::Leave { id, room } => match self.rooms.leave(id, &room) {
                Ok(_) => {
                    self.rooms.send_to(id, "room_left", room_payload(&room));
                }
                Err(e) => warn!(id, %room, "[hub] leave failed: {}", e),
            },
            HubCommand::Publish {
                room,
                name,
                payload,
            } => {
                let delivered = self.rooms.publish(&room, &name, &payload);
                debug!(%room, %name, delivered, "[hub] published");
            }
            HubCommand::SendTo { id, name, payload } => {
                if !self.rooms.send_to(id, &name, payload) {
                    debug!(id, %name, "[hub] subscriber gone, dropping event");
                }
            }
            HubCommand::StartSession(session) => self.sessions.start_session(session),
            HubCommand::EndSession { job_key } => {
                self.sessions.end_session(&job_key);
            }
            HubCommand::SetSessionStatus { job_key, status } => {
                self.sessions.set_status(&job_key, &status);
            }
            HubCommand::ListSessions { reply } => {
                let _ = reply.send(self.sessions.list());
            }
            HubCommand::SessionStatus { job_key, reply } => {
                let _ = reply.send(self.sessions.status(&job_key));
            }
            // Handled by the run loop
            HubCommand::Shutdown => {}
        }
    }

    fn identify(&mut self, id: SubscriberId, owner: &str) -> Result<(), HubError> {
        if !self.rooms.identify(id, owner)? {
            return Ok(());
        }
        let count = self.owners.entry(owner.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.sessions.mark_connected(owner);
        }
        info!(id, owner, connections = *count, "[hub] subscriber identified");
        Ok(())
    }

    fn disconnect(&mut self, id: SubscriberId, reason: DisconnectReason) {
        let Some(owner) = self.rooms.unregister(id) else {
            debug!(id, "[hub] anonymous subscriber left");
            return;
        };

        let remaining = match self.owners.get_mut(&owner) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            debug!(id, %owner, remaining, "[hub] owner still connected elsewhere");
            return;
        }
        self.owners.remove(&owner);

        match self.sessions.mark_disconnected(&owner, reason, Some(id)) {
            DisconnectOutcome::CleanedUp(removed) => {
                info!(id, %owner, removed, "[hub] intentional disconnect, cleaned up")
            }
            DisconnectOutcome::Scheduled { seq } => {
                debug!(id, %owner, seq, "[hub] cleanup scheduled")
            }
        }
    }
}

fn room_payload(room: &Room) -> Value {
    json!({
        "room": room.name(),
        "jobKey": room.job_key(),
        "timestamp": Utc::now(),
    })
}

/// Cloneable front end of the hub actor.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands_tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    fn send(&self, command: HubCommand) {
        if self.commands_tx.send(command).is_err() {
            warn!("[hub] command dropped, hub has shut down");
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands_tx
            .send(build(reply))
            .map_err(|_| HubError::Shutdown)?;
        rx.await.map_err(|_| HubError::Shutdown)
    }

    /// Register a connection. Everything addressed to it arrives on the
    /// returned receiver in order.
    pub fn register(&self, id: SubscriberId) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(HubCommand::Register { id, tx });
        rx
    }

    pub async fn identify(&self, id: SubscriberId, owner: &str) -> Result<(), HubError> {
        let owner = owner.to_string();
        self.request(|reply| HubCommand::Identify { id, owner, reply })
            .await?
    }

    pub fn disconnect(&self, id: SubscriberId, reason: DisconnectReason) {
        self.send(HubCommand::Disconnect { id, reason });
    }

    pub fn join(&self, id: SubscriberId, room: Room) {
        self.send(HubCommand::Join { id, room });
    }

    pub fn leave(&self, id: SubscriberId, room: Room) {
        self.send(HubCommand::Leave { id, room });
    }

    /// Publish an event under any name, including ones outside [`EventName`].
    pub fn publish_named(&self, room: Room, name: &str, payload: Value) {
        self.send(HubCommand::Publish {
            room,
            name: name.to_string(),
            payload,
        });
    }

    pub fn send_to(&self, id: SubscriberId, name: &str, payload: Value) {
        self.send(HubCommand::SendTo {
            id,
            name: name.to_string(),
            payload,
        });
    }

    pub fn start_session(&self, session: ActiveSession) {
        self.send(HubCommand::StartSession(session));
    }

    pub fn set_session_status(&self, job_key: &str, status: &str) {
        self.send(HubCommand::SetSessionStatus {
            job_key: job_key.to_string(),
            status: status.to_string(),
        });
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, HubError> {
        self.request(|reply| HubCommand::ListSessions { reply }).await
    }

    pub async fn session_status(&self, job_key: &str) -> Result<SessionStatus, HubError> {
        let job_key = job_key.to_string();
        self.request(|reply| HubCommand::SessionStatus { job_key, reply })
            .await
    }

    pub fn shutdown(&self) {
        let _ = self.commands_tx.send(HubCommand::Shutdown);
    }
}

impl EventSink for HubHandle {
    fn publish(&self, room: Room, event: EventName, payload: Value) {
        self.publish_named(room, event.as_str(), payload);
    }

    fn end_session(&self, job_key: &str) {
        self.send(HubCommand::EndSession {
            job_key: job_key.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_named(rx: &mut mpsc::UnboundedReceiver<Delivery>, name: &str) -> Delivery {
        loop {
            let delivery = rx.recv().await.unwrap();
            if delivery.name == name {
                return delivery;
            }
        }
    }

    fn owned_session(job_key: &str, owner: &str) -> ActiveSession {
        ActiveSession::new(job_key, Some(owner.to_string()), vec!["r1".to_string()], 2)
    }

    #[tokio::test]
    async fn test_room_isolation() {
        let hub = Hub::spawn(HubConfig::default());
        let mut a = hub.register(1);
        let mut b = hub.register(2);

        hub.join(1, Room::Batch("A".to_string()));
        hub.join(2, Room::Batch("B".to_string()));
        assert_eq!(next_named(&mut a, "room_joined").await.payload["room"], "batch_A");
        assert_eq!(next_named(&mut b, "room_joined").await.payload["room"], "batch_B");

        EventSink::publish(&hub, Room::Batch("A".to_string()), EventName::Progress, json!({"current": 1}));
        hub.send_to(2, "marker", Value::Null);

        assert_eq!(a.recv().await.unwrap().name, "progress");
        // b sees the marker and nothing from batch_A before it
        assert_eq!(b.recv().await.unwrap().name, "marker");
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_end_session_through_sink() {
        let hub = Hub::spawn(HubConfig::default());
        hub.start_session(owned_session("B1", "alice"));
        assert_eq!(hub.list_sessions().await.unwrap().len(), 1);

        EventSink::end_session(&hub, "B1");
        assert!(hub.list_sessions().await.unwrap().is_empty());
        assert!(!hub.session_status("B1").await.unwrap().active);
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_keeps_sessions() {
        let hub = Hub::spawn(HubConfig::default());
        let _c1 = hub.register(1);
        hub.identify(1, "alice").await.unwrap();
        hub.start_session(owned_session("B1", "alice"));

        hub.disconnect(1, DisconnectReason::Transient);
        tokio::time::sleep(Duration::from_secs(10)).await;

        let _c2 = hub.register(2);
        hub.identify(2, "alice").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(hub.list_sessions().await.unwrap().len(), 1);
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_after_grace() {
        let hub = Hub::spawn(HubConfig::default());
        let _c1 = hub.register(1);
        hub.identify(1, "alice").await.unwrap();
        hub.start_session(owned_session("B1", "alice"));
        hub.start_session(owned_session("B2", "bob"));

        hub.disconnect(1, DisconnectReason::Transient);
        tokio::time::sleep(Duration::from_secs(24)).await;
        assert_eq!(hub.list_sessions().await.unwrap().len(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let rows = hub.list_sessions().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].batch_id, "B2");
        hub.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_connection_triggers_cleanup() {
        let hub = Hub::spawn(HubConfig::default());
        let _c1 = hub.register(1);
        let _c2 = hub.register(2);
        hub.identify(1, "alice").await.unwrap();
        hub.identify(2, "alice").await.unwrap();
        hub.start_session(owned_session("B1", "alice"));

        hub.disconnect(1, DisconnectReason::Intentional);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(hub.list_sessions().await.unwrap().len(), 1);

        hub.disconnect(2, DisconnectReason::Intentional);
        assert!(hub.list_sessions().await.unwrap().is_empty());
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_identify_conflict_is_reported() {
        let hub = Hub::spawn(HubConfig::default());
        let _c1 = hub.register(1);
        hub.identify(1, "alice").await.unwrap();
        assert_eq!(
            hub.identify(1, "bob").await,
            Err(HubError::AlreadyIdentified {
                existing: "alice".to_string()
            })
        );
        assert_eq!(hub.identify(9, "bob").await, Err(HubError::UnknownSubscriber(9)));
        hub.shutdown();
    }
}
