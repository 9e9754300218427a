//! Active job sessions and delayed cleanup of disconnected owners.
//!
//! A transient disconnect only arms a cleanup timer; reconnecting within the
//! grace period cancels it and nothing is lost. Cleanup forgets the owner's
//! sessions but never stops their jobs on the worker.

use super::rooms::SubscriberId;
use crate::timer::TimerHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Default wait before cleaning up after a transient disconnect.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(25);

/// A job started on behalf of an owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub job_key: String,
    pub owner: Option<String>,
    pub report_ids: Vec<String>,
    pub num_tabs: u32,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

impl ActiveSession {
    pub fn new(job_key: &str, owner: Option<String>, report_ids: Vec<String>, num_tabs: u32) -> Self {
        Self {
            job_key: job_key.to_string(),
            owner,
            report_ids,
            num_tabs,
            status: "PROCESSING".to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            batch_id: self.job_key.clone(),
            started_at: self.started_at,
            total_reports: self.report_ids.len(),
            status: self.status.clone(),
            user_id: self.owner.clone(),
        }
    }
}

/// Row of the active-sessions listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub total_reports: usize,
    pub status: String,
    pub user_id: Option<String>,
}

/// Answer to a progress-status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub job_key: String,
    pub active: bool,
    pub session: Option<ActiveSession>,
}

/// Why a subscriber went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the connection itself
    Intentional,
    /// Network drop, error or server-side loss
    Transient,
}

/// Sent by a cleanup timer when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupTicket {
    pub owner: String,
    pub seq: u64,
}

/// What a disconnect did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Cleanup ran now and removed this many sessions
    CleanedUp(usize),
    /// Cleanup will run after the grace period unless the owner returns
    Scheduled { seq: u64 },
}

#[derive(Debug)]
struct PendingCleanup {
    timer: TimerHandle,
    disconnected_at: DateTime<Utc>,
    last_connection: Option<SubscriberId>,
}

/// Active sessions by job key plus per-owner pending cleanups.
#[derive(Debug)]
pub struct SessionRegistry {
    grace_period: Duration,
    sessions: HashMap<String, ActiveSession>,
    pending: HashMap<String, PendingCleanup>,
    next_seq: u64,
    expiry_tx: mpsc::UnboundedSender<CleanupTicket>,
}

impl SessionRegistry {
    /// Fired cleanup timers report on `expiry_tx`; the owner of the registry
    /// feeds them back through [`SessionRegistry::expire`].
    pub fn new(grace_period: Duration, expiry_tx: mpsc::UnboundedSender<CleanupTicket>) -> Self {
        Self {
            grace_period,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            next_seq: 0,
            expiry_tx,
        }
    }

    pub fn start_session(&mut self, session: ActiveSession) {
        info!(job_key = %session.job_key, owner = ?session.owner, "[sessions] session started");
        self.sessions.insert(session.job_key.clone(), session);
    }

    pub fn end_session(&mut self, job_key: &str) -> Option<ActiveSession> {
        let removed = self.sessions.remove(job_key);
        if removed.is_some() {
            info!(job_key, "[sessions] session ended");
        }
        removed
    }

    /// Update the status of a live session. Returns `false` if there is none.
    pub fn set_status(&mut self, job_key: &str, status: &str) -> bool {
        match self.sessions.get_mut(job_key) {
            Some(session) => {
                session.status = status.to_string();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, job_key: &str) -> Option<&ActiveSession> {
        self.sessions.get(job_key)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut rows: Vec<SessionSummary> = self.sessions.values().map(ActiveSession::summary).collect();
        rows.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.batch_id.cmp(&b.batch_id)));
        rows
    }

    pub fn status(&self, job_key: &str) -> SessionStatus {
        let session = self.sessions.get(job_key).cloned();
        SessionStatus {
            job_key: job_key.to_string(),
            active: session.is_some(),
            session,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// The owner has a live connection again. Returns `true` if a pending
    /// cleanup was cancelled.
    pub fn mark_connected(&mut self, owner: &str) -> bool {
        match self.pending.remove(owner) {
            Some(mut pending) => {
                pending.timer.cancel();
                info!(
                    owner,
                    disconnected_at = %pending.disconnected_at,
                    "[sessions] owner reconnected, cleanup cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// The owner's last connection went away.
    pub fn mark_disconnected(
        &mut self,
        owner: &str,
        reason: DisconnectReason,
        last_connection: Option<SubscriberId>,
    ) -> DisconnectOutcome {
        match reason {
            DisconnectReason::Intentional => {
                if let Some(mut pending) = self.pending.remove(owner) {
                    pending.timer.cancel();
                }
                DisconnectOutcome::CleanedUp(self.cleanup(owner))
            }
            DisconnectReason::Transient => {
                self.next_seq += 1;
                let seq = self.next_seq;
                let expiry_tx = self.expiry_tx.clone();
                let ticket_owner = owner.to_string();
                let timer = TimerHandle::schedule(self.grace_period, seq, move |seq| {
                    let _ = expiry_tx.send(CleanupTicket {
                        owner: ticket_owner,
                        seq,
                    });
                });

                let replaced = self.pending.insert(
                    owner.to_string(),
                    PendingCleanup {
                        timer,
                        disconnected_at: Utc::now(),
                        last_connection,
                    },
                );
                if let Some(mut old) = replaced {
                    old.timer.cancel();
                }
                info!(
                    owner,
                    grace_secs = self.grace_period.as_secs(),
                    "[sessions] owner disconnected, cleanup scheduled"
                );
                DisconnectOutcome::Scheduled { seq }
            }
        }
    }

    /// A cleanup timer fired. Stale tickets (cancelled or superseded timers)
    /// are ignored and return `None`.
    pub fn expire(&mut self, ticket: &CleanupTicket) -> Option<usize> {
        let current = self.pending.get(&ticket.owner)?;
        if current.timer.seq() != ticket.seq {
            debug!(owner = %ticket.owner, seq = ticket.seq, "[sessions] stale cleanup ticket");
            return None;
        }
        let pending = self.pending.remove(&ticket.owner)?;
        info!(
            owner = %ticket.owner,
            last_connection = ?pending.last_connection,
            "[sessions] no reconnection, cleaning up"
        );
        Some(self.cleanup(&ticket.owner))
    }

    pub fn has_pending_cleanup(&self, owner: &str) -> bool {
        self.pending.contains_key(owner)
    }

    /// Forget every session owned by `owner`. Returns how many.
    fn cleanup(&mut self, owner: &str) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.owner.as_deref() != Some(owner));
        let removed = before - self.sessions.len();
        info!(owner, removed, "[sessions] cleanup complete");
        removed
    }
}
