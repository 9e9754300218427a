//! Event router for frames coming back from the worker.
//!
//! Command responses resolve their pending caller through the correlator.
//! Progress events go out to subscribers through an [`EventSink`], after the
//! completion deduplicator has had its say. Nothing in here may fail the
//! read loop: bad frames are logged and dropped.

use super::correlator::Correlator;
use super::dedup::CompletionTracker;
use super::protocol::{Frame, JobStatus, ProgressEvent};
use crate::events::{EventName, JobEventPayload, Room};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Receiver of routed job events (adapter pattern).
///
/// The hub implements this to fan events out to WebSocket subscribers;
/// tests implement it to record what was published.
pub trait EventSink: Send + Sync {
    /// Deliver `payload` as `event` to every member of `room`.
    fn publish(&self, room: Room, event: EventName, payload: Value);

    /// The job reached a terminal state; its active session is over.
    fn end_session(&self, job_key: &str);
}

/// What happened to one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// A pending command was resolved
    Resolved { id: u64 },
    /// A job event was published
    Published { job_key: String, event: EventName },
    /// A duplicate completion was swallowed
    Suppressed { job_key: String },
    /// The frame was unusable and logged
    Dropped,
}

/// Classifies and dispatches inbound frames.
#[derive(Debug, Default)]
pub struct EventRouter {
    tracker: CompletionTracker,
}

impl EventRouter {
    pub fn new(tracker: CompletionTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut CompletionTracker {
        &mut self.tracker
    }

    /// Route one complete line from the worker's stdout.
    pub fn route<E: EventSink + ?Sized>(
        &mut self,
        line: &str,
        correlator: &mut Correlator,
        sink: &E,
        now: Instant,
    ) -> RouteOutcome {
        match Frame::decode(line) {
            Ok(Frame::Response(response)) => {
                let id = response.id;
                let job_key = response.job_key();
                let status = response.job_status();
                let detail = response
                    .is_failure()
                    .then(|| response.failure_message())
                    .or_else(|| response.get("message").and_then(Value::as_str).map(str::to_string));

                match correlator.resolve(response) {
                    Ok(action) => {
                        debug!(id, %action, status = status.as_str(), "[router] command resolved");
                        if let Some(job_key) = job_key {
                            self.after_job_response(&job_key, &status, detail, sink);
                        }
                        RouteOutcome::Resolved { id }
                    }
                    Err(e) => {
                        warn!("[router] dropping response: {}", e);
                        RouteOutcome::Dropped
                    }
                }
            }
            Ok(Frame::Progress(event)) => self.dispatch_progress(event, sink, now),
            Err(e) => {
                warn!("[router] dropping frame: {}", e);
                RouteOutcome::Dropped
            }
        }
    }

    fn dispatch_progress<E: EventSink + ?Sized>(
        &mut self,
        event: ProgressEvent,
        sink: &E,
        now: Instant,
    ) -> RouteOutcome {
        self.tracker.purge_expired(now);
        let job_key = event.job_key.clone();

        match event.status {
            JobStatus::Completed => {
                if !self.tracker.mark_completed(&job_key, now) {
                    debug!(job_key = %job_key, "[router] suppressing duplicate completion");
                    return RouteOutcome::Suppressed { job_key };
                }

                let mut payload = JobEventPayload::from_progress(&event);
                payload.percentage = 100.0;
                if payload.current == 0 {
                    payload.current = payload.total;
                }
                if payload.message.is_none() {
                    payload.message = Some("Processing completed successfully".to_string());
                }

                info!(job_key = %job_key, tabs = event.concurrency, "[router] job completed");
                publish_both(sink, &job_key, EventName::Complete, &payload);
                sink.end_session(&job_key);
                RouteOutcome::Published {
                    job_key,
                    event: EventName::Complete,
                }
            }
            JobStatus::Failed | JobStatus::Error => {
                self.tracker.remove(&job_key);

                let reason = event
                    .error
                    .clone()
                    .or_else(|| event.message.clone())
                    .unwrap_or_else(|| "An error occurred".to_string());
                let mut payload = JobEventPayload::from_progress(&event).with_error(reason);
                payload.status = JobStatus::Failed.as_str().to_string();

                warn!(job_key = %job_key, "[router] job failed");
                publish_both(sink, &job_key, EventName::Error, &payload);
                sink.end_session(&job_key);
                RouteOutcome::Published {
                    job_key,
                    event: EventName::Error,
                }
            }
            JobStatus::Stopped => {
                self.tracker.remove(&job_key);

                let payload = JobEventPayload::from_progress(&event);
                info!(job_key = %job_key, "[router] job stopped");
                publish_both(sink, &job_key, EventName::Stopped, &payload);
                sink.end_session(&job_key);
                RouteOutcome::Published {
                    job_key,
                    event: EventName::Stopped,
                }
            }
            _ => {
                let payload = JobEventPayload::from_progress(&event);
                publish_both(sink, &job_key, EventName::Progress, &payload);
                RouteOutcome::Published {
                    job_key,
                    event: EventName::Progress,
                }
            }
        }
    }

    /// Side effects of a command response that names a job.
    fn after_job_response<E: EventSink + ?Sized>(
        &mut self,
        job_key: &str,
        status: &JobStatus,
        detail: Option<String>,
        sink: &E,
    ) {
        match status {
            JobStatus::Stopped => {
                self.tracker.remove(job_key);
                let payload = JobEventPayload::for_job(job_key, "STOPPED")
                    .with_message(detail.unwrap_or_else(|| "Processing stopped".to_string()));
                sink.publish(
                    Room::Batch(job_key.to_string()),
                    EventName::Stopped,
                    payload.to_value(),
                );
                sink.end_session(job_key);
                info!(job_key, "[router] processing stopped");
            }
            s if s.is_failure() => {
                self.tracker.remove(job_key);
                let payload = JobEventPayload::for_job(job_key, "FAILED")
                    .with_error(detail.unwrap_or_else(|| "Processing failed".to_string()));
                sink.publish(
                    Room::Batch(job_key.to_string()),
                    EventName::Error,
                    payload.to_value(),
                );
                sink.end_session(job_key);
                warn!(job_key, "[router] processing failed");
            }
            JobStatus::Success => {
                self.tracker.remove(job_key);
            }
            _ => {}
        }
    }
}

fn publish_both<E: EventSink + ?Sized>(
    sink: &E,
    job_key: &str,
    event: EventName,
    payload: &JobEventPayload,
) {
    let value = payload.to_value();
    for room in Room::both(job_key) {
        sink.publish(room, event, value.clone());
    }
}
