//! Worker actor and its handle.
//!
//! One task owns the supervisor, the correlator and the event router. Callers
//! talk to it through a cloneable [`WorkerHandle`], so id allocation, writes
//! and pending-table updates never race each other.

use super::correlator::{Correlator, ResponseReceiver};
use super::dedup::CompletionTracker;
use super::protocol::{Action, CommandResponse};
use super::router::{EventRouter, EventSink};
use super::supervisor::{ProcessSupervisor, SupervisorEvent, WorkerConfig};
use crate::error::{BusError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Requests handled by the worker actor.
#[derive(Debug)]
pub enum WorkerRequest {
    /// Start the process if it is not running
    Start {
        reply: oneshot::Sender<Result<bool>>,
    },
    /// Send a command; the reply carries the receiver for its response
    Send {
        action: Action,
        payload: Map<String, Value>,
        reply: oneshot::Sender<Result<ResponseReceiver>>,
    },
    /// Snapshot of readiness and in-flight commands
    Status {
        reply: oneshot::Sender<WorkerStatus>,
    },
    /// Kill the process; pending commands fail once the exit is observed
    Kill,
    /// Kill the process and stop the actor
    Shutdown,
}

/// Point-in-time view of the worker.
///
/// `running` stays true after a kill until the exit is observed, while
/// `ready` drops as soon as the kill is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub ready: bool,
    pub running: bool,
    pub pending: usize,
    pub pid: Option<u32>,
    pub next_id: u64,
}

/// Owns the worker process and everything keyed on its output.
pub struct Worker {
    supervisor: ProcessSupervisor,
    events_rx: mpsc::UnboundedReceiver<SupervisorEvent>,
    requests_rx: mpsc::Receiver<WorkerRequest>,
    correlator: Correlator,
    router: EventRouter,
    sink: Arc<dyn EventSink>,
}

impl Worker {
    /// Build the actor and a handle to it. Nothing is spawned until
    /// [`Worker::run`] is polled and the first command (or `start`) arrives.
    pub fn new(config: WorkerConfig, sink: Arc<dyn EventSink>) -> (Self, WorkerHandle) {
        let tracker = CompletionTracker::new(config.completion_window);
        let (supervisor, events_rx) = ProcessSupervisor::new(config);
        let (requests_tx, requests_rx) = mpsc::channel(64);

        let worker = Self {
            supervisor,
            events_rx,
            requests_rx,
            correlator: Correlator::new(),
            router: EventRouter::new(tracker),
            sink,
        };
        (worker, WorkerHandle { requests_tx })
    }

    /// Build the actor and run it on the current runtime.
    pub fn spawn(config: WorkerConfig, sink: Arc<dyn EventSink>) -> WorkerHandle {
        let (worker, handle) = Self::new(config, sink);
        tokio::spawn(worker.run());
        handle
    }

    /// Run until every handle is dropped or a shutdown is requested.
    pub async fn run(mut self) {
        let sweep_period = self.router.tracker().window().max(Duration::from_millis(100));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests_rx.recv() => {
                    match request {
                        Some(WorkerRequest::Shutdown) | None => break,
                        Some(request) => self.handle_request(request).await,
                    }
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_supervisor_event(event);
                }

                _ = sweep.tick() => {
                    let purged = self.router.tracker_mut().purge_expired(Instant::now());
                    if purged > 0 {
                        debug!(purged, "[worker] expired completion keys");
                    }
                }
            }
        }

        info!("[worker] shutting down");
        self.supervisor.kill();
        let rejected = self.correlator.reject_all(BusError::Shutdown);
        if rejected > 0 {
            warn!(rejected, "[worker] pending commands dropped at shutdown");
        }
    }

    async fn handle_request(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::Start { reply } => {
                let _ = reply.send(self.supervisor.start());
            }
            WorkerRequest::Send {
                action,
                payload,
                reply,
            } => {
                let _ = reply.send(self.send(action, payload).await);
            }
            WorkerRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            WorkerRequest::Kill => {
                self.supervisor.kill();
            }
            // Handled by the run loop
            WorkerRequest::Shutdown => {}
        }
    }

    async fn send(&mut self, action: Action, payload: Map<String, Value>) -> Result<ResponseReceiver> {
        if let Err(e) = self.supervisor.start() {
            error!(%action, "[worker] could not start process: {}", e);
            return Err(e);
        }
        if !self.supervisor.is_ready() {
            debug!(%action, "[worker] process is shutting down");
            return Err(BusError::NotReady);
        }

        let (command, rx) = self.correlator.register(action, payload);
        let id = command.id;

        let written = match command.to_line() {
            Ok(line) => self.supervisor.write(&line).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => debug!(id, %action, "[worker] command sent"),
            Err(e) => {
                warn!(id, %action, "[worker] write failed: {}", e);
                let reason = match e {
                    BusError::WriteFailed(reason) => reason,
                    other => other.to_string(),
                };
                self.correlator.reject(id, BusError::WriteFailed(reason));
            }
        }
        Ok(rx)
    }

    fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Line(line) => {
                let outcome =
                    self.router
                        .route(&line, &mut self.correlator, self.sink.as_ref(), Instant::now());
                debug!(?outcome, "[worker] frame routed");
            }
            SupervisorEvent::Exited { generation, code } => {
                if !self.supervisor.handle_exit(generation) {
                    debug!(generation, "[worker] ignoring exit of stale process");
                    return;
                }
                let rejected = self
                    .correlator
                    .reject_all(BusError::ProcessTerminated { code });
                self.router.tracker_mut().clear();
                warn!(generation, ?code, rejected, "[worker] process terminated");
            }
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            ready: self.supervisor.is_ready(),
            running: self.supervisor.is_running(),
            pending: self.correlator.pending_count(),
            pid: self.supervisor.pid(),
            next_id: self.correlator.next_id(),
        }
    }
}

/// Cloneable front end of the worker actor.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    requests_tx: mpsc::Sender<WorkerRequest>,
}

impl WorkerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> WorkerRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests_tx
            .send(build(reply))
            .await
            .map_err(|_| BusError::Shutdown)?;
        rx.await.map_err(|_| BusError::Shutdown)
    }

    /// Start the process. Returns `true` if a new process was spawned.
    pub async fn start(&self) -> Result<bool> {
        self.request(|reply| WorkerRequest::Start { reply }).await?
    }

    /// Send a command and wait for its response, with no deadline.
    pub async fn send(&self, action: Action, payload: Map<String, Value>) -> Result<CommandResponse> {
        let rx = self
            .request(|reply| WorkerRequest::Send {
                action,
                payload,
                reply,
            })
            .await??;
        rx.await.map_err(|_| BusError::Shutdown)?
    }

    /// Like [`WorkerHandle::send`], but give up after `deadline`.
    ///
    /// The command stays registered; a late response is dropped by the
    /// correlator when it finds nobody listening.
    pub async fn send_with_deadline(
        &self,
        action: Action,
        payload: Map<String, Value>,
        deadline: Duration,
    ) -> Result<CommandResponse> {
        tokio::time::timeout(deadline, self.send(action, payload))
            .await
            .map_err(|_| BusError::Timeout)?
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        self.request(|reply| WorkerRequest::Status { reply }).await
    }

    /// Kill the process immediately.
    pub async fn kill(&self) -> Result<()> {
        self.requests_tx
            .send(WorkerRequest::Kill)
            .await
            .map_err(|_| BusError::Shutdown)
    }

    /// Ask the worker to close its browser, then kill it. No-op when the
    /// process is not running.
    pub async fn close(&self, deadline: Duration) -> Result<()> {
        if !self.status().await?.ready {
            return Ok(());
        }
        if let Err(e) = self.send_with_deadline(Action::Close, Map::new(), deadline).await {
            warn!("[worker] close command failed: {}", e);
        }
        self.kill().await
    }

    /// Stop the actor. Pending commands are rejected with [`BusError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.requests_tx.send(WorkerRequest::Shutdown).await;
    }
}
