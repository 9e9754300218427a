//! Request/response correlation for worker commands.
//!
//! Every outbound command gets the next integer id and a one-shot handle.
//! The handle is removed from the map at the moment it is fulfilled, so each
//! caller sees exactly one outcome.

use super::protocol::{Action, Command, CommandResponse};
use crate::error::{BusError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Receives the eventual outcome of one command.
pub type ResponseReceiver = oneshot::Receiver<Result<CommandResponse>>;

struct PendingRequest {
    action: Action,
    reply: oneshot::Sender<Result<CommandResponse>>,
}

/// Tracks in-flight commands by correlation id.
pub struct Correlator {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate an id and register a pending request for it.
    pub fn register(
        &mut self,
        action: Action,
        payload: Map<String, Value>,
    ) -> (Command, ResponseReceiver) {
        let id = self.next_id;
        self.next_id += 1;

        let (reply, rx) = oneshot::channel();
        self.pending.insert(id, PendingRequest { action, reply });
        (Command::new(id, action, payload), rx)
    }

    /// Deliver a response to its caller.
    ///
    /// A response reporting `FAILED`/`ERROR` rejects the caller with
    /// [`BusError::ActionFailed`]. Unknown ids are returned as
    /// [`BusError::UnknownCorrelation`] for the router to log.
    pub fn resolve(&mut self, response: CommandResponse) -> Result<Action> {
        let pending = self
            .pending
            .remove(&response.id)
            .ok_or(BusError::UnknownCorrelation(response.id))?;

        let outcome = if response.is_failure() {
            Err(BusError::ActionFailed {
                action: pending.action.to_string(),
                message: response.failure_message(),
                job_key: response.job_key(),
            })
        } else {
            Ok(response)
        };
        // The caller may have given up waiting; that is not an error here.
        let _ = pending.reply.send(outcome);
        Ok(pending.action)
    }

    /// Reject one pending request, e.g. after its write failed.
    pub fn reject(&mut self, id: u64, error: BusError) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                let _ = pending.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request with the same error. Returns how many.
    pub fn reject_all(&mut self, error: BusError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    /// Id the next command will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64, status: &str) -> CommandResponse {
        CommandResponse {
            id,
            status: status.to_string(),
            fields: Map::new(),
        }
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let mut correlator = Correlator::new();
        let (a, _ra) = correlator.register(Action::Ping, Map::new());
        let (b, _rb) = correlator.register(Action::Ping, Map::new());
        let (c, _rc) = correlator.register(Action::Close, Map::new());
        assert_eq!((a.id, b.id, c.id), (1, 2, 3));
        assert_eq!(correlator.pending_count(), 3);
    }

    #[test]
    fn test_resolve_out_of_order() {
        let mut correlator = Correlator::new();
        let (first, mut rx1) = correlator.register(Action::Ping, Map::new());
        let (second, mut rx2) = correlator.register(Action::GetCompanies, Map::new());

        assert_eq!(correlator.resolve(response(second.id, "SUCCESS")), Ok(Action::GetCompanies));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().unwrap().id, second.id);

        correlator.resolve(response(first.id, "SUCCESS")).unwrap();
        assert_eq!(rx1.try_recv().unwrap().unwrap().status, "SUCCESS");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_resolve_fires_once() {
        let mut correlator = Correlator::new();
        let (cmd, _rx) = correlator.register(Action::Ping, Map::new());
        assert!(correlator.resolve(response(cmd.id, "SUCCESS")).is_ok());
        assert_eq!(
            correlator.resolve(response(cmd.id, "SUCCESS")),
            Err(BusError::UnknownCorrelation(cmd.id))
        );
    }

    #[test]
    fn test_failed_status_rejects_caller() {
        let mut correlator = Correlator::new();
        let (cmd, mut rx) = correlator.register(Action::Login, Map::new());
        let mut resp = response(cmd.id, "FAILED");
        resp.fields
            .insert("error".to_string(), Value::String("bad otp".to_string()));
        correlator.resolve(resp).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BusError::ActionFailed {
                action: "login".to_string(),
                message: "bad otp".to_string(),
                job_key: None,
            })
        );
    }

    #[test]
    fn test_failed_job_response_names_job() {
        let mut correlator = Correlator::new();
        let (cmd, mut rx) = correlator.register(Action::ProcessBatch, Map::new());
        let mut resp = response(cmd.id, "FAILED");
        resp.fields
            .insert("reportId".to_string(), Value::String("B1".to_string()));
        correlator.resolve(resp).unwrap();

        match rx.try_recv().unwrap() {
            Err(BusError::ActionFailed { job_key, .. }) => assert_eq!(job_key.as_deref(), Some("B1")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_reject_all_empties_pending() {
        let mut correlator = Correlator::new();
        let mut receivers: Vec<_> = (0..3)
            .map(|_| correlator.register(Action::Ping, Map::new()).1)
            .collect();

        let err = BusError::ProcessTerminated { code: Some(1) };
        assert_eq!(correlator.reject_all(err.clone()), 3);
        assert_eq!(correlator.pending_count(), 0);
        for rx in receivers.iter_mut() {
            assert_eq!(rx.try_recv().unwrap(), Err(err.clone()));
        }
    }

    #[test]
    fn test_reject_single() {
        let mut correlator = Correlator::new();
        let (cmd, mut rx) = correlator.register(Action::Ping, Map::new());
        assert!(correlator.reject(cmd.id, BusError::WriteFailed("broken pipe".to_string())));
        assert!(!correlator.reject(cmd.id, BusError::NotReady));
        assert!(matches!(rx.try_recv().unwrap(), Err(BusError::WriteFailed(_))));
    }

    #[test]
    fn test_ids_not_reused_after_reject_all() {
        let mut correlator = Correlator::new();
        let (a, _ra) = correlator.register(Action::Ping, Map::new());
        correlator.reject_all(BusError::ProcessTerminated { code: None });
        let (b, _rb) = correlator.register(Action::Ping, Map::new());
        assert!(b.id > a.id);
    }
}
