//! Error taxonomy for the worker bus.

use thiserror::Error;

/// Errors surfaced to callers of the worker bus.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// A write was attempted while no worker process is live.
    #[error("worker process is not ready")]
    NotReady,

    /// The worker process could not be spawned.
    #[error("failed to start worker process: {0}")]
    StartFailed(String),

    /// The worker exited while the request was outstanding.
    #[error("worker process terminated (exit code {})", display_code(.code))]
    ProcessTerminated { code: Option<i32> },

    /// The worker's stdin rejected the command line.
    #[error("failed to send command to worker: {0}")]
    WriteFailed(String),

    /// An inbound line could not be decoded. Logged and dropped, never returned to a caller.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A response arrived for an id with no pending request. Logged and dropped.
    #[error("no pending command for id {0}")]
    UnknownCorrelation(u64),

    /// The worker reported a failure status for this command. `job_key` is
    /// set when the response named a job, in which case the failure was also
    /// published to that job's batch room.
    #[error("{action} failed: {message}")]
    ActionFailed {
        action: String,
        message: String,
        job_key: Option<String>,
    },

    /// Arguments were rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A caller-side deadline elapsed before the worker answered.
    #[error("timed out waiting for worker response")]
    Timeout,

    /// The owning actor has shut down.
    #[error("worker bus has shut down")]
    Shutdown,
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "none".to_string(),
    }
}

/// Errors from subscriber bookkeeping in the hub.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection {0} is not registered")]
    UnknownSubscriber(u64),

    /// Identification happens once per connection.
    #[error("connection already identified as {existing}")]
    AlreadyIdentified { existing: String },

    #[error("hub has shut down")]
    Shutdown,
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_terminated_message() {
        let err = BusError::ProcessTerminated { code: Some(137) };
        assert_eq!(err.to_string(), "worker process terminated (exit code 137)");

        let err = BusError::ProcessTerminated { code: None };
        assert_eq!(err.to_string(), "worker process terminated (exit code none)");
    }

    #[test]
    fn test_action_failed_message() {
        let err = BusError::ActionFailed {
            action: "login".to_string(),
            message: "bad password".to_string(),
            job_key: None,
        };
        assert_eq!(err.to_string(), "login failed: bad password");
    }
}
