//! Worker process integration
//!
//! Drives one long-lived worker over newline-delimited JSON on its stdio.
//! Commands carry a correlation id; lines without one are job progress
//! events, fanned out through an [`EventSink`].
//!
//! ## Key components:
//! - `framer` - Split stdout bytes into complete lines
//! - `protocol` - Wire types and frame classification
//! - `supervisor` - Spawn, write to and kill the process
//! - `correlator` - Pending commands keyed by id
//! - `dedup` - Suppress repeated completions
//! - `router` - Dispatch inbound frames
//! - `actor` - Task owning all of the above, with a cloneable handle
//! - `operations` - Typed commands on the handle

mod actor;
mod correlator;
mod dedup;
mod framer;
mod operations;
pub mod protocol;
mod router;
mod supervisor;

pub use actor::{Worker, WorkerHandle, WorkerRequest, WorkerStatus};
pub use correlator::{Correlator, ResponseReceiver};
pub use dedup::{CompletionTracker, DEFAULT_COMPLETION_WINDOW};
pub use framer::LineFramer;
pub use operations::{clamp_tabs, DEFAULT_TABS, MAX_TABS};
pub use protocol::{Action, Command, CommandResponse, Frame, JobStatus, ProgressEvent, JOB_KEY_FIELD};
pub use router::{EventRouter, EventSink, RouteOutcome};
pub use supervisor::{ProcessSupervisor, ReadyState, SupervisorEvent, WorkerConfig};
