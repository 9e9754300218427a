pub mod error;
pub mod events;
pub mod hub;
pub mod records;
pub mod timer;
pub mod worker;

pub use error::{BusError, HubError, Result};
pub use events::{EventName, JobEventPayload, Room};
pub use hub::{ActiveSession, DisconnectReason, Hub, HubConfig, HubHandle};
pub use records::{merge_extracted, normalize_asset_rows, MemoryRecordStore, RecordError, RecordStore};
pub use timer::TimerHandle;
pub use worker::{Action, CommandResponse, EventSink, Worker, WorkerConfig, WorkerHandle, WorkerStatus};

/// Default port for the subscriber server
pub const DEFAULT_PORT: u16 = 9000;
