//! Subscriber hub
//!
//! Fans job events out to WebSocket subscribers grouped in rooms and keeps
//! the active-session registry, including grace-period cleanup when an
//! owner's last connection drops.

mod actor;
mod rooms;
mod sessions;

pub use actor::{Hub, HubCommand, HubConfig, HubHandle};
pub use rooms::{Delivery, DeliverySender, Rooms, SubscriberId};
pub use sessions::{
    ActiveSession, CleanupTicket, DisconnectOutcome, DisconnectReason, SessionRegistry,
    SessionStatus, SessionSummary, DEFAULT_GRACE_PERIOD,
};
