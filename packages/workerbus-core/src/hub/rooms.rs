//! Room membership and fan-out.

use crate::error::HubError;
use crate::events::Room;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

/// Id of one subscriber connection.
pub type SubscriberId = u64;

/// One event on its way to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub name: String,
    pub payload: Value,
}

/// Ordered outbound channel of one subscriber.
pub type DeliverySender = mpsc::UnboundedSender<Delivery>;

struct Subscriber {
    tx: DeliverySender,
    owner: Option<String>,
    rooms: HashSet<Room>,
}

/// Subscribers, their rooms and the reverse index.
#[derive(Default)]
pub struct Rooms {
    subscribers: HashMap<SubscriberId, Subscriber>,
    members: HashMap<Room, HashSet<SubscriberId>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: SubscriberId, tx: DeliverySender) {
        self.subscribers.insert(
            id,
            Subscriber {
                tx,
                owner: None,
                rooms: HashSet::new(),
            },
        );
    }

    /// Remove a subscriber from every room. Returns its owner, if it had one.
    pub fn unregister(&mut self, id: SubscriberId) -> Option<String> {
        let subscriber = self.subscribers.remove(&id)?;
        for room in &subscriber.rooms {
            self.drop_member(room, id);
        }
        subscriber.owner
    }

    /// Attach an owner to a subscriber. Re-identifying with the same owner is
    /// a no-op; a different owner is refused. Returns `true` on first identify.
    pub fn identify(&mut self, id: SubscriberId, owner: &str) -> Result<bool, HubError> {
        let subscriber = self
            .subscribers
            .get_mut(&id)
            .ok_or(HubError::UnknownSubscriber(id))?;
        match &subscriber.owner {
            Some(existing) if existing == owner => Ok(false),
            Some(existing) => Err(HubError::AlreadyIdentified {
                existing: existing.clone(),
            }),
            None => {
                subscriber.owner = Some(owner.to_string());
                Ok(true)
            }
        }
    }

    pub fn owner(&self, id: SubscriberId) -> Option<&str> {
        self.subscribers.get(&id).and_then(|s| s.owner.as_deref())
    }

    /// Returns `true` if the subscriber was not yet a member.
    pub fn join(&mut self, id: SubscriberId, room: Room) -> Result<bool, HubError> {
        let subscriber = self
            .subscribers
            .get_mut(&id)
            .ok_or(HubError::UnknownSubscriber(id))?;
        if !subscriber.rooms.insert(room.clone()) {
            return Ok(false);
        }
        self.members.entry(room).or_default().insert(id);
        Ok(true)
    }

    /// Returns `true` if the subscriber was a member.
    pub fn leave(&mut self, id: SubscriberId, room: &Room) -> Result<bool, HubError> {
        let subscriber = self
            .subscribers
            .get_mut(&id)
            .ok_or(HubError::UnknownSubscriber(id))?;
        if !subscriber.rooms.remove(room) {
            return Ok(false);
        }
        self.drop_member(room, id);
        Ok(true)
    }

    /// Deliver to every current member. Returns how many received it.
    pub fn publish(&self, room: &Room, name: &str, payload: &Value) -> usize {
        let Some(members) = self.members.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| self.send_to(**id, name, payload.clone()))
            .count()
    }

    /// Deliver to one subscriber. Returns `false` if it is gone.
    pub fn send_to(&self, id: SubscriberId, name: &str, payload: Value) -> bool {
        match self.subscribers.get(&id) {
            Some(subscriber) => subscriber
                .tx
                .send(Delivery {
                    name: name.to_string(),
                    payload,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn member_count(&self, room: &Room) -> usize {
        self.members.get(room).map_or(0, |m| m.len())
    }

    pub fn is_member(&self, id: SubscriberId, room: &Room) -> bool {
        self.subscribers
            .get(&id)
            .is_some_and(|s| s.rooms.contains(room))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn drop_member(&mut self, room: &Room, id: SubscriberId) {
        if let Some(members) = self.members.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.members.remove(room);
            }
        }
    }
}
