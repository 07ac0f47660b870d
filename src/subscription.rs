//! Subscription manager (§4.5): per-room subscription set, per-room custom
//! subscription assignment, the named custom-subscription table, and the
//! default subscription shape.

use std::collections::{BTreeMap, HashSet};

use ruma::OwnedRoomId;
use tracing::warn;

use crate::wire::RoomSubscriptionShape;

pub type SubscriptionShape = RoomSubscriptionShape;

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscribed: HashSet<OwnedRoomId>,
    default_shape: SubscriptionShape,
    custom_table: BTreeMap<String, SubscriptionShape>,
    assignments: BTreeMap<OwnedRoomId, String>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modify_room_subscriptions(&mut self, rooms: HashSet<OwnedRoomId>) {
        self.subscribed = rooms;
    }

    pub fn get_room_subscriptions(&self) -> &HashSet<OwnedRoomId> {
        &self.subscribed
    }

    pub fn modify_room_subscription_info(&mut self, shape: SubscriptionShape) {
        self.default_shape = shape;
    }

    pub fn default_shape(&self) -> &SubscriptionShape {
        &self.default_shape
    }

    /// §4.5: re-adding an existing name is a no-op, the stored shape is never
    /// overwritten. Logged, not an error — the contract (and the source this was
    /// distilled from) treats this as a recoverable client-side mistake.
    pub fn add_custom_subscription(&mut self, name: impl Into<String>, shape: SubscriptionShape) {
        let name = name.into();
        if self.custom_table.contains_key(&name) {
            warn!(subscription = %name, "custom subscription already registered, ignoring new shape");
            return;
        }
        self.custom_table.insert(name, shape);
    }

    /// §4.5: an unregistered `name` falls back to the default shape at resolution
    /// time ([`Self::effective_shape`]); the assignment itself is still recorded so
    /// a later `add_custom_subscription` for that name takes effect without the
    /// caller needing to re-assign.
    pub fn use_custom_subscription(&mut self, room_id: OwnedRoomId, name: impl Into<String>) {
        self.assignments.insert(room_id, name.into());
    }

    pub fn assigned_name(&self, room_id: &OwnedRoomId) -> Option<&str> {
        self.assignments.get(room_id).map(String::as_str)
    }

    pub fn custom_shape(&self, name: &str) -> Option<&SubscriptionShape> {
        self.custom_table.get(name)
    }

    /// The shape that would actually be sent for `room_id` right now.
    pub fn effective_shape(&self, room_id: &OwnedRoomId) -> &SubscriptionShape {
        self.assignments
            .get(room_id)
            .and_then(|name| self.custom_table.get(name))
            .unwrap_or(&self.default_shape)
    }
}
