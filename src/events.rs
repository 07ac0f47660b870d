//! The three strongly-typed event families the engine publishes to the
//! application (§6 "Emitted events", §9 design note on re-architecting the
//! source's general event emitter into named broadcast channels).

use std::collections::BTreeMap;
use std::sync::Arc;

use ruma::OwnedRoomId;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::wire::{RoomData, SyncResponse};

/// Lifecycle phases of one request/response cycle.
#[derive(Debug, Clone)]
pub enum Lifecycle {
    /// The HTTP response has been received (successfully or not); fired before
    /// the body has been applied to any list/room state. `body` is the
    /// canonical (already-translated) response when a response was actually
    /// received; `None` alongside a failure means no body was parseable.
    RequestFinished { body: Option<Arc<SyncResponse>>, error: Option<Arc<Error>> },
    /// The response (if any) has been fully applied, including post-extensions.
    Complete,
}

#[derive(Debug, Clone)]
pub struct RoomDataEvent {
    pub room_id: OwnedRoomId,
    pub data: RoomData,
}

#[derive(Debug, Clone)]
pub struct ListUpdateEvent {
    pub list_name: String,
    pub joined_count: u64,
    pub rooms: BTreeMap<u64, OwnedRoomId>,
}

/// The three broadcast channels a `SyncLoop` publishes on. Sized generously
/// since application-side subscribers are expected to drain promptly; a lagged
/// receiver simply misses the oldest buffered events (the teacher's
/// `change_broadcasters` pattern in `service/sync/sliding_sync.rs` makes the
/// same tradeoff).
pub struct EventSinks {
    pub lifecycle: broadcast::Sender<Lifecycle>,
    pub room_data: broadcast::Sender<RoomDataEvent>,
    pub list_update: broadcast::Sender<ListUpdateEvent>,
}

impl EventSinks {
    pub fn new(capacity: usize) -> Self {
        Self {
            lifecycle: broadcast::channel(capacity).0,
            room_data: broadcast::channel(capacity).0,
            list_update: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn subscribe_room_data(&self) -> broadcast::Receiver<RoomDataEvent> {
        self.room_data.subscribe()
    }

    pub fn subscribe_list_update(&self) -> broadcast::Receiver<ListUpdateEvent> {
        self.list_update.subscribe()
    }
}

impl Default for EventSinks {
    fn default() -> Self {
        Self::new(256)
    }
}
