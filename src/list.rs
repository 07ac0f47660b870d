//! List model (§4.4): owns `ListShape` + `ListState` keyed by name and applies the
//! ordered `SYNC`/`INSERT`/`DELETE`/`UPDATE`/`INVALIDATE` ops a response carries for
//! each list.

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::wire::{RequestList, ResponseList, SlidingOp, SyncOp};

/// The desired shape of a list, as last told to the builder. Doubles as the wire
/// `RequestList` shape (§6) since they carry the same fields.
pub type ListShape = RequestList;

/// Sparse index → room-id mapping plus the last-known joined count for one list.
#[derive(Debug, Clone, Default)]
pub struct ListState {
    pub joined_count: u64,
    rooms: BTreeMap<u64, OwnedRoomId>,
}

impl ListState {
    pub fn room_at(&self, index: u64) -> Option<&OwnedRoomId> {
        self.rooms.get(&index)
    }

    /// A snapshot of the sparse index→room-id map, for `ListUpdate` events.
    pub fn snapshot(&self) -> BTreeMap<u64, OwnedRoomId> {
        self.rooms.clone()
    }

    fn sync_range(&mut self, range: (u64, u64), room_ids: &[OwnedRoomId]) {
        let (lo, _hi) = range;
        for (offset, room_id) in room_ids.iter().enumerate() {
            self.rooms.insert(lo + offset as u64, room_id.clone());
        }
    }

    fn insert_at(&mut self, index: u64, room_id: OwnedRoomId) {
        let shifted: Vec<(u64, OwnedRoomId)> = self
            .rooms
            .range(index..)
            .rev()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (k, v) in shifted {
            self.rooms.insert(k + 1, v);
        }
        self.rooms.insert(index, room_id);
    }

    fn delete_at(&mut self, index: u64) {
        self.rooms.remove(&index);
        let shifted: Vec<(u64, OwnedRoomId)> = self
            .rooms
            .range((index + 1)..)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (k, v) in shifted {
            self.rooms.remove(&k);
            self.rooms.insert(k - 1, v);
        }
    }

    fn update_at(&mut self, index: u64, room_id: OwnedRoomId) {
        self.rooms.insert(index, room_id);
    }

    fn invalidate_range(&mut self, range: (u64, u64)) {
        let (lo, hi) = range;
        for idx in lo..=hi {
            self.rooms.remove(&idx);
        }
    }
}

/// Owns every named list's desired shape and last-known server-reported state.
#[derive(Debug, Default)]
pub struct ListModel {
    lists: BTreeMap<String, (ListShape, ListState)>,
}

impl ListModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define or replace a list's desired shape. Used both by the application
    /// (`setList`) and at construction time to seed `Config`'s initial lists.
    pub fn set_list(&mut self, name: impl Into<String>, shape: ListShape) {
        let name = name.into();
        validate_ranges(&shape.ranges);
        match self.lists.get_mut(&name) {
            Some((existing, _)) => *existing = shape,
            None => {
                debug!(list = %name, "defining new list");
                self.lists.insert(name, (shape, ListState::default()));
            }
        }
    }

    /// §4.4: fails with `UnknownList` if `name` was never defined.
    pub fn set_list_ranges(&mut self, name: &str, ranges: Vec<(u64, u64)>) -> Result<()> {
        validate_ranges(&ranges);
        match self.lists.get_mut(name) {
            Some((shape, _)) => {
                shape.ranges = ranges;
                Ok(())
            }
            None => Err(Error::UnknownList(name.to_string())),
        }
    }

    pub fn get_list_params(&self, name: &str) -> Option<&ListShape> {
        self.lists.get(name).map(|(shape, _)| shape)
    }

    pub fn get_list_data(&self, name: &str) -> Option<&ListState> {
        self.lists.get(name).map(|(_, state)| state)
    }

    pub fn list_length(&self, name: &str) -> Option<u64> {
        self.get_list_data(name).map(|s| s.joined_count)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lists.keys().map(String::as_str)
    }

    pub fn shapes(&self) -> impl Iterator<Item = (&str, &ListShape)> {
        self.lists.iter().map(|(name, (shape, _))| (name.as_str(), shape))
    }

    /// Apply one list's response ops, in array order, returning a snapshot of the
    /// resulting state for the `ListUpdate` event. Unknown list names (the server
    /// describing a list the application never asked about — shouldn't happen,
    /// but responses are untrusted input) are adopted rather than rejected.
    pub fn apply_response(&mut self, name: &str, response: &ResponseList) -> ListState {
        let (_, state) = self
            .lists
            .entry(name.to_string())
            .or_insert_with(|| (ListShape::default(), ListState::default()));

        state.joined_count = response.count;
        for op in &response.ops {
            apply_op(state, op, name);
        }
        state.clone()
    }
}

fn apply_op(state: &mut ListState, op: &SyncOp, list_name: &str) {
    match op.op {
        SlidingOp::Sync => {
            if let Some(range) = op.range {
                trace!(list = %list_name, ?range, "SYNC");
                state.sync_range(range, &op.room_ids);
            }
        }
        SlidingOp::Insert => {
            if let (Some(index), Some(room)) = (op.index, op.room.clone()) {
                trace!(list = %list_name, index, "INSERT");
                state.insert_at(index, room);
            }
        }
        SlidingOp::Delete => {
            if let Some(index) = op.index {
                trace!(list = %list_name, index, "DELETE");
                state.delete_at(index);
            }
        }
        SlidingOp::Update => {
            if let (Some(index), Some(room)) = (op.index, op.room.clone()) {
                trace!(list = %list_name, index, "UPDATE");
                state.update_at(index, room);
            }
        }
        SlidingOp::Invalidate => {
            if let Some(range) = op.range {
                trace!(list = %list_name, ?range, "INVALIDATE");
                state.invalidate_range(range);
            } else {
                warn!(list = %list_name, "INVALIDATE without a range, ignoring");
            }
        }
    }
}

fn validate_ranges(ranges: &[(u64, u64)]) {
    for &(lo, hi) in ranges {
        debug_assert!(lo <= hi, "list range {lo}..={hi} has lo > hi");
    }
}
