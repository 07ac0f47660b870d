//! On-the-wire request/response shapes for the simplified MSC3575 sliding sync
//! endpoint, mirroring the field names used by `ruma-client-api`'s
//! `sync::sync_events::{v4, v5}` types (the older positional-list form and the
//! newer name-keyed form respectively) without depending on those crates'
//! `ruma_api!`-macro plumbing, since extensions here are an open-ended plugin
//! payload (`BTreeMap<String, Value>`) rather than a fixed struct.

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};

/// A request body as sent to `{proxy_base}/_matrix/client/unstable/org.matrix.simplified_msc3575/sync`.
///
/// `pos` is not a body field — it travels as a query parameter (see
/// [`crate::transport::Transport`]) — but is carried here for convenience when
/// logging the outbound request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncRequest {
    pub txn_id: String,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, RequestList>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub room_subscriptions: BTreeMap<OwnedRoomId, RoomSubscriptionShape>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unsubscribe_rooms: Vec<OwnedRoomId>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Per-list request delta. Absence of a field on the wire means "unchanged, still
/// sticky"; the builder (§4.2) decides what to include based on the last-sent
/// snapshot, this type is just the shape of one entry once that decision is made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestList {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub ranges: Vec<(u64, u64)>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sort: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filters: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeline_limit: Option<u64>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_state: Vec<(String, String)>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub slow_get_all_rooms: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSubscriptionShape {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeline_limit: Option<u64>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_state: Vec<(String, String)>,
}

/// Raw response body, deserialized duck-typed: presence of `counts` means the
/// older positional-list wire form, presence of `lists` means the newer
/// name-keyed form. See [`crate::applier`] for the translation step.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSyncResponse {
    pub pos: String,

    #[serde(default)]
    pub txn_id: Option<String>,

    #[serde(default)]
    pub lists: Option<BTreeMap<String, ResponseList>>,

    #[serde(default)]
    pub counts: Option<Vec<u64>>,

    #[serde(default)]
    pub ops: Option<Vec<LegacySyncOp>>,

    #[serde(default)]
    pub rooms: BTreeMap<OwnedRoomId, RoomData>,

    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

/// Canonical (post-translation) response, always in the name-keyed shape.
#[derive(Debug, Clone, Default)]
pub struct SyncResponse {
    pub pos: String,
    pub txn_id: Option<String>,
    pub lists: BTreeMap<String, ResponseList>,
    pub rooms: BTreeMap<OwnedRoomId, RoomData>,
    pub extensions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseList {
    pub count: u64,

    #[serde(default)]
    pub ops: Vec<SyncOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlidingOp {
    Sync,
    Insert,
    Delete,
    Update,
    Invalidate,
}

/// One entry of `lists.<name>.ops` in the newer, name-keyed wire form.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncOp {
    pub op: SlidingOp,

    #[serde(default)]
    pub range: Option<(u64, u64)>,

    #[serde(default)]
    pub index: Option<u64>,

    #[serde(default)]
    pub room_ids: Vec<OwnedRoomId>,

    #[serde(default)]
    pub room: Option<OwnedRoomId>,
}

/// One entry of the legacy top-level `ops` array, which additionally carries
/// which list (by index into the request's `lists` array, in send order) the
/// op applies to.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacySyncOp {
    pub op: SlidingOp,
    pub list: usize,

    #[serde(default)]
    pub range: Option<(u64, u64)>,

    #[serde(default)]
    pub index: Option<u64>,

    #[serde(default)]
    pub rooms: Vec<OwnedRoomId>,

    #[serde(default)]
    pub room: Option<OwnedRoomId>,
}

/// Per-room response data. Unknown fields are captured in `extra` rather than
/// dropped, since the enclosing SDK (not this crate) is responsible for parsing
/// timeline/state events; this engine only guarantees defaults are present.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct RoomData {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub required_state: Vec<serde_json::Value>,

    #[serde(default)]
    pub timeline: Vec<serde_json::Value>,

    #[serde(default)]
    pub initial: Option<bool>,

    #[serde(default)]
    pub invite_state: Vec<serde_json::Value>,

    #[serde(default)]
    pub notification_count: Option<u64>,

    #[serde(default)]
    pub highlight_count: Option<u64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Translate a [`RawSyncResponse`] into the canonical name-keyed [`SyncResponse`],
/// given the list-name ordering that was in effect for the request this response
/// answers (needed only for the legacy `counts`/`ops` shape).
pub fn translate(raw: RawSyncResponse, list_order: &[String]) -> SyncResponse {
    let lists = if let Some(lists) = raw.lists {
        lists
    } else {
        translate_legacy(raw.counts.unwrap_or_default(), raw.ops.unwrap_or_default(), list_order)
    };

    SyncResponse {
        pos: raw.pos,
        txn_id: raw.txn_id,
        lists,
        rooms: raw.rooms,
        extensions: raw.extensions,
    }
}

fn translate_legacy(
    counts: Vec<u64>,
    ops: Vec<LegacySyncOp>,
    list_order: &[String],
) -> BTreeMap<String, ResponseList> {
    let mut out: BTreeMap<String, ResponseList> = BTreeMap::new();
    for (idx, count) in counts.into_iter().enumerate() {
        let name = list_order.get(idx).cloned().unwrap_or_else(|| idx.to_string());
        out.entry(name).or_default().count = count;
    }
    for op in ops {
        let name = list_order.get(op.list).cloned().unwrap_or_else(|| op.list.to_string());
        let entry = out.entry(name).or_default();
        entry.ops.push(SyncOp {
            op: op.op,
            range: op.range,
            index: op.index,
            room_ids: op.rooms,
            room: op.room,
        });
    }
    out
}

/// Also exposed for application-facing user-id context, e.g. a `Transport`
/// implementation that needs the current account to fill in `Authorization`.
pub type UserId = OwnedUserId;
