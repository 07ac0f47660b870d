//! Response applier (§4.3): interprets a response body, fans out per-room data
//! events in order, updates list models, and routes extension payloads to their
//! registered consumer.

use tracing::{debug, instrument};

use crate::events::{EventSinks, Lifecycle, ListUpdateEvent, RoomDataEvent};
use crate::extension::{ExtensionRegistry, Phase};
use crate::list::ListModel;
use crate::wire::SyncResponse;

pub struct ResponseApplier;

impl ResponseApplier {
    /// Runs steps 2–6 of §4.3: pre-extensions, per-room `RoomData`, per-list
    /// `ListUpdate`, post-extensions, then `Lifecycle(Complete)`. Step 1 (storing
    /// `response.pos` into `ConnectionState`) is the caller's job since that
    /// state lives in the controller, not here.
    #[instrument(level = "debug", skip_all)]
    pub async fn apply(
        response: &SyncResponse,
        lists: &mut ListModel,
        extensions: &ExtensionRegistry,
        sinks: &EventSinks,
    ) {
        for ext in extensions.phase(Phase::Pre) {
            ext.on_response(response.extensions.get(ext.name())).await;
        }

        for (room_id, data) in &response.rooms {
            debug!(room = %room_id, "emitting RoomData");
            let _ = sinks.room_data.send(RoomDataEvent { room_id: room_id.clone(), data: data.clone() });
        }

        for (name, list_response) in &response.lists {
            let state = lists.apply_response(name, list_response);
            let _ = sinks.list_update.send(ListUpdateEvent {
                list_name: name.clone(),
                joined_count: state.joined_count,
                rooms: state.snapshot(),
            });
        }

        for ext in extensions.phase(Phase::Post) {
            ext.on_response(response.extensions.get(ext.name())).await;
        }

        let _ = sinks.lifecycle.send(Lifecycle::Complete);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::Extension;
    use crate::wire::{RoomData, ResponseList, SlidingOp, SyncOp};
    use async_trait::async_trait;
    use ruma::OwnedRoomId;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    struct Recording {
        name: &'static str,
        phase: Phase,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Extension for Recording {
        fn name(&self) -> &str {
            self.name
        }
        fn when(&self) -> Phase {
            self.phase
        }
        fn on_request(&self, _initial: bool) -> Option<serde_json::Value> {
            None
        }
        async fn on_response(&self, _data: Option<&serde_json::Value>) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    fn room(id: &str) -> OwnedRoomId {
        OwnedRoomId::try_from(id).unwrap()
    }

    #[tokio::test]
    async fn pre_extension_runs_before_room_data_and_post_runs_before_complete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ExtensionRegistry::new();
        registry
            .register(Box::new(Recording { name: "e1", phase: Phase::Pre, log: log.clone() }))
            .unwrap();
        registry
            .register(Box::new(Recording { name: "e2", phase: Phase::Post, log: log.clone() }))
            .unwrap();

        let mut lists = ListModel::new();
        let sinks = EventSinks::new(16);
        let mut lifecycle_rx = sinks.subscribe_lifecycle();
        let mut room_rx = sinks.subscribe_room_data();

        let mut rooms = BTreeMap::new();
        rooms.insert(room("!a:x"), RoomData { name: Some("foo".into()), ..Default::default() });
        let response = SyncResponse { pos: "a".into(), rooms, ..Default::default() };

        ResponseApplier::apply(&response, &mut lists, &registry, &sinks).await;

        log.lock().unwrap().push("room_data_observed");
        assert_eq!(room_rx.try_recv().unwrap().room_id, room("!a:x"));
        assert!(matches!(lifecycle_rx.try_recv().unwrap(), Lifecycle::Complete));

        let log = log.lock().unwrap();
        assert_eq!(log.as_slice(), ["e1", "room_data_observed", "e2"]);
    }

    #[tokio::test]
    async fn missing_room_fields_default_to_empty_containers() {
        let registry = ExtensionRegistry::new();
        let mut lists = ListModel::new();
        let sinks = EventSinks::new(16);
        let mut room_rx = sinks.subscribe_room_data();

        let mut rooms = BTreeMap::new();
        rooms.insert(room("!a:x"), serde_json::from_value(serde_json::json!({})).unwrap());
        let response = SyncResponse { pos: "a".into(), rooms, ..Default::default() };

        ResponseApplier::apply(&response, &mut lists, &registry, &sinks).await;
        let event = room_rx.try_recv().unwrap();
        assert!(event.data.required_state.is_empty());
        assert!(event.data.timeline.is_empty());
    }

    #[tokio::test]
    async fn list_update_reflects_cumulative_ops() {
        let registry = ExtensionRegistry::new();
        let mut lists = ListModel::new();
        lists.set_list("a", crate::list::ListShape { ranges: vec![(0, 2)], ..Default::default() });
        let sinks = EventSinks::new(16);
        let mut list_rx = sinks.subscribe_list_update();

        let mut list_responses = BTreeMap::new();
        list_responses.insert(
            "a".to_string(),
            ResponseList {
                count: 500,
                ops: vec![SyncOp {
                    op: SlidingOp::Sync,
                    range: Some((0, 2)),
                    index: None,
                    room_ids: vec![room("!a:x"), room("!b:x"), room("!c:x")],
                    room: None,
                }],
            },
        );
        let response = SyncResponse { pos: "a".into(), lists: list_responses, ..Default::default() };
        ResponseApplier::apply(&response, &mut lists, &registry, &sinks).await;

        let event = list_rx.try_recv().unwrap();
        assert_eq!(event.joined_count, 500);
        assert_eq!(event.rooms.get(&1), Some(&room("!b:x")));
    }
}
