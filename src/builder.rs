//! Request builder (§4.2): diffs current desired state against the last-sent
//! snapshot to produce the next request body, honoring the sticky-parameter
//! rule — a value already acknowledged by the server is never resent unless it
//! changed.

use std::collections::{BTreeMap, HashSet};

use ruma::OwnedRoomId;
use uuid::Uuid;

use crate::extension::ExtensionRegistry;
use crate::list::ListModel;
use crate::subscription::{SubscriptionManager, SubscriptionShape};
use crate::wire::SyncRequest;

/// What the server has already *successfully acknowledged* — i.e. the
/// snapshot as of the last response that actually came back, never the
/// snapshot of the last request merely sent. [`RequestBuilder::build`] reads
/// this without mutating it and hands back a candidate snapshot; the caller
/// is responsible for committing that candidate only once the request it was
/// built for has succeeded (see [`crate::controller`]), so a failed or
/// cancelled send never causes a parameter change to be silently forgotten.
/// Cleared entirely on a session-expiry reset, which is what makes the next
/// `build` resend everything (§7, invariant 3 in spec.md §8).
#[derive(Debug, Default, Clone)]
pub struct LastSent {
    lists: BTreeMap<String, crate::list::ListShape>,
    room_subscriptions: BTreeMap<OwnedRoomId, SubscriptionShape>,
    subscribed: HashSet<OwnedRoomId>,
}

impl LastSent {
    pub fn new() -> Self {
        Self::default()
    }

    /// §7 `SessionExpired`: drop the position token (handled by the caller) and
    /// mark every sticky parameter unsent.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The list-name order in effect for the last request sent, needed to
    /// translate a legacy `counts`/`ops` response (see [`crate::wire::translate`]).
    pub fn list_order(&self) -> Vec<String> {
        self.lists.keys().cloned().collect()
    }
}

pub struct RequestBuilder;

impl RequestBuilder {
    /// Build the next request body against the current `last_sent` snapshot,
    /// without mutating it. Returns the body plus the `LastSent` candidate that
    /// should be committed *if and only if* this request succeeds — committing
    /// unconditionally would let a failed or cancelled send retire a sticky
    /// parameter the server never actually received.
    ///
    /// `initial` should be true for the very first request and for the first
    /// request after a reset; it's forwarded verbatim to every extension's
    /// `on_request`.
    pub fn build(
        lists: &ListModel,
        subscriptions: &SubscriptionManager,
        extensions: &ExtensionRegistry,
        last_sent: &LastSent,
        initial: bool,
    ) -> (SyncRequest, LastSent) {
        let mut candidate = last_sent.clone();
        let mut request = SyncRequest { txn_id: Uuid::new_v4().to_string(), ..Default::default() };

        for (name, shape) in lists.shapes() {
            let unchanged = last_sent.lists.get(name) == Some(shape);
            if !unchanged {
                request.lists.insert(name.to_string(), shape.clone());
                candidate.lists.insert(name.to_string(), shape.clone());
            }
        }

        let current_subscribed = subscriptions.get_room_subscriptions().clone();
        for room_id in &current_subscribed {
            let effective = subscriptions.effective_shape(room_id);
            let unchanged = last_sent.room_subscriptions.get(room_id) == Some(effective);
            if !unchanged {
                request.room_subscriptions.insert(room_id.clone(), effective.clone());
                candidate.room_subscriptions.insert(room_id.clone(), effective.clone());
            }
        }

        let mut unsubscribed: Vec<OwnedRoomId> = last_sent
            .subscribed
            .difference(&current_subscribed)
            .cloned()
            .collect();
        unsubscribed.sort();
        for room_id in &unsubscribed {
            candidate.room_subscriptions.remove(room_id);
        }
        request.unsubscribe_rooms = unsubscribed;
        candidate.subscribed = current_subscribed;

        request.extensions = extensions.build_request_extensions(initial);

        (request, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::ListShape;

    fn room(id: &str) -> OwnedRoomId {
        OwnedRoomId::try_from(id).unwrap()
    }

    #[test]
    fn unchanged_list_is_omitted_after_first_send() {
        let mut lists = ListModel::new();
        lists.set_list("a", ListShape { ranges: vec![(0, 2)], sort: vec!["by_name".into()], ..Default::default() });
        let subs = SubscriptionManager::new();
        let exts = ExtensionRegistry::new();
        let mut last_sent = LastSent::new();

        let (first, candidate) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        assert!(first.lists.contains_key("a"));
        last_sent = candidate; // simulate a successful response

        let (second, _) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, false);
        assert!(!second.lists.contains_key("a"));
    }

    #[test]
    fn range_only_change_resends_full_shape() {
        let mut lists = ListModel::new();
        lists.set_list("a", ListShape { ranges: vec![(0, 2)], sort: vec!["by_name".into()], ..Default::default() });
        let subs = SubscriptionManager::new();
        let exts = ExtensionRegistry::new();
        let mut last_sent = LastSent::new();
        let (_, candidate) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        last_sent = candidate;

        lists.set_list_ranges("a", vec![(0, 2), (3, 5)]).unwrap();
        let (second, _) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, false);
        let sent = second.lists.get("a").unwrap();
        assert_eq!(sent.ranges, vec![(0, 2), (3, 5)]);
        assert_eq!(sent.sort, vec!["by_name".to_string()]);
    }

    #[test]
    fn unsubscribing_a_room_is_reported_once() {
        let lists = ListModel::new();
        let mut subs = SubscriptionManager::new();
        let exts = ExtensionRegistry::new();
        let mut last_sent = LastSent::new();

        subs.modify_room_subscriptions(HashSet::from([room("!foo:bar")]));
        let (_, candidate) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        last_sent = candidate;

        subs.modify_room_subscriptions(HashSet::new());
        let (second, _) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, false);
        assert_eq!(second.unsubscribe_rooms, vec![room("!foo:bar")]);
        assert!(second.room_subscriptions.is_empty());
    }

    #[test]
    fn changing_custom_subscription_resends_without_unsubscribing() {
        let lists = ListModel::new();
        let mut subs = SubscriptionManager::new();
        let exts = ExtensionRegistry::new();
        let mut last_sent = LastSent::new();

        subs.add_custom_subscription("sub1", SubscriptionShape { timeline_limit: Some(1), ..Default::default() });
        subs.add_custom_subscription("sub2", SubscriptionShape { timeline_limit: Some(2), ..Default::default() });
        subs.modify_room_subscriptions(HashSet::from([room("!a:x"), room("!b:x")]));
        subs.use_custom_subscription(room("!b:x"), "sub1");
        let (first, candidate) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        assert_eq!(first.room_subscriptions.get(&room("!a:x")).unwrap(), subs.default_shape());
        assert_eq!(first.room_subscriptions.get(&room("!b:x")).unwrap().timeline_limit, Some(1));
        last_sent = candidate;

        subs.use_custom_subscription(room("!b:x"), "sub2");
        let (second, _) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, false);
        assert_eq!(second.room_subscriptions.get(&room("!b:x")).unwrap().timeline_limit, Some(2));
        assert!(second.unsubscribe_rooms.is_empty());
    }

    #[test]
    fn reset_resends_every_sticky_parameter() {
        let mut lists = ListModel::new();
        lists.set_list("a", ListShape { ranges: vec![(0, 2)], ..Default::default() });
        let mut subs = SubscriptionManager::new();
        subs.modify_room_subscriptions(HashSet::from([room("!x:x")]));
        let exts = ExtensionRegistry::new();
        let mut last_sent = LastSent::new();

        let (_, candidate) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        last_sent = candidate;
        last_sent.reset();
        let (after_reset, _) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        assert!(after_reset.lists.contains_key("a"));
        assert!(after_reset.room_subscriptions.contains_key(&room("!x:x")));
    }

    #[test]
    fn uncommitted_candidate_does_not_suppress_the_next_resend() {
        // A build() call whose candidate is never committed (simulating a failed
        // or cancelled send) must not cause the change to be treated as sticky.
        let mut lists = ListModel::new();
        lists.set_list("a", ListShape { ranges: vec![(0, 2)], ..Default::default() });
        let subs = SubscriptionManager::new();
        let exts = ExtensionRegistry::new();
        let last_sent = LastSent::new();

        let (first, _uncommitted_candidate) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        assert!(first.lists.contains_key("a"));

        // Built again from the same, still-empty last_sent, as the controller
        // would after a failed send — the list must still be considered unsent.
        let (second, _) = RequestBuilder::build(&lists, &subs, &exts, &last_sent, true);
        assert!(second.lists.contains_key("a"));
    }
}
