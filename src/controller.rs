//! Sync loop controller (§4.1): the heart of the engine. Sequences
//! request/response cycles, interleaves application-driven mutations with an
//! in-flight request, handles session-expiry recovery, and owns start/stop
//! lifecycle plus lifecycle-event emission.
//!
//! `Pending` (§3) isn't modelled as a separate buffer: every mutation method
//! writes straight into the shared [`ListModel`]/[`SubscriptionManager`]/
//! [`ExtensionRegistry`], which the builder reads fresh on every cycle. A
//! mutation that lands while a request is in flight is therefore picked up
//! automatically by the next `build`, with no extra merge step needed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use ruma::OwnedRoomId;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::builder::{LastSent, RequestBuilder};
use crate::error::Error;
use crate::events::{EventSinks, Lifecycle};
use crate::extension::{Extension, ExtensionRegistry};
use crate::list::{ListModel, ListShape, ListState};
use crate::subscription::{SubscriptionManager, SubscriptionShape};
use crate::transport::{CancelToken, Transport};
use crate::wire::translate;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Stopped,
}

/// Opaque server-issued position, and whether the next request is the first
/// one ever (or the first since a reset) — see `ConnectionState` in spec §3.
#[derive(Debug, Default, Clone)]
struct ConnectionState {
    pos: Option<String>,
    initial: bool,
}

impl ConnectionState {
    fn new() -> Self {
        Self { pos: None, initial: true }
    }

    fn reset(&mut self) {
        self.pos = None;
        self.initial = true;
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    lists: Mutex<ListModel>,
    subscriptions: Mutex<SubscriptionManager>,
    extensions: Mutex<ExtensionRegistry>,
    connection: Mutex<ConnectionState>,
    last_sent: Mutex<LastSent>,
    sinks: EventSinks,
    run_state: StdMutex<RunState>,
    dirty: Notify,
    stop_signal: Notify,
    inflight_cancel: StdMutex<Option<CancelToken>>,
    consecutive_failures: AtomicU32,
}

/// The client-side Sliding Sync engine. Construct via [`SlidingSync::new`],
/// seed lists/subscriptions/extensions, then [`SlidingSync::start`].
pub struct SlidingSync {
    shared: Arc<Shared>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl SlidingSync {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_timeout(transport, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            transport,
            timeout,
            lists: Mutex::new(ListModel::new()),
            subscriptions: Mutex::new(SubscriptionManager::new()),
            extensions: Mutex::new(ExtensionRegistry::new()),
            connection: Mutex::new(ConnectionState::new()),
            last_sent: Mutex::new(LastSent::new()),
            sinks: EventSinks::default(),
            run_state: StdMutex::new(RunState::Idle),
            dirty: Notify::new(),
            stop_signal: Notify::new(),
            inflight_cancel: StdMutex::new(None),
            consecutive_failures: AtomicU32::new(0),
        });
        Self { shared, task: StdMutex::new(None) }
    }

    pub fn subscribe_lifecycle(&self) -> tokio::sync::broadcast::Receiver<Lifecycle> {
        self.shared.sinks.subscribe_lifecycle()
    }

    pub fn subscribe_room_data(&self) -> tokio::sync::broadcast::Receiver<crate::events::RoomDataEvent> {
        self.shared.sinks.subscribe_room_data()
    }

    pub fn subscribe_list_update(&self) -> tokio::sync::broadcast::Receiver<crate::events::ListUpdateEvent> {
        self.shared.sinks.subscribe_list_update()
    }

    // ---- mutation methods (§4.1) ----

    pub async fn set_list(&self, name: impl Into<String>, shape: ListShape) {
        self.shared.lists.lock().await.set_list(name, shape);
        self.mark_dirty();
    }

    pub async fn set_list_ranges(&self, name: &str, ranges: Vec<(u64, u64)>) -> crate::error::Result<()> {
        self.shared.lists.lock().await.set_list_ranges(name, ranges)?;
        self.mark_dirty();
        Ok(())
    }

    pub async fn modify_room_subscriptions(&self, rooms: HashSet<OwnedRoomId>) {
        self.shared.subscriptions.lock().await.modify_room_subscriptions(rooms);
        self.mark_dirty();
    }

    pub async fn modify_room_subscription_info(&self, shape: SubscriptionShape) {
        self.shared.subscriptions.lock().await.modify_room_subscription_info(shape);
        self.mark_dirty();
    }

    pub async fn add_custom_subscription(&self, name: impl Into<String>, shape: SubscriptionShape) {
        self.shared.subscriptions.lock().await.add_custom_subscription(name, shape);
        self.mark_dirty();
    }

    pub async fn use_custom_subscription(&self, room_id: OwnedRoomId, name: impl Into<String>) {
        self.shared.subscriptions.lock().await.use_custom_subscription(room_id, name);
        self.mark_dirty();
    }

    pub async fn register_extension(&self, extension: Box<dyn Extension>) -> crate::error::Result<()> {
        self.shared.extensions.lock().await.register(extension)?;
        self.mark_dirty();
        Ok(())
    }

    // ---- read-only queries (§4.4) ----

    pub async fn get_list_params(&self, name: &str) -> Option<ListShape> {
        self.shared.lists.lock().await.get_list_params(name).cloned()
    }

    pub async fn get_list_data(&self, name: &str) -> Option<ListState> {
        self.shared.lists.lock().await.get_list_data(name).cloned()
    }

    pub async fn list_length(&self, name: &str) -> Option<u64> {
        self.shared.lists.lock().await.list_length(name)
    }

    /// Wakes the loop if it's quiescent (waiting in the `dirty.notified()` arm
    /// of the `select!` in `ControllerLoop::run`). Uses `notify_one`, which
    /// latches a permit even when called before anyone is waiting — with
    /// `notify_waiters` a mutation landing in the gap between `build_request`
    /// releasing its locks and the loop re-registering its waiter would be
    /// lost, stalling the loop until some unrelated later mutation.
    fn mark_dirty(&self) {
        self.shared.dirty.notify_one();
    }

    // ---- lifecycle ----

    pub fn start(self: &Arc<Self>) {
        let mut state = self.shared.run_state.lock().unwrap();
        if *state == RunState::Running {
            return;
        }
        *state = RunState::Running;
        drop(state);

        let this = self.clone_handle();
        let handle = tokio::spawn(async move { this.run().await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// §5/§7: cancel any in-flight request and stop the loop. Does not clear
    /// `ConnectionState` — a later `start()` can resume from the same `pos`.
    pub async fn stop(&self) {
        {
            let mut state = self.shared.run_state.lock().unwrap();
            if *state != RunState::Running {
                *state = RunState::Stopped;
                return;
            }
            *state = RunState::Stopped;
        }
        if let Some(cancel) = self.shared.inflight_cancel.lock().unwrap().clone() {
            cancel.cancel();
        }
        self.shared.stop_signal.notify_waiters();
        self.shared.dirty.notify_one();

        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// §4.1 `resend()`: interrupt the in-flight request (if any) and restart
    /// immediately with the latest desired state. A no-op while stopped.
    pub fn resend(&self) {
        if *self.shared.run_state.lock().unwrap() != RunState::Running {
            return;
        }
        if let Some(cancel) = self.shared.inflight_cancel.lock().unwrap().clone() {
            cancel.cancel();
        }
        self.shared.dirty.notify_one();
    }

    fn clone_handle(&self) -> Arc<ControllerLoop> {
        Arc::new(ControllerLoop { shared: self.shared.clone() })
    }
}

/// The actual task body, split out so it can hold an owned `Arc<Shared>`
/// independent of the `SlidingSync` handle's own lifetime.
struct ControllerLoop {
    shared: Arc<Shared>,
}

impl ControllerLoop {
    #[instrument(level = "debug", skip(self))]
    async fn run(self: Arc<Self>) {
        info!("sliding sync loop starting");
        loop {
            if self.is_stopped() {
                break;
            }

            let (body, pos, initial, candidate_last_sent) = self.build_request().await;
            let is_empty = body.lists.is_empty()
                && body.room_subscriptions.is_empty()
                && body.unsubscribe_rooms.is_empty()
                && body.extensions.is_empty();

            if is_empty && pos.is_some() {
                tokio::select! {
                    _ = self.shared.dirty.notified() => {},
                    _ = self.shared.stop_signal.notified() => break,
                }
                continue;
            }

            let cancel = CancelToken::new();
            *self.shared.inflight_cancel.lock().unwrap() = Some(cancel.clone());
            let result = self
                .shared
                .transport
                .send(pos.as_deref(), &body, self.shared.timeout, cancel)
                .await;
            *self.shared.inflight_cancel.lock().unwrap() = None;

            match result {
                Ok(raw) => {
                    self.shared.consecutive_failures.store(0, Ordering::SeqCst);

                    // Only now, with a response in hand, does the snapshot this
                    // request was built against become "last successfully sent" —
                    // a cancelled or failed send below never reaches this commit,
                    // so the parameters it carried stay pending for the next build.
                    let list_order = candidate_last_sent.list_order();
                    let canonical = translate(raw, &list_order);
                    *self.shared.last_sent.lock().await = candidate_last_sent;

                    let _ = self.shared.sinks.lifecycle.send(Lifecycle::RequestFinished {
                        body: Some(Arc::new(canonical.clone())),
                        error: None,
                    });

                    {
                        let mut connection = self.shared.connection.lock().await;
                        connection.pos = Some(canonical.pos.clone());
                        connection.initial = false;
                    }

                    let mut lists = self.shared.lists.lock().await;
                    let extensions = self.shared.extensions.lock().await;
                    crate::applier::ResponseApplier::apply(&canonical, &mut lists, &extensions, &self.shared.sinks)
                        .await;
                }
                Err(Error::Cancelled) => {
                    debug!("request interrupted by resend()/stop(), looping immediately");
                }
                Err(Error::SessionExpired) => {
                    warn!("session expired, resetting connection state");
                    self.shared.last_sent.lock().await.reset();
                    self.shared.connection.lock().await.reset();
                    let _ = self.shared.sinks.lifecycle.send(Lifecycle::RequestFinished {
                        body: None,
                        error: Some(Arc::new(Error::SessionExpired)),
                    });
                }
                Err(e) => {
                    let attempt = self.shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(error = %e, attempt, "sliding sync request failed");
                    let _ = self
                        .shared
                        .sinks
                        .lifecycle
                        .send(Lifecycle::RequestFinished { body: None, error: Some(Arc::new(e)) });
                    self.backoff(attempt).await;
                }
            }
        }
        info!("sliding sync loop stopped");
    }

    async fn build_request(&self) -> (crate::wire::SyncRequest, Option<String>, bool, LastSent) {
        let lists = self.shared.lists.lock().await;
        let subscriptions = self.shared.subscriptions.lock().await;
        let extensions = self.shared.extensions.lock().await;
        let last_sent = self.shared.last_sent.lock().await;
        let connection = self.shared.connection.lock().await;

        let (body, candidate) =
            RequestBuilder::build(&lists, &subscriptions, &extensions, &last_sent, connection.initial);
        (body, connection.pos.clone(), connection.initial, candidate)
    }

    fn is_stopped(&self) -> bool {
        *self.shared.run_state.lock().unwrap() == RunState::Stopped
    }

    async fn backoff(&self, attempt: u32) {
        let millis = 500u64.saturating_mul(1u64 << attempt.min(6));
        let delay = Duration::from_millis(millis).min(MAX_BACKOFF);
        debug!(?delay, "backing off before retrying");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = self.shared.stop_signal.notified() => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::wire::RawSyncResponse;
    use std::sync::atomic::AtomicUsize;

    fn empty_raw(pos: &str) -> RawSyncResponse {
        RawSyncResponse {
            pos: pos.to_string(),
            txn_id: None,
            lists: Some(Default::default()),
            counts: None,
            ops: None,
            rooms: Default::default(),
            extensions: Default::default(),
        }
    }

    #[tokio::test]
    async fn start_stop_sends_one_request_and_emits_complete() {
        let mut mock = MockTransport::new();
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();
        mock.expect_send().returning(move |_, _, _, _| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(empty_raw("a"))
        });

        let sync = Arc::new(SlidingSync::new(Arc::new(mock)));
        let mut lifecycle = sync.subscribe_lifecycle();
        sync.start();

        let first = lifecycle.recv().await.unwrap();
        match first {
            Lifecycle::RequestFinished { error: None, body: Some(body) } => assert_eq!(body.pos, "a"),
            other => panic!("expected RequestFinished with a body, got {other:?}"),
        }
        let second = lifecycle.recv().await.unwrap();
        assert!(matches!(second, Lifecycle::Complete));

        sync.stop().await;
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_list_ranges_on_unknown_list_fails_synchronously() {
        let mock = MockTransport::new();
        let sync = Arc::new(SlidingSync::new(Arc::new(mock)));
        let err = sync.set_list_ranges("ghost", vec![(0, 1)]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownList(_)));
    }

    /// A list shape whose first send fails must not be treated as acknowledged:
    /// the retry has to carry it again, since `last_sent` is only supposed to be
    /// committed once a response actually comes back.
    #[tokio::test]
    async fn failed_send_does_not_retire_the_list_it_carried() {
        let mut mock = MockTransport::new();
        let attempt = Arc::new(AtomicUsize::new(0));
        let attempt_clone = attempt.clone();
        let saw_list: Arc<StdMutex<Vec<bool>>> = Arc::new(StdMutex::new(Vec::new()));
        let saw_list_clone = saw_list.clone();
        mock.expect_send().returning(move |_, body, _, _| {
            let n = attempt_clone.fetch_add(1, Ordering::SeqCst);
            saw_list_clone.lock().unwrap().push(body.lists.contains_key("a"));
            if n == 0 {
                Err(Error::Transport("boom".into()))
            } else {
                Ok(empty_raw("a"))
            }
        });

        let sync = Arc::new(SlidingSync::new(Arc::new(mock)));
        sync.set_list("a", ListShape { ranges: vec![(0, 2)], ..Default::default() }).await;
        let mut lifecycle = sync.subscribe_lifecycle();
        sync.start();

        match lifecycle.recv().await.unwrap() {
            Lifecycle::RequestFinished { error: Some(_), body: None } => {}
            other => panic!("expected the first attempt to fail, got {other:?}"),
        }
        loop {
            if matches!(lifecycle.recv().await.unwrap(), Lifecycle::RequestFinished { error: None, .. }) {
                break;
            }
        }
        sync.stop().await;

        let seen = saw_list.lock().unwrap();
        assert!(seen.len() >= 2, "expected at least a failed attempt and a retry");
        assert!(seen[0], "first attempt must carry the newly defined list");
        assert!(seen[1], "retry after a failed send must still carry the unacknowledged list");
    }
}
