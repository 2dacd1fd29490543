//! Resilient subscription session.
//!
//! `PriceFeedSession` presents a feed-oriented subscribe/unsubscribe API on
//! top of the reconnecting [`SocketSession`]. It owns the registry mapping
//! feed ids to subscriber callbacks, replays the full id set to the server
//! after every (re)connect, and fans inbound `price_update` frames out to the
//! registered callbacks.
//!
//! The registry is the single source of truth for desired server-side state:
//! reconnect resync recomputes the subscribe message from current registry
//! keys, so no dirty flag is kept and a send lost to a disconnect is
//! reconciled on the next resync.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::feed::{FeedId, FeedParseError, PriceFeed};
use crate::retry::RetryPolicy;
use crate::stream::proto::{ClientMessage, ResponseStatus, ServerMessage};
use crate::stream::socket::{
    SocketError, SocketEvent, SocketOptions, SocketSender, SocketSession,
};

/// Errors surfaced through the session error hook.
///
/// None of these are returned from `subscribe`/`unsubscribe`; those calls are
/// fire-and-forget with respect to the network.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Transport-level failure (connect, send, connection loss).
    #[error("transport error: {0}")]
    Transport(#[from] SocketError),

    /// The outer message envelope was not well-formed.
    #[error("malformed server frame: {0}")]
    FrameParse(#[source] serde_json::Error),

    /// A `price_update` frame carried a malformed payload.
    #[error(transparent)]
    PayloadParse(#[from] FeedParseError),

    /// The server explicitly returned an error status.
    #[error("server reported error: {0}")]
    ServerReported(String),
}

/// Configuration for a [`PriceFeedSession`].
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Websocket endpoint URL.
    pub endpoint: String,
    /// Optional API key forwarded in the websocket handshake.
    pub api_key: Option<SecretString>,
    /// Reconnect backoff policy for the underlying socket.
    pub backoff: RetryPolicy,
    /// Forwarded verbatim in subscribe messages; asks the server to include
    /// feed metadata in updates.
    pub verbose: bool,
    /// Sends a subscribe message even when a call adds no new feed ids.
    /// Off by default; the server treats an empty id list as a no-op either
    /// way.
    pub send_empty_subscribe: bool,
}

impl SessionOptions {
    /// Creates options for the given endpoint with defaults.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim().to_string(),
            api_key: None,
            backoff: RetryPolicy::reconnect(),
            verbose: false,
            send_empty_subscribe: false,
        }
    }

    /// Sets the API key forwarded in the websocket handshake.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Overrides the socket reconnect backoff policy.
    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Requests verbose feed metadata in updates.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Enables sending subscribe messages with an empty id list.
    pub fn with_send_empty_subscribe(mut self, send: bool) -> Self {
        self.send_empty_subscribe = send;
        self
    }

    fn socket_options(&self) -> SocketOptions {
        let mut options =
            SocketOptions::new(self.endpoint.clone()).with_backoff(self.backoff.clone());
        if let Some(api_key) = self.api_key.clone() {
            options = options.with_api_key(api_key);
        }
        options
    }
}

/// Token identifying a registered callback.
///
/// Callback identity is tracked through handles minted at subscribe time, so
/// the same handle attached twice to a feed dedups to a single delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type FeedCallback = Arc<dyn Fn(PriceFeed) + Send + Sync>;
type ErrorHook = Box<dyn Fn(SessionError) + Send + Sync>;

/// Feed subscription session backed by a reconnecting websocket.
///
/// The transport worker and dispatch loop are spawned onto the ambient tokio
/// runtime, so the session must be used from within one.
pub struct PriceFeedSession {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    options: SessionOptions,
    error_hook: ErrorHook,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    registry: HashMap<FeedId, BTreeSet<u64>>,
    callbacks: HashMap<u64, FeedCallback>,
    next_handle: u64,
    socket: Option<SocketBinding>,
    connected: bool,
    generation: u64,
}

struct SocketBinding {
    sender: SocketSender,
    generation: u64,
}

impl PriceFeedSession {
    /// Creates a session whose error hook logs at WARN and continues.
    pub fn new(options: SessionOptions) -> Self {
        Self::with_error_handler(options, |error| {
            warn!(event = "stream_session_error", %error);
        })
    }

    /// Creates a session with a custom error hook.
    ///
    /// The hook receives every transport, frame-parse, payload-parse, and
    /// server-reported error; it must not panic.
    pub fn with_error_handler<F>(options: SessionOptions, hook: F) -> Self
    where
        F: Fn(SessionError) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(SessionShared {
                options,
                error_hook: Box::new(hook),
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    /// Registers `callback` for the given feed ids and returns its handle.
    ///
    /// Lazy-starts the transport on first use, spawning it onto the ambient
    /// tokio runtime; calling this outside a runtime panics. Sends one
    /// subscribe message containing only the ids that were not yet tracked;
    /// ids already in the registry are not re-sent. Transport failures
    /// surface through the error hook, never from this call.
    pub fn subscribe<I, S, F>(&self, ids: I, callback: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(PriceFeed) + Send + Sync + 'static,
    {
        let ids = normalize_ids(ids);
        let handle_id = self.shared.register_callback(Arc::new(callback));
        self.shared.attach(handle_id, ids);
        SubscriptionHandle(handle_id)
    }

    /// Attaches an existing handle to additional feed ids.
    ///
    /// Attaching a handle to a feed it already receives is a no-op; a handle
    /// with no remaining registrations is unknown and ignored.
    pub fn subscribe_with_handle<I, S>(&self, handle: &SubscriptionHandle, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids = normalize_ids(ids);
        self.shared.attach(handle.0, ids);
    }

    /// Unsubscribes the given feed ids entirely, dropping every callback
    /// registered for them, and sends one unsubscribe message for the ids
    /// that were tracked. Tears the transport down when the registry empties.
    pub fn unsubscribe<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.shared.detach(normalize_ids(ids), None);
    }

    /// Removes only `handle` from the given feed ids. Ids whose subscriber
    /// set empties are unsubscribed server-side; ids with remaining
    /// subscribers are kept.
    pub fn unsubscribe_handle<I, S>(&self, ids: I, handle: &SubscriptionHandle)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.shared.detach(normalize_ids(ids), Some(handle.0));
    }

    /// Returns the currently subscribed feed ids, sorted.
    pub fn subscribed_ids(&self) -> Vec<FeedId> {
        let state = self.shared.state();
        let mut ids: Vec<FeedId> = state.registry.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns whether a transport is currently running.
    pub fn is_active(&self) -> bool {
        self.shared.state().socket.is_some()
    }

    /// Tears down the transport and clears the registry. Idempotent; a later
    /// subscribe call starts over with a fresh connection.
    pub fn close(&self) {
        let mut state = self.shared.state();
        state.registry.clear();
        state.callbacks.clear();
        state.socket = None;
        state.connected = false;
    }
}

impl Drop for PriceFeedSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionShared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_callback(&self, callback: FeedCallback) -> u64 {
        let mut state = self.state();
        state.next_handle += 1;
        let handle_id = state.next_handle;
        state.callbacks.insert(handle_id, callback);
        handle_id
    }

    /// Adds `handle_id` to each feed's subscriber set and sends one subscribe
    /// message with the ids that were newly added to the registry.
    fn attach(self: &Arc<Self>, handle_id: u64, ids: Vec<FeedId>) {
        let mut state = self.state();
        if !state.callbacks.contains_key(&handle_id) {
            warn!(event = "subscribe_with_unknown_handle", handle_id);
            return;
        }

        self.ensure_socket(&mut state);

        let mut added = Vec::new();
        for id in ids {
            let newly_tracked = !state.registry.contains_key(&id);
            state.registry.entry(id.clone()).or_default().insert(handle_id);
            if newly_tracked {
                added.push(id);
            }
        }

        if !state.connected {
            // The Open/Reconnect resync replays the full registry.
            return;
        }
        if added.is_empty() && !self.options.send_empty_subscribe {
            return;
        }
        let message = ClientMessage::Subscribe {
            ids: added,
            verbose: self.options.verbose.then_some(true),
        };
        self.send_message(&state, &message);
    }

    /// Removes subscribers for the given ids; `handle_id` of `None` drops
    /// every subscriber of a feed. Sends one unsubscribe message for the ids
    /// whose registry key was removed.
    fn detach(&self, ids: Vec<FeedId>, handle_id: Option<u64>) {
        let mut state = self.state();
        let mut removed = Vec::new();

        for id in ids {
            match handle_id {
                None => {
                    if state.registry.remove(&id).is_some() {
                        removed.push(id);
                    }
                }
                Some(handle_id) => {
                    if let Some(set) = state.registry.get_mut(&id) {
                        if set.remove(&handle_id) && set.is_empty() {
                            state.registry.remove(&id);
                            removed.push(id);
                        }
                    }
                }
            }
        }

        let live: HashSet<u64> = state.registry.values().flatten().copied().collect();
        state.callbacks.retain(|id, _| live.contains(id));

        if !removed.is_empty() && state.connected {
            let message = ClientMessage::Unsubscribe { ids: removed };
            self.send_message(&state, &message);
        }

        if state.registry.is_empty() && state.socket.is_some() {
            debug!(event = "stream_teardown_on_empty_registry");
            state.socket = None;
            state.connected = false;
        }
    }

    fn ensure_socket(self: &Arc<Self>, state: &mut SessionState) {
        if state.socket.is_some() {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let handle = SocketSession::start(self.options.socket_options());
        let (sender, events) = handle.split();
        state.socket = Some(SocketBinding { sender, generation });
        state.connected = false;

        let shared = Arc::clone(self);
        tokio::spawn(dispatch_loop(shared, events, generation));
    }

    fn send_message(&self, state: &SessionState, message: &ClientMessage) {
        let Some(binding) = state.socket.as_ref() else {
            return;
        };
        match message.to_text() {
            Ok(text) => {
                let _ = binding.sender.send_text(text);
            }
            Err(error) => warn!(event = "encode_outbound_failed", %error),
        }
    }

    fn binding_current(state: &SessionState, generation: u64) -> bool {
        state
            .socket
            .as_ref()
            .is_some_and(|binding| binding.generation == generation)
    }

    fn handle_event(self: &Arc<Self>, event: SocketEvent, generation: u64) {
        match event {
            SocketEvent::Open | SocketEvent::Reconnect => {
                let reconnected = matches!(event, SocketEvent::Reconnect);
                let mut state = self.state();
                if !Self::binding_current(&state, generation) {
                    return;
                }
                state.connected = true;
                if !state.registry.is_empty() {
                    let mut ids: Vec<FeedId> = state.registry.keys().cloned().collect();
                    ids.sort();
                    let count = ids.len();
                    let message = ClientMessage::Subscribe {
                        ids,
                        verbose: self.options.verbose.then_some(true),
                    };
                    self.send_message(&state, &message);
                    if reconnected {
                        info!(event = "stream_resynced_after_reconnect", feeds = count);
                    }
                }
                if !reconnected {
                    debug!(event = "stream_connected");
                }
            }
            SocketEvent::Error(error) => {
                {
                    let mut state = self.state();
                    if Self::binding_current(&state, generation) {
                        state.connected = false;
                    }
                }
                (self.error_hook)(SessionError::Transport(error));
            }
            SocketEvent::Frame(text) => self.handle_frame(&text, generation),
        }
    }

    fn handle_frame(&self, text: &str, generation: u64) {
        // Frames from a torn-down or replaced socket are discarded before
        // they can reach the error hook or a callback.
        if !Self::binding_current(&self.state(), generation) {
            return;
        }

        let message = match ServerMessage::from_text(text) {
            Ok(message) => message,
            Err(error) => {
                (self.error_hook)(SessionError::FrameParse(error));
                return;
            }
        };

        match message {
            ServerMessage::Response {
                status: ResponseStatus::Error,
                error,
            } => {
                let detail = error.unwrap_or_else(|| "unspecified server error".to_string());
                (self.error_hook)(SessionError::ServerReported(detail));
            }
            ServerMessage::Response { .. } => {
                debug!(event = "server_ack");
            }
            ServerMessage::PriceUpdate { price_feed } => {
                let feed = match PriceFeed::from_json(price_feed) {
                    Ok(feed) => feed,
                    Err(error) => {
                        (self.error_hook)(SessionError::PayloadParse(error));
                        return;
                    }
                };
                self.dispatch_update(feed, generation);
            }
            ServerMessage::Unknown => {
                debug!(event = "ignored_unknown_message");
            }
        }
    }

    fn dispatch_update(&self, feed: PriceFeed, generation: u64) {
        // Snapshot the subscriber set before invoking anything: a callback
        // may itself call subscribe/unsubscribe, which takes the state lock.
        let callbacks: Vec<FeedCallback> = {
            let state = self.state();
            if !Self::binding_current(&state, generation) {
                return;
            }
            let Some(set) = state.registry.get(&feed.id) else {
                debug!(event = "update_for_unregistered_feed", id = %feed.id);
                return;
            };
            set.iter()
                .filter_map(|id| state.callbacks.get(id).cloned())
                .collect()
        };

        let feed_id = feed.id.clone();
        for callback in callbacks {
            let update = feed.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
                warn!(event = "subscriber_callback_panicked", id = %feed_id);
            }
        }
    }
}

async fn dispatch_loop(
    shared: Arc<SessionShared>,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        shared.handle_event(event, generation);
    }

    // Worker exited (closed, or initial connect attempts exhausted). Release
    // the binding so a later subscribe lazy-starts a fresh connection.
    let mut state = shared.state();
    if SessionShared::binding_current(&state, generation) {
        state.socket = None;
        state.connected = false;
    }
}

fn normalize_ids<I, S>(ids: I) -> Vec<FeedId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ids.into_iter().map(FeedId::new).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{
        PriceFeedSession, SessionError, SessionOptions, SocketBinding, SubscriptionHandle,
    };
    use crate::feed::FeedId;
    use crate::stream::proto::ClientMessage;
    use crate::stream::socket::{SocketEvent, SocketSender};

    fn options() -> SessionOptions {
        SessionOptions::new("ws://127.0.0.1:9/ws")
    }

    /// Installs an in-memory socket binding so registry logic can be driven
    /// without a real connection or runtime.
    fn bind_test_socket(session: &PriceFeedSession) -> (mpsc::UnboundedReceiver<String>, u64) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = session.shared.state();
        state.generation += 1;
        let generation = state.generation;
        state.socket = Some(SocketBinding {
            sender: SocketSender::from_raw(tx),
            generation,
        });
        state.connected = true;
        (rx, generation)
    }

    fn recv_message(rx: &mut mpsc::UnboundedReceiver<String>) -> ClientMessage {
        let text = rx.try_recv().expect("expected an outbound frame");
        ClientMessage::from_text(&text).expect("outbound frame must be valid")
    }

    fn assert_no_message(rx: &mut mpsc::UnboundedReceiver<String>) {
        assert!(rx.try_recv().is_err(), "expected no outbound frame");
    }

    fn price_update_frame(id: &str) -> String {
        json!({
            "type": "price_update",
            "price_feed": {
                "id": id,
                "price": {"price": "100", "conf": "1", "expo": -8, "publish_time": 1},
                "ema_price": {"price": "99", "conf": "1", "expo": -8, "publish_time": 1}
            }
        })
        .to_string()
    }

    fn counting_session() -> (PriceFeedSession, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let session = PriceFeedSession::with_error_handler(options(), move |error| {
            sink.lock().expect("error sink").push(error.to_string());
        });
        (session, errors)
    }

    #[test]
    fn same_handle_subscribed_twice_is_invoked_once_per_update() {
        let session = PriceFeedSession::new(options());
        let (mut rx, generation) = bind_test_socket(&session);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handle = session.subscribe(["ab12"], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        session.subscribe_with_handle(&handle, ["0xAB12"]);

        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Subscribe {
                ids: vec![FeedId::new("ab12")],
                verbose: None,
            }
        );
        // Second attach added no new topics: no wire message.
        assert_no_message(&mut rx);

        session
            .shared
            .handle_event(SocketEvent::Frame(price_update_frame("ab12")), generation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn incremental_subscribe_sends_only_new_ids() {
        let session = PriceFeedSession::new(options());
        let (mut rx, _) = bind_test_socket(&session);

        session.subscribe(["ab12"], |_| {});
        session.subscribe(["ab12", "cd34"], |_| {});

        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Subscribe {
                ids: vec![FeedId::new("ab12")],
                verbose: None,
            }
        );
        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Subscribe {
                ids: vec![FeedId::new("cd34")],
                verbose: None,
            }
        );
        assert_no_message(&mut rx);
    }

    #[test]
    fn partial_unsubscribe_keeps_topic_until_last_subscriber_leaves() {
        let session = PriceFeedSession::new(options());
        let (mut rx, generation) = bind_test_socket(&session);

        let first_calls = Arc::new(AtomicUsize::new(0));
        let second_calls = Arc::new(AtomicUsize::new(0));
        let first_counter = Arc::clone(&first_calls);
        let second_counter = Arc::clone(&second_calls);

        let first = session.subscribe(["aa11"], move |_| {
            first_counter.fetch_add(1, Ordering::SeqCst);
        });
        let second = session.subscribe(["aa11"], move |_| {
            second_counter.fetch_add(1, Ordering::SeqCst);
        });
        let _ = recv_message(&mut rx);

        session.unsubscribe_handle(["aa11"], &first);
        // Remaining subscriber: no unsubscribe on the wire, topic stays.
        assert_no_message(&mut rx);
        assert_eq!(session.subscribed_ids(), vec![FeedId::new("aa11")]);

        session
            .shared
            .handle_event(SocketEvent::Frame(price_update_frame("aa11")), generation);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);

        session.unsubscribe_handle(["aa11"], &second);
        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Unsubscribe {
                ids: vec![FeedId::new("aa11")],
            }
        );
        assert!(session.subscribed_ids().is_empty());
        // Registry emptied: transport torn down.
        assert!(!session.is_active());
    }

    #[test]
    fn unsubscribe_without_handle_drops_all_subscribers() {
        let session = PriceFeedSession::new(options());
        let (mut rx, _) = bind_test_socket(&session);

        session.subscribe(["ab12"], |_| {});
        session.subscribe(["ab12"], |_| {});
        let _ = recv_message(&mut rx);

        session.unsubscribe(["0xAB12"]);
        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Unsubscribe {
                ids: vec![FeedId::new("ab12")],
            }
        );
        assert!(session.subscribed_ids().is_empty());
    }

    #[test]
    fn reconnect_resync_lists_all_registered_ids() {
        let session = PriceFeedSession::new(options());
        let (mut rx, generation) = bind_test_socket(&session);

        session.subscribe(["cd34"], |_| {});
        session.subscribe(["ab12"], |_| {});
        let _ = recv_message(&mut rx);
        let _ = recv_message(&mut rx);

        session.shared.handle_event(SocketEvent::Reconnect, generation);
        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Subscribe {
                ids: vec![FeedId::new("ab12"), FeedId::new("cd34")],
                verbose: None,
            }
        );
        assert_no_message(&mut rx);
    }

    #[test]
    fn resync_skipped_when_registry_empty() {
        let session = PriceFeedSession::new(options());
        let (mut rx, generation) = bind_test_socket(&session);

        session.shared.handle_event(SocketEvent::Reconnect, generation);
        assert_no_message(&mut rx);
    }

    #[test]
    fn malformed_frame_reports_error_once_and_keeps_dispatching() {
        let (session, errors) = counting_session();
        let (_rx, generation) = bind_test_socket(&session);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        session.subscribe(["ab12"], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session
            .shared
            .handle_event(SocketEvent::Frame("not json".to_string()), generation);

        let recorded = errors.lock().expect("error sink").clone();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].contains("malformed server frame"));
        assert_eq!(session.subscribed_ids(), vec![FeedId::new("ab12")]);

        // The dispatch loop survives: the next valid frame is delivered.
        session
            .shared
            .handle_event(SocketEvent::Frame(price_update_frame("ab12")), generation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_payload_reports_payload_error() {
        let (session, errors) = counting_session();
        let (_rx, generation) = bind_test_socket(&session);
        session.subscribe(["ab12"], |_| {});

        let frame = json!({"type": "price_update", "price_feed": {"id": "ab12"}}).to_string();
        session
            .shared
            .handle_event(SocketEvent::Frame(frame), generation);

        let recorded = errors.lock().expect("error sink").clone();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].contains("malformed price feed payload"));
    }

    #[test]
    fn server_error_response_is_forwarded_to_hook() {
        let (session, errors) = counting_session();
        let (_rx, generation) = bind_test_socket(&session);

        let frame = r#"{"type":"response","status":"error","error":"unknown id"}"#.to_string();
        session
            .shared
            .handle_event(SocketEvent::Frame(frame), generation);

        let recorded = errors.lock().expect("error sink").clone();
        assert_eq!(recorded, vec!["server reported error: unknown id".to_string()]);
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let (session, errors) = counting_session();
        let (_rx, generation) = bind_test_socket(&session);

        let frame = r#"{"type":"open_interest_update","value":1}"#.to_string();
        session
            .shared
            .handle_event(SocketEvent::Frame(frame), generation);

        assert!(errors.lock().expect("error sink").is_empty());
    }

    #[test]
    fn panicking_callback_does_not_block_siblings_or_later_frames() {
        let session = PriceFeedSession::new(options());
        let (_rx, generation) = bind_test_socket(&session);

        let _panicking = session.subscribe(["ab12"], |_| {
            panic!("subscriber fault");
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _counting = session.subscribe(["ab12"], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session
            .shared
            .handle_event(SocketEvent::Frame(price_update_frame("ab12")), generation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        session
            .shared
            .handle_event(SocketEvent::Frame(price_update_frame("ab12")), generation);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn update_for_unregistered_feed_is_dropped() {
        let (session, errors) = counting_session();
        let (_rx, generation) = bind_test_socket(&session);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        session.subscribe(["ab12"], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session
            .shared
            .handle_event(SocketEvent::Frame(price_update_frame("ffff")), generation);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(errors.lock().expect("error sink").is_empty());
    }

    #[test]
    fn empty_subscribe_send_is_configurable() {
        let session = PriceFeedSession::new(options().with_send_empty_subscribe(true));
        let (mut rx, _) = bind_test_socket(&session);

        session.subscribe(["ab12"], |_| {});
        let _ = recv_message(&mut rx);

        // No new ids, but the empty send is enabled.
        session.subscribe(["ab12"], |_| {});
        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Subscribe {
                ids: Vec::new(),
                verbose: None,
            }
        );
    }

    #[test]
    fn verbose_flag_is_forwarded_in_subscribe_messages() {
        let session = PriceFeedSession::new(options().with_verbose(true));
        let (mut rx, _) = bind_test_socket(&session);

        session.subscribe(["ab12"], |_| {});
        assert_eq!(
            recv_message(&mut rx),
            ClientMessage::Subscribe {
                ids: vec![FeedId::new("ab12")],
                verbose: Some(true),
            }
        );
    }

    #[test]
    fn close_clears_registry_and_is_idempotent() {
        let session = PriceFeedSession::new(options());
        let (_rx, _) = bind_test_socket(&session);
        session.subscribe(["ab12"], |_| {});

        session.close();
        assert!(session.subscribed_ids().is_empty());
        assert!(!session.is_active());
        session.close();
    }

    #[test]
    fn stale_generation_frames_do_not_reach_the_error_hook() {
        let (session, errors) = counting_session();
        let (_old_rx, old_generation) = bind_test_socket(&session);
        session.subscribe(["ab12"], |_| {});

        // Rebinding replaces the socket; the old generation is now stale.
        let (_rx, generation) = bind_test_socket(&session);

        session
            .shared
            .handle_event(SocketEvent::Frame("not json".to_string()), old_generation);
        assert!(errors.lock().expect("error sink").is_empty());

        // After close no binding exists: even current-generation frames are
        // discarded.
        session.close();
        session
            .shared
            .handle_event(SocketEvent::Frame("not json".to_string()), generation);
        assert!(errors.lock().expect("error sink").is_empty());
    }

    #[test]
    fn handle_tokens_are_distinct_per_subscribe() {
        let session = PriceFeedSession::new(options());
        let (_rx, _) = bind_test_socket(&session);

        let first: SubscriptionHandle = session.subscribe(["ab12"], |_| {});
        let second = session.subscribe(["ab12"], |_| {});
        assert_ne!(first, second);
    }
}
