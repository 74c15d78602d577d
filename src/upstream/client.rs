// =============================================================================
// Upstream Client - the single authenticated connection to the trading API
// =============================================================================
//
// One socket, three tasks:
//   - reader:    parses every inbound frame and routes it (pending request,
//                subscription callback, or drop). It never awaits a request.
//   - writer:    drains an unbounded queue into the socket sink.
//   - keepalive: sends `{ping: 1}` on an interval once the link is Ready.
//
// Callers issue requests from their own tasks; each one parks on a oneshot
// that the reader resolves, the deadline fails, or a disconnect fails.
//
// Recovery: an unexpected close of a Ready connection (while
// `should_reconnect` is set) starts a reconnect loop with capped exponential
// backoff. Subscriptions are NOT replayed; a `upstream:reconnected` event is
// published and the caller re-issues whatever it still needs.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::error::UpstreamError;
use crate::event_bus::{EventBus, GatewayEvent};
use crate::runtime_config::UpstreamConfig;
use crate::types::{ConnectionState, ReconnectStatus, SubscriptionKind};
use crate::upstream::backoff::ReconnectPolicy;
use crate::upstream::protocol::{self, Envelope};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked once per push message of a subscription.
pub type PushHandler = Arc<dyn Fn(&Value) + Send + Sync>;

type Reply = Result<Value, UpstreamError>;

/// Deadlines the client runs on. [`UpstreamClient::new`] takes them from
/// the config; tests and embedders can pass their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimings {
    pub request_timeout: Duration,
    pub keepalive: Duration,
}

impl ClientTimings {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            keepalive: config.keepalive_interval(),
        }
    }
}

struct PendingRequest {
    tx: oneshot::Sender<Reply>,
    /// Set for subscribe calls: registered under the upstream-assigned id as
    /// soon as the response carrying that id is read.
    on_subscribe: Option<(SubscriptionKind, PushHandler)>,
}

struct Subscription {
    kind: SubscriptionKind,
    handler: PushHandler,
}

/// Live socket plus the tasks driving it.
struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl Connection {
    /// Queue a close frame and stop the reader and keepalive. The writer
    /// exits by itself once the queue is drained and dropped.
    fn shutdown(self) {
        let _ = self.outbound.send(Message::Close(None));
        if let Some(k) = self.keepalive {
            k.abort();
        }
        self.reader.abort();
    }
}

struct Inner {
    config: UpstreamConfig,
    policy: ReconnectPolicy,
    request_timeout: Duration,
    keepalive: Duration,
    bus: Arc<EventBus>,

    state: RwLock<ConnectionState>,
    authorized: AtomicBool,
    should_reconnect: AtomicBool,
    reconnect_status: Mutex<Option<ReconnectStatus>>,

    next_req_id: AtomicU64,
    generation: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    /// Subscription ids already sent a `forget` on this connection.
    forgotten: Mutex<HashSet<String>>,

    connection: Mutex<Option<Connection>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes connect attempts (caller and reconnect loop).
    connect_lock: tokio::sync::Mutex<()>,
}

/// Handle to the upstream connection. Cheap to clone; all clones share one
/// socket, one pending table and one subscription registry.
#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<Inner>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig, bus: Arc<EventBus>) -> Self {
        let timings = ClientTimings::from_config(&config);
        Self::with_timings(config, bus, timings)
    }

    pub fn with_timings(config: UpstreamConfig, bus: Arc<EventBus>, timings: ClientTimings) -> Self {
        let policy = ReconnectPolicy::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                request_timeout: timings.request_timeout,
                keepalive: timings.keepalive.max(Duration::from_millis(10)),
                bus,
                state: RwLock::new(ConnectionState::Disconnected),
                authorized: AtomicBool::new(false),
                should_reconnect: AtomicBool::new(false),
                reconnect_status: Mutex::new(None),
                next_req_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                forgotten: Mutex::new(HashSet::new()),
                connection: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.authorized.load(Ordering::Acquire)
    }

    /// `Some` while a reconnect is scheduled or in progress.
    pub fn reconnect_status(&self) -> Option<ReconnectStatus> {
        *self.inner.reconnect_status.lock()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn subscription_kind(&self, id: &str) -> Option<SubscriptionKind> {
        self.inner.subscriptions.lock().get(id).map(|s| s.kind)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.inner.state.write(), next);
        if prev != next {
            debug!(from = %prev, to = %next, "upstream state transition");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner
            .connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    // -------------------------------------------------------------------------
    // Connect / disconnect
    // -------------------------------------------------------------------------

    /// Open the connection and authorize if a token is configured.
    ///
    /// No-op when already Ready. An authorize rejection is logged and the
    /// client stays usable unauthenticated.
    pub async fn connect(&self) -> Result<(), UpstreamError> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        self.inner.should_reconnect.store(true, Ordering::Release);
        self.establish().await
    }

    /// Close the connection for good: no reconnect, every pending request
    /// fails with `Disconnected`, every subscription is dropped.
    pub fn disconnect(&self) {
        self.inner.should_reconnect.store(false, Ordering::Release);
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        *self.inner.reconnect_status.lock() = None;

        let conn = self.inner.connection.lock().take();
        let had_connection = conn.is_some();
        if let Some(conn) = conn {
            conn.shutdown();
        }

        self.clear_session();
        self.set_state(ConnectionState::Disconnected);

        if had_connection {
            info!("upstream disconnected by request");
            self.inner.bus.publish(&GatewayEvent::UpstreamDisconnected {
                reason: "client disconnect".to_string(),
            });
        }
    }

    /// Caller must hold `connect_lock`.
    async fn establish(&self) -> Result<(), UpstreamError> {
        if let Some(stale) = self.inner.connection.lock().take() {
            stale.shutdown();
        }
        self.set_state(ConnectionState::Connecting);

        let url = self.inner.config.url();
        info!(endpoint = %self.inner.config.endpoint, "connecting to upstream");

        let ws = match tokio::time::timeout(self.inner.request_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(UpstreamError::Transport("connect timed out".to_string()));
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (sink, stream) = ws.split();
        let (outbound, queue) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(sink, queue, self.clone(), generation));
        let reader = tokio::spawn(self.clone().read_loop(stream, generation));

        *self.inner.connection.lock() = Some(Connection {
            generation,
            outbound,
            reader,
            keepalive: None,
        });
        self.set_state(ConnectionState::Connected);
        info!(generation, "upstream connected");
        self.inner.bus.publish(&GatewayEvent::UpstreamConnected);

        let authorized = match self.inner.config.api_token.clone() {
            Some(token) => {
                self.set_state(ConnectionState::Authorizing);
                match self.request(protocol::authorize(&token)).await {
                    Ok(_) => {
                        info!("upstream authorized");
                        true
                    }
                    Err(e) => {
                        warn!(error = %e, "upstream authorize failed, continuing unauthenticated");
                        false
                    }
                }
            }
            None => false,
        };

        // The link may have dropped (or been closed) during authorize. Ready
        // is only set while this generation still owns the slot, so a
        // concurrent `connection_lost` either sees Ready or wins the slot.
        let keepalive = tokio::spawn(self.clone().keepalive_loop(generation));
        {
            let mut slot = self.inner.connection.lock();
            match slot.as_mut() {
                Some(conn) if conn.generation == generation => {
                    conn.keepalive = Some(keepalive);
                    self.inner.authorized.store(authorized, Ordering::Release);
                    self.set_state(ConnectionState::Ready);
                }
                _ => {
                    keepalive.abort();
                    return Err(UpstreamError::Disconnected);
                }
            }
        }

        self.inner.bus.publish(&GatewayEvent::UpstreamReady { authorized });
        Ok(())
    }

    /// Fail every pending request and forget every subscription.
    fn clear_session(&self) {
        let pending: Vec<PendingRequest> = self.inner.pending.lock().drain().map(|(_, p)| p).collect();
        if !pending.is_empty() {
            warn!(count = pending.len(), "failing in-flight upstream requests");
        }
        for p in pending {
            let _ = p.tx.send(Err(UpstreamError::Disconnected));
        }

        let dropped = {
            let mut subs = self.inner.subscriptions.lock();
            let n = subs.len();
            subs.clear();
            n
        };
        if dropped > 0 {
            warn!(count = dropped, "upstream subscriptions invalidated; callers must resubscribe");
        }
        self.inner.forgotten.lock().clear();
        self.inner.authorized.store(false, Ordering::Release);
    }

    /// Called by the reader or writer when the socket dies. Only the first
    /// report for the current connection has any effect.
    fn connection_lost(&self, generation: u64, reason: String) {
        let conn = {
            let mut slot = self.inner.connection.lock();
            match slot.as_ref() {
                Some(c) if c.generation == generation => slot.take(),
                _ => return,
            }
        };
        let was_ready = self.is_ready();
        if let Some(conn) = conn {
            conn.shutdown();
        }

        warn!(generation, reason = %reason, "upstream connection lost");
        self.clear_session();
        self.set_state(ConnectionState::Disconnected);
        self.inner
            .bus
            .publish(&GatewayEvent::UpstreamDisconnected { reason });

        if was_ready && self.inner.should_reconnect.load(Ordering::Acquire) {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let client = self.clone();
        let task = tokio::spawn(async move { client.reconnect_loop().await });
        if let Some(previous) = self.inner.reconnect_task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn reconnect_loop(&self) {
        let policy = self.inner.policy;
        let mut attempt = 0u32;

        while self.inner.should_reconnect.load(Ordering::Acquire) {
            if !policy.allows(attempt) {
                *self.inner.reconnect_status.lock() = None;
                error!(attempts = attempt, "upstream reconnect attempts exhausted, giving up");
                self.inner
                    .bus
                    .publish(&GatewayEvent::ReconnectFailed { attempts: attempt });
                return;
            }

            let delay = policy.delay_for(attempt);
            *self.inner.reconnect_status.lock() = Some(ReconnectStatus {
                attempt,
                next_delay: delay,
            });
            warn!(attempt, delay_ms = delay.as_millis() as u64, "upstream reconnect scheduled");
            self.inner.bus.publish(&GatewayEvent::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::time::sleep(delay).await;
            if !self.inner.should_reconnect.load(Ordering::Acquire) {
                break;
            }

            let result = {
                let _guard = self.inner.connect_lock.lock().await;
                if self.is_ready() {
                    Ok(())
                } else {
                    self.establish().await
                }
            };

            match result {
                Ok(()) => {
                    *self.inner.reconnect_status.lock() = None;
                    info!(attempt, "upstream reconnected");
                    self.inner.bus.publish(&GatewayEvent::Reconnected);
                    return;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "upstream reconnect attempt failed");
                    attempt += 1;
                }
            }
        }

        *self.inner.reconnect_status.lock() = None;
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Send `payload` and wait for the response carrying the same `req_id`.
    #[instrument(skip_all, name = "upstream::request")]
    pub async fn request(&self, payload: Value) -> Result<Value, UpstreamError> {
        self.send_tracked(payload, None).await
    }

    /// Open a push stream. `callback` runs on the reader task once per push
    /// message bearing the returned subscription id, in receipt order. The
    /// response that opens the stream is itself delivered to `callback` when
    /// it carries the subscription id.
    pub async fn subscribe<F>(&self, payload: Value, callback: F) -> Result<String, UpstreamError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let kind = SubscriptionKind::infer(&payload);
        let handler: PushHandler = Arc::new(callback);
        let response = self.send_tracked(payload, Some((kind, handler))).await?;

        let id = Envelope::from_value(&response)
            .subscription_id()
            .map(str::to_string)
            .ok_or(UpstreamError::MissingSubscriptionId)?;
        info!(subscription = %id, ?kind, "upstream subscription active");
        Ok(id)
    }

    /// Ask upstream to forget `subscription_id` and drop the local
    /// registration whatever the answer.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), UpstreamError> {
        self.inner.forgotten.lock().insert(subscription_id.to_string());
        let result = self.request(protocol::forget(subscription_id)).await;
        let removed = self.inner.subscriptions.lock().remove(subscription_id).is_some();
        match &result {
            Ok(_) => debug!(subscription = %subscription_id, removed, "upstream subscription forgotten"),
            Err(e) => warn!(subscription = %subscription_id, error = %e, "forget failed, registration dropped anyway"),
        }
        result.map(|_| ())
    }

    fn outbound(&self) -> Result<mpsc::UnboundedSender<Message>, UpstreamError> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|c| c.outbound.clone())
            .ok_or(UpstreamError::NotConnected)
    }

    async fn send_tracked(
        &self,
        payload: Value,
        on_subscribe: Option<(SubscriptionKind, PushHandler)>,
    ) -> Result<Value, UpstreamError> {
        let outbound = self.outbound()?;
        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::Relaxed);
        let payload = protocol::attach_req_id(payload, req_id).map_err(UpstreamError::InvalidPayload)?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(req_id, PendingRequest { tx, on_subscribe });

        if outbound.send(Message::Text(payload.to_string())).is_err() {
            self.inner.pending.lock().remove(&req_id);
            return Err(UpstreamError::Disconnected);
        }
        debug!(req_id, "upstream request sent");

        let timeout = self.inner.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(UpstreamError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().remove(&req_id);
                warn!(req_id, timeout_ms = timeout.as_millis() as u64, "upstream request timed out");
                Err(UpstreamError::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget send with a fresh `req_id` and no pending entry.
    fn send_untracked(&self, payload: Value) {
        let req_id = self.inner.next_req_id.fetch_add(1, Ordering::Relaxed);
        if let (Ok(outbound), Ok(payload)) = (self.outbound(), protocol::attach_req_id(payload, req_id)) {
            let _ = outbound.send(Message::Text(payload.to_string()));
        }
    }

    // -------------------------------------------------------------------------
    // Reader side
    // -------------------------------------------------------------------------

    async fn read_loop(self, mut stream: SplitStream<WsStream>, generation: u64) {
        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.dispatch(&text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.dispatch(text),
                    Err(_) => debug!(len = bytes.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(f) => format!("closed by upstream: {} {}", f.code, f.reason),
                        None => "closed by upstream".to_string(),
                    };
                }
                // Ping / Pong / raw frames -- tungstenite answers pings itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read error: {e}"),
                None => break "stream ended".to_string(),
            }
        };
        self.connection_lost(generation, reason);
    }

    /// Route one inbound message.
    fn dispatch(&self, text: &str) {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping unparseable upstream message");
                return;
            }
        };
        let envelope = Envelope::from_value(&msg);
        let req_id = envelope.request_id();

        if let Some(err) = envelope.error {
            let pending = req_id.and_then(|id| self.inner.pending.lock().remove(&id));
            match pending {
                Some(p) => {
                    let _ = p.tx.send(Err(UpstreamError::Api {
                        code: err.code,
                        message: err.message,
                    }));
                }
                None => warn!(code = %err.code, message = %err.message, ?req_id, "unmatched upstream error dropped"),
            }
            return;
        }

        if let Some(sub_id) = envelope.subscription_id() {
            let mut pending = req_id.and_then(|id| self.inner.pending.lock().remove(&id));
            let mut registered_here = false;

            if let Some((kind, handler)) = pending.as_mut().and_then(|p| p.on_subscribe.take()) {
                let mut subs = self.inner.subscriptions.lock();
                if !subs.contains_key(sub_id) {
                    subs.insert(sub_id.to_string(), Subscription { kind, handler });
                    registered_here = true;
                }
            }

            let handler = self
                .inner
                .subscriptions
                .lock()
                .get(sub_id)
                .map(|s| s.handler.clone());
            match handler {
                Some(h) => h(&msg),
                // Answer to a subscribe whose caller already timed out.
                None if pending.is_none() && req_id.is_some_and(|id| self.was_issued(id)) => {
                    self.forget_orphan(sub_id);
                }
                None => debug!(subscription = %sub_id, "push for unknown subscription dropped"),
            }

            if let Some(p) = pending {
                if p.tx.send(Ok(msg)).is_err() && registered_here {
                    // The subscriber gave up before the stream opened.
                    self.inner.subscriptions.lock().remove(sub_id);
                    self.forget_orphan(sub_id);
                }
            }
            return;
        }

        if let Some(id) = req_id {
            match self.inner.pending.lock().remove(&id) {
                Some(p) => {
                    let _ = p.tx.send(Ok(msg));
                }
                None => debug!(req_id = id, "late or unmatched upstream response dropped"),
            }
        }
    }

    fn was_issued(&self, req_id: u64) -> bool {
        req_id < self.inner.next_req_id.load(Ordering::Relaxed)
    }

    /// Best-effort `forget` for a stream nobody holds, sent once per id.
    fn forget_orphan(&self, subscription_id: &str) {
        if self.inner.forgotten.lock().insert(subscription_id.to_string()) {
            warn!(subscription = %subscription_id, "forgetting orphaned upstream subscription");
            self.send_untracked(protocol::forget(subscription_id));
        }
    }

    async fn keepalive_loop(self, generation: u64) {
        let period = self.inner.keepalive;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.is_current(generation) {
                return;
            }
            match self.request(protocol::ping()).await {
                Ok(_) => debug!("upstream keepalive ok"),
                Err(e) => warn!(error = %e, "upstream keepalive ping failed"),
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut queue: mpsc::UnboundedReceiver<Message>,
    client: UpstreamClient,
    generation: u64,
) {
    while let Some(msg) = queue.recv().await {
        let closing = matches!(msg, Message::Close(_));
        match tokio::time::timeout(client.inner.request_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                client.connection_lost(generation, format!("write error: {e}"));
                return;
            }
            Err(_) => {
                client.connection_lost(generation, "write timed out".to_string());
                return;
            }
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("state", &self.state())
            .field("authorized", &self.is_authorized())
            .field("pending", &self.pending_count())
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
