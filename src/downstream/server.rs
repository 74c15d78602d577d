// =============================================================================
// Downstream Server - WebSocket fan-out to gateway clients
// =============================================================================
//
// Clients connect to `/ws` (optionally `?token=<secret>`) and:
//   - receive every broadcast frame (ticks, candles, upstream lifecycle),
//   - send command envelopes, which are handed upward on an mpsc channel
//     together with the sender's client id,
//   - receive the response to each command, addressed to them alone.
//
// Each session owns a bounded outbound queue. Broadcasts use `try_send`, so a
// client that stops reading loses frames instead of stalling the rest. The
// session task drains its queue into the socket and reads inbound frames in
// the same `select!` loop.
//
// `close()` flips a watch channel every session listens on, waits for the
// client registry to empty, then stops the listener.
// =============================================================================

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::downstream::auth::token_allows;
use crate::downstream::protocol::{self, CommandEnvelope, ErrorFrame, EventEnvelope, Inbound, Pong, ResponseEnvelope};
use crate::error::{CommandError, ServerError};
use crate::event_bus::{EventBus, GatewayEvent};
use crate::runtime_config::DownstreamConfig;

/// Commands waiting for the handler layer before client reads stall.
const COMMAND_QUEUE: usize = 1024;

/// Upper bound on how long `close()` waits for sessions and the listener.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A parsed command plus the client that sent it.
#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub client_id: Uuid,
    pub command: CommandEnvelope,
}

struct ClientHandle {
    tx: mpsc::Sender<String>,
    addr: SocketAddr,
    connected_at: DateTime<Utc>,
}

struct ServerInner {
    config: DownstreamConfig,
    bus: Arc<EventBus>,
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    commands: mpsc::Sender<InboundCommand>,
    dropped_frames: AtomicU64,
    shutdown: watch::Sender<bool>,
    drained: Notify,
    local_addr: Mutex<Option<SocketAddr>>,
    listener_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the downstream WebSocket server. Clones share one registry.
#[derive(Clone)]
pub struct DownstreamServer {
    inner: Arc<ServerInner>,
}

/// Summary of one connected client, for status output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: Uuid,
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

impl DownstreamServer {
    /// Build the server and the receiving end of its command channel.
    pub fn new(config: DownstreamConfig, bus: Arc<EventBus>) -> (Self, mpsc::Receiver<InboundCommand>) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let (shutdown, _) = watch::channel(false);
        let server = Self {
            inner: Arc::new(ServerInner {
                config,
                bus,
                clients: RwLock::new(HashMap::new()),
                commands,
                dropped_frames: AtomicU64::new(0),
                shutdown,
                drained: Notify::new(),
                local_addr: Mutex::new(None),
                listener_task: tokio::sync::Mutex::new(None),
            }),
        };
        (server, rx)
    }

    /// Bind the listener and start accepting clients. Returns the bound
    /// address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut task_slot = self.inner.listener_task.lock().await;
        if task_slot.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let addr = self.inner.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;

        self.inner.shutdown.send_replace(false);
        *self.inner.local_addr.lock() = Some(local);

        let app = router(self.inner.clone());
        let mut stop = self.inner.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                });
            if let Err(e) = serve.await {
                error!(error = %e, "downstream listener failed");
            }
        });
        *task_slot = Some(task);

        info!(addr = %local, "downstream server listening");
        Ok(local)
    }

    /// Stop accepting, close every session, and wait for them to finish.
    pub async fn close(&self) {
        let Some(task) = self.inner.listener_task.lock().await.take() else {
            return;
        };
        info!(clients = self.client_count(), "downstream server closing");
        self.inner.shutdown.send_replace(true);

        let drained = tokio::time::timeout(CLOSE_GRACE, async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.clients.read().is_empty() {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.client_count(), "downstream sessions did not close in time");
        }

        if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
            warn!("downstream listener did not stop in time");
        }
        *self.inner.local_addr.lock() = None;
        info!("downstream server closed");
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    /// Queue `message` for every connected client. Returns how many queues
    /// accepted it; clients whose queue is full miss this frame.
    pub fn broadcast<T: Serialize>(&self, message: &T) -> Result<usize, ServerError> {
        let text = serde_json::to_string(message)?;
        let clients: Vec<(Uuid, mpsc::Sender<String>)> = self
            .inner
            .clients
            .read()
            .iter()
            .map(|(id, c)| (*id, c.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in clients {
            match tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    debug!(client = %id, "client queue full, broadcast frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(delivered)
    }

    pub fn broadcast_event(&self, event: &GatewayEvent) -> Result<usize, ServerError> {
        self.broadcast(&EventEnvelope::from_event(event)?)
    }

    /// Queue `message` for one client.
    pub fn send_to<T: Serialize>(&self, client_id: Uuid, message: &T) -> Result<(), ServerError> {
        let text = serde_json::to_string(message)?;
        self.inner.send_text(client_id, text)
    }

    /// Send a response envelope to the client that issued `request_id`.
    pub fn respond_to_command(
        &self,
        client_id: Uuid,
        request_id: &str,
        success: bool,
        data: Option<Value>,
        error: Option<CommandError>,
    ) -> Result<(), ServerError> {
        self.send_to(client_id, &ResponseEnvelope::new(request_id, success, data, error))
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub fn client_ids(&self) -> Vec<Uuid> {
        self.inner.clients.read().keys().copied().collect()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.inner
            .clients
            .read()
            .iter()
            .map(|(id, c)| ClientInfo {
                id: *id,
                addr: c.addr,
                connected_at: c.connected_at,
            })
            .collect()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Frames dropped because a client's queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped_frames.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for DownstreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamServer")
            .field("local_addr", &self.local_addr())
            .field("clients", &self.client_count())
            .field("dropped_frames", &self.dropped_frames())
            .finish()
    }
}

impl ServerInner {
    fn send_text(&self, client_id: Uuid, text: String) -> Result<(), ServerError> {
        let tx = self
            .clients
            .read()
            .get(&client_id)
            .map(|c| c.tx.clone())
            .ok_or(ServerError::ClientNotFound(client_id))?;
        tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                ServerError::ClientBackpressure(client_id)
            }
            mpsc::error::TrySendError::Closed(_) => ServerError::ClientNotFound(client_id),
        })
    }

    fn reply<T: Serialize>(&self, client_id: Uuid, message: &T) {
        let sent = serde_json::to_string(message)
            .map_err(ServerError::from)
            .and_then(|text| self.send_text(client_id, text));
        if let Err(e) = sent {
            debug!(client = %client_id, error = %e, "reply not delivered");
        }
    }

    async fn handle_text(&self, client_id: Uuid, text: &str) {
        match protocol::classify(text) {
            Inbound::Command(command) => {
                debug!(client = %client_id, command = %command.command, request_id = %command.request_id, "command received");
                if self.commands.send(InboundCommand { client_id, command }).await.is_err() {
                    warn!(client = %client_id, "no command handler attached, command dropped");
                }
            }
            Inbound::Ping => self.reply(client_id, &Pong::now()),
            Inbound::Invalid(reason) => {
                debug!(client = %client_id, reason = %reason, "invalid command frame");
                self.reply(client_id, &ErrorFrame::new(ErrorFrame::INVALID_COMMAND, reason));
            }
            Inbound::Unparseable(reason) => {
                debug!(client = %client_id, reason = %reason, "unparseable client frame");
                self.reply(client_id, &ErrorFrame::new(ErrorFrame::PARSE_ERROR, format!("invalid JSON: {reason}")));
            }
        }
    }

    fn unregister(&self, client_id: Uuid) {
        let empty = {
            let mut clients = self.clients.write();
            clients.remove(&client_id);
            clients.is_empty()
        };
        if empty {
            self.drained.notify_waiters();
        }
    }
}

// =============================================================================
// HTTP surface
// =============================================================================

fn router(inner: Arc<ServerInner>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .with_state(inner)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    clients: usize,
    server_time: i64,
}

async fn health(State(inner): State<Arc<ServerInner>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        clients: inner.clients.read().len(),
        server_time: Utc::now().timestamp_millis(),
    })
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(inner): State<Arc<ServerInner>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
) -> Response {
    if !token_allows(inner.config.auth_token.as_deref(), query.token.as_deref()) {
        warn!(peer = %addr, "WebSocket connection rejected: invalid token");
        return (StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }
    if *inner.shutdown.borrow() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Server shutting down").into_response();
    }

    ws.on_upgrade(move |socket| session(socket, inner, addr))
        .into_response()
}

// =============================================================================
// Session
// =============================================================================

async fn session(socket: WebSocket, inner: Arc<ServerInner>, addr: SocketAddr) {
    let client_id = Uuid::new_v4();
    let (tx, mut outbound) = mpsc::channel::<String>(inner.config.client_buffer.max(1));
    inner.clients.write().insert(
        client_id,
        ClientHandle {
            tx,
            addr,
            connected_at: Utc::now(),
        },
    );
    info!(client = %client_id, peer = %addr, "client connected");
    inner.bus.publish(&GatewayEvent::ClientConnected { client_id });

    let (mut sender, mut receiver) = socket.split();
    let mut stop = inner.shutdown.subscribe();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(text) = frame else { break };
                if let Err(e) = sender.send(Message::Text(text)).await {
                    debug!(client = %client_id, error = %e, "send failed, closing session");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => inner.handle_text(client_id, &text).await,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        inner.reply(client_id, &ErrorFrame::new(ErrorFrame::PARSE_ERROR, "binary frames are not supported"));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client = %client_id, "client closed the connection");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %client_id, error = %e, "WebSocket receive error, disconnecting");
                        break;
                    }
                }
            }

            _ = async { stop.wait_for(|stopping| *stopping).await.map(|_| ()) } => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "server shutting down".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    inner.unregister(client_id);
    info!(client = %client_id, "client disconnected");
    inner.bus.publish(&GatewayEvent::ClientDisconnected { client_id });
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::names;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type ClientWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    fn config(auth_token: Option<&str>) -> DownstreamConfig {
        DownstreamConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            client_buffer: 16,
            auth_token: auth_token.map(str::to_string),
        }
    }

    struct Harness {
        server: DownstreamServer,
        commands: mpsc::Receiver<InboundCommand>,
        connected: mpsc::UnboundedReceiver<Uuid>,
        addr: SocketAddr,
        bus: Arc<EventBus>,
    }

    async fn harness(auth_token: Option<&str>) -> Harness {
        let bus = Arc::new(EventBus::new());
        let (tx, connected) = mpsc::unbounded_channel();
        bus.on(names::CLIENT_CONNECTED, move |e| {
            if let GatewayEvent::ClientConnected { client_id } = e {
                let _ = tx.send(*client_id);
            }
        });
        let (server, commands) = DownstreamServer::new(config(auth_token), bus.clone());
        let addr = server.start().await.unwrap();
        Harness {
            server,
            commands,
            connected,
            addr,
            bus,
        }
    }

    impl Harness {
        async fn client(&mut self) -> (ClientWs, Uuid) {
            let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
                .await
                .unwrap();
            let id = self.connected.recv().await.unwrap();
            (ws, id)
        }
    }

    async fn next_json(ws: &mut ClientWs) -> Value {
        let next = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(t))) => return serde_json::from_str::<Value>(&t).unwrap(),
                    Some(Ok(_)) => continue,
                    other => panic!("client stream ended: {other:?}"),
                }
            }
        });
        next.await.unwrap()
    }

    async fn assert_silent(ws: &mut ClientWs) {
        let quiet = tokio::time::timeout(Duration::from_millis(100), ws.next()).await;
        assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
    }

    #[tokio::test]
    async fn broadcast_reaches_all_and_response_reaches_one() {
        let mut h = harness(None).await;
        let (mut a, id_a) = h.client().await;
        let (mut b, _id_b) = h.client().await;
        assert_eq!(h.server.client_count(), 2);

        let tick = json!({ "type": "tick", "data": { "asset": "R_100", "price": 10.0 } });
        assert_eq!(h.server.broadcast(&tick).unwrap(), 2);
        assert_eq!(next_json(&mut a).await, tick);
        assert_eq!(next_json(&mut b).await, tick);

        h.server
            .respond_to_command(id_a, "req-1", true, Some(json!({ "ok": 1 })), None)
            .unwrap();
        let resp = next_json(&mut a).await;
        assert_eq!(resp["type"], "response");
        assert_eq!(resp["requestId"], "req-1");
        assert_eq!(resp["success"], true);
        assert_silent(&mut b).await;

        h.server.close().await;
    }

    #[tokio::test]
    async fn commands_are_handed_up_with_sender_id() {
        let mut h = harness(None).await;
        let (mut a, id_a) = h.client().await;

        let cmd = json!({ "type": "command", "command": "status", "requestId": "r-9", "timestamp": 1 });
        a.send(WsMessage::Text(cmd.to_string())).await.unwrap();

        let inbound = h.commands.recv().await.unwrap();
        assert_eq!(inbound.client_id, id_a);
        assert_eq!(inbound.command.command, "status");
        assert_eq!(inbound.command.request_id, "r-9");

        h.server.close().await;
    }

    #[tokio::test]
    async fn bad_frames_are_answered_to_sender_only() {
        let mut h = harness(None).await;
        let (mut a, _) = h.client().await;
        let (mut b, _) = h.client().await;

        a.send(WsMessage::Text("{not json".to_string())).await.unwrap();
        let err = next_json(&mut a).await;
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "PARSE_ERROR");

        a.send(WsMessage::Text(json!({ "type": "command" }).to_string())).await.unwrap();
        assert_eq!(next_json(&mut a).await["code"], "INVALID_COMMAND");

        assert_silent(&mut b).await;
        assert!(h.commands.try_recv().is_err());
        h.server.close().await;
    }

    #[tokio::test]
    async fn application_ping_gets_pong() {
        let mut h = harness(None).await;
        let (mut a, _) = h.client().await;

        a.send(WsMessage::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
        let pong = next_json(&mut a).await;
        assert_eq!(pong["type"], "pong");
        assert!(pong["timestamp"].as_i64().unwrap() > 0);
        h.server.close().await;
    }

    #[tokio::test]
    async fn token_is_required_when_configured() {
        let mut h = harness(Some("s3cret")).await;

        let rejected = tokio_tungstenite::connect_async(format!("ws://{}/ws?token=wrong", h.addr)).await;
        match rejected {
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status(), 403),
            other => panic!("expected 403, got {other:?}"),
        }
        assert!(tokio_tungstenite::connect_async(format!("ws://{}/ws", h.addr)).await.is_err());

        let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?token=s3cret", h.addr))
            .await
            .unwrap();
        h.connected.recv().await.unwrap();
        assert_eq!(h.server.client_count(), 1);
        h.server.close().await;
    }

    #[tokio::test]
    async fn client_disconnect_is_published() {
        let mut h = harness(None).await;
        let (tx, mut gone) = mpsc::unbounded_channel();
        h.bus.on(names::CLIENT_DISCONNECTED, move |e| {
            let _ = tx.send(e.clone());
        });

        let (mut a, id_a) = h.client().await;
        a.close(None).await.unwrap();
        assert_eq!(
            gone.recv().await,
            Some(GatewayEvent::ClientDisconnected { client_id: id_a })
        );
        assert_eq!(h.server.client_count(), 0);
        assert!(matches!(
            h.server.send_to(id_a, &json!({})),
            Err(ServerError::ClientNotFound(_))
        ));
        h.server.close().await;
    }

    #[tokio::test]
    async fn close_terminates_every_session() {
        let mut h = harness(None).await;
        let (mut a, _) = h.client().await;
        let (mut b, _) = h.client().await;

        h.server.close().await;
        assert_eq!(h.server.client_count(), 0);
        assert!(h.server.local_addr().is_none());

        for ws in [&mut a, &mut b] {
            let end = tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    match ws.next().await {
                        Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                        Some(Ok(_)) => continue,
                    }
                }
            })
            .await;
            assert!(end.is_ok());
        }
        assert!(tokio_tungstenite::connect_async(format!("ws://{}/ws", h.addr)).await.is_err());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let h = harness(None).await;
        assert!(matches!(h.server.start().await, Err(ServerError::AlreadyRunning)));
        h.server.close().await;
    }

    #[tokio::test]
    async fn full_client_queue_drops_frames_for_that_client_only() {
        let h = harness(None).await;
        let (stalled, _keep_open) = mpsc::channel::<String>(1);
        let stalled_id = Uuid::new_v4();
        h.server.inner.clients.write().insert(
            stalled_id,
            ClientHandle {
                tx: stalled,
                addr: h.addr,
                connected_at: Utc::now(),
            },
        );

        assert_eq!(h.server.broadcast(&json!({ "n": 1 })).unwrap(), 1);
        assert_eq!(h.server.broadcast(&json!({ "n": 2 })).unwrap(), 0);
        assert_eq!(h.server.dropped_frames(), 1);
        assert!(matches!(
            h.server.send_to(stalled_id, &json!({ "n": 3 })),
            Err(ServerError::ClientBackpressure(_))
        ));

        h.server.inner.unregister(stalled_id);
        h.server.close().await;
    }

    #[tokio::test]
    async fn health_reports_client_count() {
        let mut h = harness(None).await;
        let (_a, _) = h.client().await;

        let mut stream = tokio::net::TcpStream::connect(h.addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains(r#""status":"ok""#));
        assert!(body.contains(r#""clients":1"#));

        h.server.close().await;
    }
}
