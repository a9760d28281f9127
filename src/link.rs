//! Persistent gateway connection
//!
//! One [`GatewayLink`] owns one duplex connection. Any number of tasks may
//! issue [`GatewayLink::request`] concurrently; a background receive loop
//! matches each `res` frame to its caller by request id and forwards `event`
//! frames to the [`EventRouter`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::ProbeError;
use crate::protocol::{connect_params, error_text, Frame, HandshakeReply, CHALLENGE_EVENT};
use crate::router::EventRouter;
use crate::transport::{Connector, FrameSink, FrameStream};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Handshaking,
    Ready,
}

/// A request awaiting its response
struct PendingRequest {
    method: String,
    created: Instant,
    slot: oneshot::Sender<Result<Value, ProbeError>>,
}

/// Outstanding requests by id
#[derive(Default)]
struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

impl PendingTable {
    fn insert(&self, id: String, request: PendingRequest) {
        self.entries.lock().insert(id, request);
    }

    fn remove(&self, id: &str) -> Option<PendingRequest> {
        self.entries.lock().remove(id)
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Remove every entry; dropping the slots fails their callers
    fn drain(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        drained.len()
    }
}

/// Removes a pending entry when the awaiting future finishes or is dropped
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

/// Client side of the gateway RPC protocol
pub struct GatewayLink {
    config: GatewayConfig,
    connector: Arc<dyn Connector>,
    state: Arc<RwLock<LinkState>>,
    /// Never reset, so ids are not recycled across reconnects
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    router: Arc<EventRouter>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayLink {
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            state: Arc::new(RwLock::new(LinkState::Disconnected)),
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingTable::default()),
            router: Arc::new(EventRouter::new()),
            writer: tokio::sync::Mutex::new(None),
            receive_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LinkState::Ready
    }

    /// Event registry fed by the receive loop
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Endpoint with the auth token appended as a query parameter
    pub fn endpoint(&self) -> Result<String, ProbeError> {
        let mut url = url::Url::parse(&self.config.url)
            .map_err(|e| ProbeError::Connection(format!("invalid gateway url: {e}")))?;
        if let Some(token) = &self.config.auth_token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }

    /// Open the transport, perform the handshake and start the receive loop
    #[instrument(skip(self), fields(url = %self.config.url))]
    pub async fn connect(&self) -> Result<(), ProbeError> {
        {
            let mut state = self.state.write();
            if *state != LinkState::Disconnected {
                debug!(state = ?*state, "Connect called on a live link");
                return Ok(());
            }
            *state = LinkState::Handshaking;
        }

        match self.open_and_handshake().await {
            Ok((sink, stream)) => {
                *self.writer.lock().await = Some(sink);
                *self.state.write() = LinkState::Ready;
                let task = tokio::spawn(receive_loop(
                    stream,
                    Arc::clone(&self.pending),
                    Arc::clone(&self.router),
                    Arc::clone(&self.state),
                ));
                *self.receive_task.lock() = Some(task);
                info!("Connected to gateway");
                Ok(())
            }
            Err(reason) => {
                *self.state.write() = LinkState::Disconnected;
                warn!(%reason, "Gateway handshake failed");
                Err(ProbeError::Connection(format!(
                    "failed to connect to gateway: {reason}"
                )))
            }
        }
    }

    async fn open_and_handshake(
        &self,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), String> {
        let endpoint = self.endpoint().map_err(|e| e.to_string())?;
        let (mut sink, mut stream) = self
            .connector
            .open(&endpoint)
            .await
            .map_err(|e| e.to_string())?;

        match self.handshake(sink.as_mut(), stream.as_mut()).await {
            Ok(()) => Ok((sink, stream)),
            Err(reason) => {
                sink.close().await;
                Err(reason)
            }
        }
    }

    async fn handshake(
        &self,
        sink: &mut dyn FrameSink,
        stream: &mut dyn FrameStream,
    ) -> Result<(), String> {
        // The gateway usually opens with a challenge; tolerate its absence.
        match tokio::time::timeout(self.config.challenge_timeout(), stream.recv()).await {
            Ok(Some(Ok(text))) => match Frame::decode(text.trim()) {
                Some(Frame::Event { event, payload }) if event == CHALLENGE_EVENT => {
                    debug!(nonce = ?payload.get("nonce"), "Received connect challenge");
                }
                _ => debug!(frame = %text, "Ignoring unexpected first frame"),
            },
            Ok(Some(Err(e))) => return Err(e.to_string()),
            Ok(None) => return Err("connection closed before handshake".into()),
            Err(_) => debug!("No challenge received, continuing"),
        }

        let id = self.allocate_id();
        let frame = Frame::request(&id, "connect", connect_params(&self.config))
            .encode()
            .map_err(|e| e.to_string())?;
        sink.send(frame).await.map_err(|e| e.to_string())?;

        let deadline = tokio::time::Instant::now() + self.config.handshake_timeout();
        loop {
            let text = match tokio::time::timeout_at(deadline, stream.recv()).await {
                Ok(Some(Ok(text))) => text,
                Ok(Some(Err(e))) => return Err(e.to_string()),
                Ok(None) => return Err("connection closed during handshake".into()),
                Err(_) => return Err("timed out waiting for handshake reply".into()),
            };
            let reply: Value = serde_json::from_str(text.trim())
                .map_err(|e| format!("malformed handshake reply: {e}"))?;
            if reply.get("type").and_then(Value::as_str) == Some("event") {
                trace!(frame = %text, "Skipping event during handshake");
                continue;
            }
            return match HandshakeReply::decode(&reply) {
                HandshakeReply::Accepted(shape) => {
                    debug!(?shape, "Handshake accepted");
                    Ok(())
                }
                HandshakeReply::Rejected(reason) => Err(format!("gateway refused: {reason}")),
            };
        }
    }

    /// Stop the receive loop, close the transport and fail every outstanding
    /// call. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        *self.state.write() = LinkState::Disconnected;

        let task = self.receive_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            sink.close().await;
        }

        let failed = self.pending.drain();
        self.router.clear();
        if failed > 0 {
            info!(failed, "Disconnected with requests outstanding");
        } else {
            debug!("Disconnected");
        }
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn send_frame(&self, frame: String) -> Result<(), ProbeError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ProbeError::NotConnected)?;
        sink.send(frame).await
    }

    /// Send `method` and wait up to `timeout` for its response
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ProbeError> {
        if !self.is_ready() {
            return Err(ProbeError::NotConnected);
        }

        let id = self.allocate_id();
        let (slot, result) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_owned(),
                created: Instant::now(),
                slot,
            },
        );
        let _guard = PendingGuard {
            table: &self.pending,
            id: id.clone(),
        };

        let frame = Frame::request(&id, method, params).encode()?;
        self.send_frame(frame).await?;
        trace!(id, method, "Request sent");

        match tokio::time::timeout(timeout, result).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProbeError::Closed {
                method: method.to_owned(),
            }),
            Err(_) => {
                debug!(id, method, "Request timed out");
                Err(ProbeError::Timeout {
                    method: method.to_owned(),
                    after: timeout,
                })
            }
        }
    }

    /// `request` with the configured default timeout
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ProbeError> {
        self.request(method, params, self.config.request_timeout()).await
    }

    pub async fn health(&self) -> Result<Value, ProbeError> {
        self.call("health", json!({})).await
    }

    pub async fn status(&self) -> Result<Value, ProbeError> {
        self.call("status", json!({})).await
    }

    pub async fn list_sessions(&self) -> Result<Value, ProbeError> {
        self.call("sessions_list", json!({})).await
    }

    /// Post a message into an existing session without awaiting a run
    pub async fn send_message(&self, session_id: &str, message: &str) -> Result<Value, ProbeError> {
        self.call(
            "sessions_send",
            json!({
                "sessionId": session_id,
                "message": message,
                "idempotencyKey": Uuid::new_v4().simple().to_string(),
            }),
        )
        .await
    }

    /// Run a command on a gateway node
    pub async fn invoke_node(&self, command: &str, params: Option<Value>) -> Result<Value, ProbeError> {
        self.call(
            "node.invoke",
            json!({ "command": command, "params": params.unwrap_or_else(|| json!({})) }),
        )
        .await
    }
}

/// Reads frames until the transport closes. Remaining pending requests are
/// left in place; their callers time out.
async fn receive_loop(
    mut stream: Box<dyn FrameStream>,
    pending: Arc<PendingTable>,
    router: Arc<EventRouter>,
    state: Arc<RwLock<LinkState>>,
) {
    while let Some(frame) = stream.recv().await {
        match frame {
            Ok(text) => {
                for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    route_frame(line, &pending, &router);
                }
            }
            Err(e) => {
                warn!(error = %e, "Gateway transport error");
                break;
            }
        }
    }

    *state.write() = LinkState::Disconnected;
    info!(outstanding = pending.len(), "Gateway connection closed");
}

fn route_frame(line: &str, pending: &PendingTable, router: &EventRouter) {
    match Frame::decode(line) {
        Some(Frame::Res {
            id,
            ok,
            payload,
            error,
        }) => {
            let Some(request) = pending.remove(&id) else {
                debug!(id, "Dropping response with no pending request");
                return;
            };
            trace!(
                id,
                method = %request.method,
                elapsed_ms = request.created.elapsed().as_millis() as u64,
                "Response received"
            );
            let outcome = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                Err(ProbeError::Remote {
                    method: request.method,
                    message: error_text(&error.unwrap_or(Value::Null)),
                })
            };
            let _ = request.slot.send(outcome);
        }
        Some(Frame::Event { event, payload }) => {
            router.dispatch(&event, &payload);
        }
        Some(Frame::Req { method, .. }) => {
            debug!(method, "Ignoring request frame from gateway");
        }
        None => debug!(frame = line, "Ignoring undecodable frame"),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::{GatewayEnd, MemoryConnector};

    pub(crate) fn test_config() -> GatewayConfig {
        GatewayConfig {
            url: "ws://127.0.0.1:18789".into(),
            auth_token: Some("s3cret".into()),
            challenge_timeout_ms: 50,
            handshake_timeout_secs: 2,
            ..Default::default()
        }
    }

    /// Plays the gateway side of the handshake
    pub(crate) async fn accept_handshake(end: &mut GatewayEnd) -> Value {
        end.push(json!({"type": "event", "event": CHALLENGE_EVENT, "payload": {"nonce": "n1", "ts": 1}}));
        let connect = end.next_json().await.expect("connect frame");
        end.push(json!({"type": "res", "id": connect["id"], "ok": true, "payload": {}}));
        connect
    }

    pub(crate) async fn connected_link() -> (Arc<GatewayLink>, GatewayEnd) {
        let (connector, mut end) = MemoryConnector::new();
        let link = Arc::new(GatewayLink::new(test_config(), Arc::new(connector)));
        let (connected, _) = tokio::join!(link.connect(), accept_handshake(&mut end));
        connected.expect("handshake succeeds");
        (link, end)
    }
}
