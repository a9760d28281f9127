//! Frame transports for the gateway link
//!
//! A [`Connector`] opens a duplex connection and hands back its two halves:
//! a [`FrameSink`] owned by the link's send path and a [`FrameStream`] owned
//! by the receive loop.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::ProbeError;

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), ProbeError>;

    /// Close the connection; errors are swallowed
    async fn close(&mut self);
}

/// Read half of a connection
#[async_trait]
pub trait FrameStream: Send {
    /// Next inbound frame; `None` once the remote side has closed
    async fn recv(&mut self) -> Option<Result<String, ProbeError>>;
}

/// Opens connections to a gateway endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str)
        -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ProbeError>;
}

// === WebSocket ===

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector over `tokio-tungstenite`
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    origin: Option<String>,
}

impl WsConnector {
    pub fn new(origin: Option<String>) -> Self {
        Self { origin }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ProbeError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ProbeError::Connection(format!("invalid gateway url: {e}")))?;
        if let Some(origin) = &self.origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| ProbeError::Connection(format!("invalid origin header: {e}")))?;
            request.headers_mut().insert("Origin", value);
        }

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProbeError::Connection(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket upgrade complete");

        let (write, read) = ws.split();
        Ok((Box::new(WsSink { write }), Box::new(WsFrames { read })))
    }
}

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), ProbeError> {
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.close().await;
    }
}

struct WsFrames {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn recv(&mut self) -> Option<Result<String, ProbeError>> {
        loop {
            match self.read.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|e| ProbeError::Transport(format!("non-utf8 frame: {e}"))),
                    )
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None
                }
                Err(e) => return Some(Err(ProbeError::Transport(e.to_string()))),
            }
        }
    }
}

// === In-memory ===

/// Gateway side of an in-memory connection
pub struct GatewayEnd {
    /// Frames written by the client
    pub inbound: mpsc::UnboundedReceiver<String>,
    /// Frames delivered to the client; drop to close the connection
    pub outbound: mpsc::UnboundedSender<String>,
}

impl GatewayEnd {
    /// Push a JSON value to the client
    pub fn push(&self, value: serde_json::Value) -> bool {
        self.outbound.send(value.to_string()).is_ok()
    }

    /// Next client frame parsed as JSON
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        let frame = self.inbound.recv().await?;
        serde_json::from_str(&frame).ok()
    }
}

/// Single-use connector backed by unbounded channels
pub struct MemoryConnector {
    halves: Mutex<Option<(MemorySink, MemoryFrames)>>,
    opened_url: Arc<Mutex<Option<String>>>,
}

impl MemoryConnector {
    /// Create a connector and the gateway end that drives it
    pub fn new() -> (Self, GatewayEnd) {
        let (client_tx, gateway_rx) = mpsc::unbounded_channel();
        let (gateway_tx, client_rx) = mpsc::unbounded_channel();

        let connector = Self {
            halves: Mutex::new(Some((
                MemorySink { tx: Some(client_tx) },
                MemoryFrames { rx: client_rx },
            ))),
            opened_url: Arc::new(Mutex::new(None)),
        };
        let end = GatewayEnd {
            inbound: gateway_rx,
            outbound: gateway_tx,
        };
        (connector, end)
    }

    /// URL passed to the last `open`
    pub fn opened_url(&self) -> Option<String> {
        self.opened_url.lock().clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), ProbeError> {
        *self.opened_url.lock() = Some(url.to_owned());
        let (sink, frames) = self
            .halves
            .lock()
            .take()
            .ok_or_else(|| ProbeError::Connection("memory transport already used".into()))?;
        Ok((Box::new(sink), Box::new(frames)))
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), ProbeError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ProbeError::Transport("connection closed".into()))?;
        tx.send(frame)
            .map_err(|_| ProbeError::Transport("gateway end dropped".into()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct MemoryFrames {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for MemoryFrames {
    async fn recv(&mut self) -> Option<Result<String, ProbeError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let (connector, mut end) = MemoryConnector::new();
        let (mut sink, mut frames) = connector.open("mem://gw?token=t").await.unwrap();
        assert_eq!(connector.opened_url().as_deref(), Some("mem://gw?token=t"));

        sink.send(r#"{"type":"req"}"#.into()).await.unwrap();
        assert_eq!(end.next_json().await, Some(json!({"type": "req"})));

        assert!(end.push(json!({"type": "event", "event": "tick"})));
        let frame = frames.recv().await.unwrap().unwrap();
        assert!(frame.contains("tick"));
    }

    #[tokio::test]
    async fn test_memory_connector_is_single_use() {
        let (connector, _end) = MemoryConnector::new();
        assert!(connector.open("mem://a").await.is_ok());
        let err = connector.open("mem://a").await.err().unwrap();
        assert!(matches!(err, ProbeError::Connection(_)));
    }

    #[tokio::test]
    async fn test_dropping_gateway_end_closes_stream() {
        let (connector, end) = MemoryConnector::new();
        let (mut sink, mut frames) = connector.open("mem://a").await.unwrap();
        drop(end);
        assert!(frames.recv().await.is_none());
        assert!(sink.send("x".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_writes() {
        let (connector, mut end) = MemoryConnector::new();
        let (mut sink, _frames) = connector.open("mem://a").await.unwrap();
        sink.close().await;
        assert!(sink.send("x".into()).await.is_err());
        assert!(end.inbound.recv().await.is_none());
    }
}
