//! Gateway wire envelopes
//!
//! Every message is a JSON object tagged by `type`. Requests and responses
//! are correlated by a string `id`; events carry a name and a payload.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::GatewayConfig;

/// Name of the server-push event that opens the handshake
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// A single envelope on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client -> Gateway: method call
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Gateway -> Client: answer to a request
    Res {
        id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    /// Gateway -> Client: server push
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl Frame {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Frame::Req {
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one line; unknown envelope types yield `None`
    pub fn decode(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Human-readable text for a remote `error` field
pub fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string()),
        Value::Null => "unknown error".into(),
        other => other.to_string(),
    }
}

/// Parameters of the `connect` request
pub fn connect_params(config: &GatewayConfig) -> Value {
    let mut params = json!({
        "minProtocol": config.min_protocol,
        "maxProtocol": config.max_protocol,
        "client": {
            "id": config.client_id,
            "version": config.client_version,
            "platform": config.platform,
            "mode": config.mode,
        },
        "caps": [],
        "locale": config.locale,
        "userAgent": config.user_agent,
    });
    if let Some(token) = &config.auth_token {
        params["auth"] = json!({ "token": token });
    }
    params
}

/// Which historical acknowledgement dialect the gateway answered with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckShape {
    /// `{type: "res", ok: true}`
    Response,
    /// `{type: "connected"}`
    Connected,
    /// `{type: "welcome"}`
    Welcome,
    /// Any envelope with a truthy `ok` or `success`, at top level or in `payload`
    Flag,
}

/// Decoded reply to the `connect` request
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeReply {
    Accepted(AckShape),
    Rejected(String),
}

impl HandshakeReply {
    /// Compatibility shim over the acknowledgement shapes the gateway has
    /// used across protocol revisions. One arm per shape.
    pub fn decode(reply: &Value) -> Self {
        let kind = reply.get("type").and_then(Value::as_str);
        match kind {
            Some("res") if truthy(reply.get("ok")) => HandshakeReply::Accepted(AckShape::Response),
            Some("connected") => HandshakeReply::Accepted(AckShape::Connected),
            Some("welcome") => HandshakeReply::Accepted(AckShape::Welcome),
            _ if has_success_flag(reply) || reply.get("payload").is_some_and(has_success_flag) => {
                HandshakeReply::Accepted(AckShape::Flag)
            }
            _ => HandshakeReply::Rejected(match reply.get("error") {
                Some(error) if !error.is_null() => error_text(error),
                _ => reply.to_string(),
            }),
        }
    }
}

fn has_success_flag(value: &Value) -> bool {
    truthy(value.get("ok")) || truthy(value.get("success"))
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(Value::Null) | None => false,
    }
}
