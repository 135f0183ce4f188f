//! Pusher wire protocol: event names, JSON envelope encode/decode, and URL construction.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::Error;
use crate::types::ClientConfig;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

pub mod event {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const UNSUBSCRIBE: &str = "pusher:unsubscribe";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
}

pub const PROTOCOL_VERSION: &str = "7";
pub const CLIENT_NAME: &str = "pusher-client-rs";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// One JSON text frame: `{"event": .., "channel": .., "data": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, channel: Option<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            channel,
            data,
        }
    }

    /// Whether this event is consumed by the connection itself and never
    /// forwarded to listeners.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self.event.as_str(),
            event::CONNECTION_ESTABLISHED | event::PING | event::PONG
        )
    }

    /// The payload with one layer of string-encoded JSON removed.
    ///
    /// Servers usually send `data` as a JSON document serialized into a
    /// string. Strings that do not hold an object or array are returned as-is.
    pub fn payload(&self) -> Value {
        decode_data(&self.data)
    }
}

fn decode_data(data: &Value) -> Value {
    let Value::String(s) = data else {
        return data.clone();
    };
    match serde_json::from_str::<Value>(s) {
        Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
        _ => data.clone(),
    }
}

pub fn encode(envelope: &Envelope) -> Result<String, Error> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn decode(text: &str) -> Result<Envelope, Error> {
    serde_json::from_str(text).map_err(|e| Error::Protocol(format!("malformed envelope: {e}")))
}

/// Extract `socket_id` from a `connection_established` payload.
pub fn parse_socket_id(envelope: &Envelope) -> Result<String, Error> {
    envelope
        .payload()
        .get("socket_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol("connection_established without socket_id".to_string()))
}

/// `(code, message)` of a `pusher:error` event, when present.
pub fn parse_error(envelope: &Envelope) -> (Option<i64>, Option<String>) {
    let payload = envelope.payload();
    let code = payload.get("code").and_then(Value::as_i64);
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);
    (code, message)
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

/// Credentials attached to a subscribe request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeCredentials {
    pub auth: Option<String>,
    pub user_id: Option<i64>,
}

pub fn build_subscribe_msg(channel: &str, credentials: &SubscribeCredentials) -> Envelope {
    let mut data = Map::new();
    if let Some(auth) = &credentials.auth {
        data.insert("auth".to_string(), Value::String(auth.clone()));
        if let Some(user_id) = credentials.user_id {
            data.insert("channel_data".to_string(), json!({ "user_id": user_id }));
        }
    }
    Envelope::new(
        event::SUBSCRIBE,
        Some(channel.to_string()),
        Value::Object(data),
    )
}

pub fn build_unsubscribe_msg(channel: &str) -> Envelope {
    Envelope::new(event::UNSUBSCRIBE, Some(channel.to_string()), json!({}))
}

pub fn build_ping_msg() -> Envelope {
    Envelope::new(event::PING, None, json!({}))
}

pub fn build_pong_msg() -> Envelope {
    Envelope::new(event::PONG, None, json!({}))
}

// ---------------------------------------------------------------------------
// WebSocket URL construction
// ---------------------------------------------------------------------------

pub fn build_ws_url(config: &ClientConfig) -> Result<String, Error> {
    let mut u = url::Url::parse(&format!(
        "{}://{}:{}/",
        config.scheme(),
        config.host(),
        config.port()
    ))?;
    u.path_segments_mut()
        .map_err(|()| Error::Config("host cannot be used as a base URL".to_string()))?
        .clear()
        .extend(["app", config.app_key.as_str()]);
    {
        let mut q = u.query_pairs_mut();
        q.append_pair("client", CLIENT_NAME);
        q.append_pair("version", CLIENT_VERSION);
        q.append_pair("protocol", PROTOCOL_VERSION);
    }
    Ok(u.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
