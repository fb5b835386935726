use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reserved topic for connection-level keepalive frames.
pub const PHOENIX_TOPIC: &str = "phoenix";
/// Channel join request event.
pub const EVENT_JOIN: &str = "phx_join";
/// Server reply event, correlated by ref.
pub const EVENT_REPLY: &str = "phx_reply";
/// Keepalive event sent on the reserved topic.
pub const EVENT_HEARTBEAT: &str = "heartbeat";

/// Frame sent from the client to the realtime service.
///
/// Every outbound frame carries all four fields; `ref` is the correlation
/// token echoed back in the matching `phx_reply`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundFrame {
    pub topic: String,
    pub event: String,
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: String,
}

impl OutboundFrame {
    /// Builds a channel join request for `topic`.
    pub fn join(topic: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            event: EVENT_JOIN.to_string(),
            payload: json!({}),
            reference: reference.into(),
        }
    }

    /// Builds a keepalive frame on the reserved topic.
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: reference.into(),
        }
    }

    /// Builds an application push on a joined topic.
    pub fn push(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: reference.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Frame received from the realtime service.
///
/// Inbound decoding is tolerant: any field may be absent, and routing
/// decides what to do with partial frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundFrame {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReplyPayload {
    /// Reply status; `"ok"` resolves the request, anything else rejects it.
    #[serde(default)]
    pub status: String,
    /// Server response body.
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    /// Decodes a reply payload, surfacing the raw value as `response` when
    /// it does not match the expected `{status, response}` shape.
    pub fn from_value(value: Value) -> Self {
        let has_status = value
            .get("status")
            .map(Value::is_string)
            .unwrap_or(false);
        if !has_status {
            return Self {
                status: String::new(),
                response: value,
            };
        }
        match serde_json::from_value(value.clone()) {
            Ok(reply) => reply,
            Err(_) => Self {
                status: String::new(),
                response: value,
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}
