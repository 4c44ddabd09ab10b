//! Browser-facing wire protocol.
//!
//! Client to node: binary frames are raw keystrokes; text frames are JSON
//! (`{"data": ".."}`, `{"resize": [cols, rows]}` or
//! `{"resize": {"rows": r, "cols": c}}`). Text that is not JSON is taken as
//! input. Node to client: binary frames carry shell output and text frames
//! carry [`StatusFrame`]s.

use poem::web::websocket::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{CloseReason, TermSize};
use crate::error::{ConnectError, TokenError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Input(Vec<u8>),
    Resize(TermSize),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusFrame {
    Opening {
        session_id: String,
        target: String,
    },
    Active {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    Closed {
        session_id: String,
        reason: CloseReason,
    },
    Error {
        error: String,
        reason: String,
        message: String,
    },
}

impl StatusFrame {
    pub fn channel_unavailable(err: &ConnectError) -> Self {
        StatusFrame::Error {
            error: CloseReason::ChannelUnavailable.as_str().to_string(),
            reason: err.reason().to_string(),
            message: err.to_string(),
        }
    }

    /// The token was spent between the upgrade request and the upgrade.
    pub fn token_rejected(err: &TokenError) -> Self {
        StatusFrame::Error {
            error: "token_rejected".to_string(),
            reason: err.reason().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Output(Vec<u8>),
    Status(StatusFrame),
}

impl ServerEvent {
    pub fn into_message(self) -> Message {
        match self {
            ServerEvent::Output(bytes) => Message::Binary(bytes),
            ServerEvent::Status(frame) => match serde_json::to_string(&frame) {
                Ok(json) => Message::Text(json),
                Err(_) => Message::Text("{\"status\":\"error\"}".to_string()),
            },
        }
    }
}

/// Decode one WebSocket message. Frames carrying nothing usable decode to no events.
pub fn parse_client_message(message: Message) -> Vec<ClientEvent> {
    match message {
        Message::Binary(bytes) if bytes.is_empty() => Vec::new(),
        Message::Binary(bytes) => vec![ClientEvent::Input(bytes)],
        Message::Text(text) => parse_text(&text),
        Message::Close(_) => vec![ClientEvent::Close],
        Message::Ping(_) | Message::Pong(_) => Vec::new(),
    }
}

fn parse_text(text: &str) -> Vec<ClientEvent> {
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(text) else {
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![ClientEvent::Input(text.as_bytes().to_vec())]
        };
    };

    let mut events = Vec::new();
    if let Some(Value::String(data)) = object.get("data")
        && !data.is_empty()
    {
        events.push(ClientEvent::Input(data.as_bytes().to_vec()));
    }
    if let Some(size) = object.get("resize").and_then(parse_resize) {
        events.push(ClientEvent::Resize(size));
    }
    events
}

fn parse_resize(value: &Value) -> Option<TermSize> {
    let dimension = |v: &Value| v.as_u64().map(|n| n.min(u16::MAX as u64) as u16);
    match value {
        Value::Array(items) if items.len() >= 2 => {
            Some(TermSize::new(dimension(&items[1])?, dimension(&items[0])?))
        }
        Value::Object(map) => Some(TermSize::new(
            dimension(map.get("rows")?)?,
            dimension(map.get("cols")?)?,
        )),
        _ => None,
    }
}
