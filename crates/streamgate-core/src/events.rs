//! Event-stream wire encoding.
//!
//! Every event travels as one Server-Sent-Event frame: the literal text
//! `data: `, the JSON serialization of the event, then a blank line.
//!
//! ```text
//! data: {"event":"start","data":{"conversation_id":"...","request_id":"..."}}
//!
//! data: {"event":"token","data":{"id":0,"token":"Hello"}}
//!
//! data: {"event":"end","data":{"referenced_documents":[]},"available_quotas":{}}
//!
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StreamError};

/// Media type of the encoded stream.
pub const EVENT_STREAM_MEDIA_TYPE: &str = "text/event-stream";

const FRAME_PREFIX: &str = "data: ";
const FRAME_TERMINATOR: &str = "\n\n";

/// A document the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedDocument {
    pub doc_url: String,
    pub doc_title: String,
}

/// Response metadata carried by the `end` event.
///
/// Values are supplied by collaborators. Anything they did not provide is
/// left empty or omitted instead of being filled with placeholders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(default)]
    pub referenced_documents: Vec<ReferencedDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rag_chunks: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

/// One event of a streaming session.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start {
        conversation_id: String,
        request_id: String,
    },
    Token {
        /// Position of the fragment within its session, starting at 0.
        id: u64,
        token: String,
    },
    End {
        metadata: TurnMetadata,
        available_quotas: BTreeMap<String, u64>,
    },
}

impl StreamEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::Token { .. } => "token",
            StreamEvent::End { .. } => "end",
        }
    }
}

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    event: &'a str,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    available_quotas: Option<&'a BTreeMap<String, u64>>,
}

#[derive(Serialize, Deserialize)]
struct StartData {
    conversation_id: String,
    #[serde(default)]
    request_id: String,
}

#[derive(Serialize)]
struct StartDataRef<'a> {
    conversation_id: &'a str,
    request_id: &'a str,
}

#[derive(Deserialize)]
struct TokenData {
    id: u64,
    token: String,
}

#[derive(Serialize)]
struct TokenDataRef<'a> {
    id: u64,
    token: &'a str,
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    data: Value,
    #[serde(default)]
    available_quotas: Option<BTreeMap<String, u64>>,
}

/// Serialize an event into the JSON object carried by a frame.
pub fn to_json(event: &StreamEvent) -> Result<String> {
    let json = match event {
        StreamEvent::Start {
            conversation_id,
            request_id,
        } => serde_json::to_string(&Frame {
            event: event.name(),
            data: StartDataRef {
                conversation_id,
                request_id,
            },
            available_quotas: None,
        })?,
        StreamEvent::Token { id, token } => serde_json::to_string(&Frame {
            event: event.name(),
            data: TokenDataRef { id: *id, token },
            available_quotas: None,
        })?,
        StreamEvent::End {
            metadata,
            available_quotas,
        } => serde_json::to_string(&Frame {
            event: event.name(),
            data: metadata,
            available_quotas: Some(available_quotas),
        })?,
    };
    Ok(json)
}

/// Encode an event as a complete Server-Sent-Event frame.
pub fn encode(event: &StreamEvent) -> Result<String> {
    let json = to_json(event)?;
    let mut frame = String::with_capacity(FRAME_PREFIX.len() + json.len() + 2);
    frame.push_str(FRAME_PREFIX);
    frame.push_str(&json);
    frame.push_str(FRAME_TERMINATOR);
    Ok(frame)
}

/// Decode a single frame produced by [`encode`].
pub fn decode(frame: &str) -> Result<StreamEvent> {
    let payload = frame
        .strip_prefix(FRAME_PREFIX)
        .ok_or_else(|| StreamError::InvalidFrame("missing `data: ` prefix".to_string()))?
        .strip_suffix(FRAME_TERMINATOR)
        .ok_or_else(|| StreamError::InvalidFrame("missing blank line terminator".to_string()))?;

    let raw: RawFrame = serde_json::from_str(payload)?;
    match raw.event.as_str() {
        "start" => {
            let data: StartData = serde_json::from_value(raw.data)?;
            Ok(StreamEvent::Start {
                conversation_id: data.conversation_id,
                request_id: data.request_id,
            })
        }
        "token" => {
            let data: TokenData = serde_json::from_value(raw.data)?;
            Ok(StreamEvent::Token {
                id: data.id,
                token: data.token,
            })
        }
        "end" => Ok(StreamEvent::End {
            metadata: serde_json::from_value(raw.data)?,
            available_quotas: raw.available_quotas.unwrap_or_default(),
        }),
        other => Err(StreamError::InvalidFrame(format!(
            "unknown event type '{}'",
            other
        ))),
    }
}

/// Split a buffer of concatenated frames and decode each of them.
pub fn decode_all(body: &str) -> Result<Vec<StreamEvent>> {
    body.split_inclusive(FRAME_TERMINATOR)
        .filter(|chunk| !chunk.trim().is_empty())
        .map(decode)
        .collect()
}
