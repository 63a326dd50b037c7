//! Defines the WebSocket message protocol between the browser client and the API server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;
use zipo_core::Command;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Asks for a presentation. Without a valid `session_id` a new session
    /// is created; file ids that are not UUIDs are dropped.
    StartSession {
        prompt_text: String,
        #[serde(default, deserialize_with = "lenient_uuid")]
        session_id: Option<Uuid>,
        #[serde(default, deserialize_with = "lenient_uuids")]
        file_ids: Vec<Uuid>,
        language_code: Option<String>,
    },
    /// Opens a live voice conversation about an existing session.
    StartConversation {
        session_id: Uuid,
        language_code: Option<String>,
    },
    /// A base64 chunk of PCM16 microphone audio.
    AudioStreamFromClient { chunk: String },
    /// The user stopped the live conversation.
    ClientInterruption,
}

fn as_uuid(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s.trim()).ok())
}

fn lenient_uuid<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Uuid>, D::Error> {
    Ok(as_uuid(&Value::deserialize(deserializer)?))
}

fn lenient_uuids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Uuid>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.iter().filter_map(as_uuid).collect(),
        _ => Vec::new(),
    })
}

/// The `type` tag of a client frame that failed to decode, if it has one.
pub fn message_type(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionCreated {
        session_id: Uuid,
        title: String,
        updated_at: DateTime<Utc>,
    },
    CommandStreamReceived {
        session_id: Uuid,
        commands: Vec<Command>,
    },
    SessionError { message: String },
    TranscriptUpdate { transcript: String, is_final: bool },
    AiAudioResponse {
        audio_content: String,
        transcript: String,
    },
    /// Barge-in: the client must drop whatever assistant audio it is playing.
    StopAiPlayback,
    TriggerVisualization { prompt: String },
    ConversationError { message: String },
}
