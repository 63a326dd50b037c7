//! Command Stream Model
//!
//! A presentation is an ordered list of [`Command`]s. Array position is the
//! execution order and every stream produced by the model is expected to end
//! with a single `session_end`. The payload is kept as raw JSON so that shapes
//! this crate does not know about reach the renderer untouched; typed views are
//! available through [`Command::typed_payload`] for the places that need them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Payload key under which synthesized audio (base64) is attached to `speak` commands.
pub const AUDIO_CONTENT_KEY: &str = "audioContent";

/// The kind of a presentation step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Speak,
    CreateText,
    DrawRectangle,
    DrawCircle,
    DrawArrow,
    CreateTable,
    FillTable,
    ClearCanvas,
    SessionEnd,
    /// A kind this crate does not interpret. Kept verbatim for the renderer.
    Unknown(String),
}

impl CommandKind {
    /// The canonical wire name.
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Speak => "speak",
            CommandKind::CreateText => "create_text",
            CommandKind::DrawRectangle => "draw_rectangle",
            CommandKind::DrawCircle => "draw_circle",
            CommandKind::DrawArrow => "draw_arrow",
            CommandKind::CreateTable => "create_table",
            CommandKind::FillTable => "fill_table",
            CommandKind::ClearCanvas => "clear_canvas",
            CommandKind::SessionEnd => "session_end",
            CommandKind::Unknown(name) => name,
        }
    }

    /// Resolves a wire name, accepting both snake_case and the camelCase
    /// spellings models tend to produce.
    pub fn from_name(name: &str) -> Self {
        match name {
            "speak" => CommandKind::Speak,
            "create_text" | "createText" => CommandKind::CreateText,
            "draw_rectangle" | "drawRectangle" => CommandKind::DrawRectangle,
            "draw_circle" | "drawCircle" => CommandKind::DrawCircle,
            "draw_arrow" | "drawArrow" => CommandKind::DrawArrow,
            "create_table" | "createTable" => CommandKind::CreateTable,
            "fill_table" | "fillTable" => CommandKind::FillTable,
            "clear_canvas" | "clearCanvas" => CommandKind::ClearCanvas,
            "session_end" | "sessionEnd" => CommandKind::SessionEnd,
            other => CommandKind::Unknown(other.to_string()),
        }
    }

    /// Whether the kind carries advisory pacing (`delay`) metadata.
    pub fn is_paced(&self) -> bool {
        !matches!(self, CommandKind::Speak | CommandKind::SessionEnd)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CommandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(CommandKind::from_name(&name))
    }
}

/// A single step of a presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    /// Milliseconds a consumer should hold after executing this step.
    #[serde(
        default,
        alias = "delayMs",
        deserialize_with = "lenient_delay",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay: Option<u64>,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

/// Accepts any JSON for `delay`; only non-negative numbers survive.
fn lenient_delay<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        _ => None,
    })
}

impl Command {
    /// A `speak` step with the given text.
    pub fn speak(text: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("text".to_string(), Value::String(text.into()));
        Self {
            command: CommandKind::Speak,
            payload: Value::Object(payload),
            delay: None,
        }
    }

    /// The terminating step of a stream.
    pub fn session_end() -> Self {
        Self {
            command: CommandKind::SessionEnd,
            payload: empty_payload(),
            delay: Some(0),
        }
    }

    pub fn is_speak(&self) -> bool {
        self.command == CommandKind::Speak
    }

    /// The spoken text of a `speak` step, if it has a non-empty one.
    pub fn speak_text(&self) -> Option<&str> {
        if !self.is_speak() {
            return None;
        }
        self.payload
            .get("text")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
    }

    pub fn audio_content(&self) -> Option<&str> {
        self.payload.get(AUDIO_CONTENT_KEY).and_then(Value::as_str)
    }

    /// Returns a copy of this command with `audioContent` attached to its payload.
    ///
    /// A payload that is not a JSON object is replaced by one holding only the audio.
    pub fn with_audio(mut self, audio_content: String) -> Self {
        match self.payload.as_object_mut() {
            Some(map) => {
                map.insert(AUDIO_CONTENT_KEY.to_string(), Value::String(audio_content));
            }
            None => {
                let mut map = Map::new();
                map.insert(AUDIO_CONTENT_KEY.to_string(), Value::String(audio_content));
                self.payload = Value::Object(map);
            }
        }
        self
    }

    /// Decodes the payload into the typed view for this command's kind.
    pub fn typed_payload(&self) -> Result<CommandPayload, serde_json::Error> {
        let p = self.payload.clone();
        Ok(match &self.command {
            CommandKind::Speak => CommandPayload::Speak(serde_json::from_value(p)?),
            CommandKind::CreateText => CommandPayload::CreateText(serde_json::from_value(p)?),
            CommandKind::DrawRectangle => {
                CommandPayload::DrawRectangle(serde_json::from_value(p)?)
            }
            CommandKind::DrawCircle => CommandPayload::DrawCircle(serde_json::from_value(p)?),
            CommandKind::DrawArrow => CommandPayload::DrawArrow(serde_json::from_value(p)?),
            CommandKind::CreateTable => CommandPayload::CreateTable(serde_json::from_value(p)?),
            CommandKind::FillTable => CommandPayload::FillTable(serde_json::from_value(p)?),
            CommandKind::ClearCanvas => CommandPayload::ClearCanvas,
            CommandKind::SessionEnd => CommandPayload::SessionEnd,
            CommandKind::Unknown(_) => CommandPayload::Unknown(p),
        })
    }
}

/// Typed payloads, one per known kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandPayload {
    Speak(SpeakPayload),
    CreateText(TextPayload),
    DrawRectangle(RectanglePayload),
    DrawCircle(CirclePayload),
    DrawArrow(ArrowPayload),
    CreateTable(TablePayload),
    FillTable(FillTablePayload),
    ClearCanvas,
    SessionEnd,
    Unknown(Value),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakPayload {
    pub text: String,
    pub audio_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextPayload {
    pub x: f64,
    pub y: f64,
    pub text: String,
    pub font_size: Option<f64>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RectanglePayload {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub color: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CirclePayload {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    pub color: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArrowPayload {
    pub points: Vec<f64>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePayload {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub rows: u32,
    pub cols: u32,
    #[serde(default)]
    pub col_widths: Vec<f64>,
    pub row_height: Option<f64>,
    #[serde(default)]
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillTablePayload {
    pub table_id: String,
    pub row: u32,
    pub col: u32,
    pub text: String,
}
