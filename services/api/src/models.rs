//! API and Database Models
//!
//! This module defines the core data structures used for both database mapping
//! with `sqlx` and for generating OpenAPI documentation with `utoipa`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;
use zipo_core::Sender;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "message_sender", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    User,
    Ai,
}

impl fmt::Display for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageSender::User => write!(f, "user"),
            MessageSender::Ai => write!(f, "ai"),
        }
    }
}

impl From<MessageSender> for Sender {
    fn from(sender: MessageSender) -> Self {
        match sender {
            MessageSender::User => Sender::User,
            MessageSender::Ai => Sender::Assistant,
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One durable message. Assistant messages hold the JSON of the command
/// stream that was emitted.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(value_type = String, example = "user")]
    pub sender: MessageSender,
    pub text: String,
    #[schema(value_type = Vec<String>)]
    pub file_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// An uploaded file. Uploading is handled elsewhere; rows are only read here.
#[derive(Serialize, ToSchema, FromRow, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    pub user_id: String,
    pub original_filename: String,
    pub path: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
