//! Data Access Layer
//!
//! This module contains all the functions for interacting with the PostgreSQL database.
//! Queries are checked at runtime so the crate builds without a live database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use std::{path::PathBuf, sync::Arc};
use uuid::Uuid;
use zipo_core::{
    Command, Sender,
    documents::{
        DocumentExtractor, DocumentRef, SessionContext, SessionContextProvider,
        aggregate_documents,
    },
    presentation::PresentationStore,
    prompt::format_history,
};

use crate::models::{Message, MessageSender, Session, StoredFile};

const SESSION_COLUMNS: &str = "id, user_id, title, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, session_id, sender, text, file_ids, created_at";
const FILE_COLUMNS: &str = "id, user_id, original_filename, path, mime_type, created_at";

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn create_session(&self, user_id: &str, title: &str) -> Result<Session> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO sessions (user_id, title) VALUES ($1, $2) RETURNING {SESSION_COLUMNS}"
        ))
        .bind(user_id)
        .bind(title)
        .fetch_one(&self.pool)
        .await?;
        Ok(session)
    }

    /// Retrieves a single session by its ID, scoped to a specific user.
    pub async fn get_session(&self, session_id: Uuid, user_id: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1 AND user_id = $2"
        ))
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    /// Lists all sessions for a given user, most recently active first.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 ORDER BY updated_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Marks a session as active now.
    pub async fn touch_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET updated_at = now() WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_message(
        &self,
        session_id: Uuid,
        sender: MessageSender,
        text: &str,
        file_ids: &[Uuid],
    ) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "INSERT INTO messages (session_id, sender, text, file_ids)
             VALUES ($1, $2, $3, $4)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(session_id)
        .bind(sender)
        .bind(text)
        .bind(file_ids)
        .fetch_one(&self.pool)
        .await?;
        Ok(message)
    }

    /// The last `limit` messages of a session, oldest first.
    pub async fn recent_messages(&self, session_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = $1
                 ORDER BY created_at DESC, id DESC
                 LIMIT $2
             ) recent
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Retrieves the full message history for a session, ordered chronologically.
    pub async fn session_messages(&self, session_id: Uuid) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE session_id = $1
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// The subset of `file_ids` owned by `user_id`, in no particular order.
    pub async fn files_by_ids(&self, user_id: &str, file_ids: &[Uuid]) -> Result<Vec<StoredFile>> {
        let files = sqlx::query_as::<_, StoredFile>(&format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE id = ANY($1) AND user_id = $2"
        ))
        .bind(file_ids)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }

    /// Every file referenced by any message of the session, oldest first.
    pub async fn files_for_session(&self, session_id: Uuid) -> Result<Vec<StoredFile>> {
        let files = sqlx::query_as::<_, StoredFile>(
            "SELECT f.id, f.user_id, f.original_filename, f.path, f.mime_type, f.created_at
             FROM files f
             WHERE f.id IN (
                 SELECT unnest(m.file_ids) FROM messages m WHERE m.session_id = $1
             )
             ORDER BY f.created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(files)
    }
}

#[async_trait]
impl PresentationStore for Db {
    async fn save_presentation(&self, session_id: Uuid, commands: &[Command]) -> Result<()> {
        let text = serde_json::to_string(commands)?;
        self.add_message(session_id, MessageSender::Ai, &text, &[])
            .await?;
        self.touch_session(session_id).await
    }
}

pub fn document_refs(files: &[StoredFile]) -> Vec<DocumentRef> {
    files
        .iter()
        .map(|f| DocumentRef {
            original_filename: f.original_filename.clone(),
            path: PathBuf::from(&f.path),
            mime_type: f.mime_type.clone(),
        })
        .collect()
}

/// Builds the durable context of a session from the database and its files.
pub struct SessionContextLoader {
    db: Arc<Db>,
    extractor: Arc<dyn DocumentExtractor>,
}

impl SessionContextLoader {
    pub fn new(db: Arc<Db>, extractor: Arc<dyn DocumentExtractor>) -> Self {
        Self { db, extractor }
    }
}

#[async_trait]
impl SessionContextProvider for SessionContextLoader {
    async fn load(&self, user_id: &str, session_id: Uuid) -> Result<SessionContext> {
        self.db
            .get_session(session_id, user_id)
            .await?
            .context("Session not found")?;

        let messages = self.db.session_messages(session_id).await?;
        let transcript = format_history(
            messages
                .iter()
                .map(|m| (Sender::from(m.sender), m.text.as_str())),
        );

        let files = self.db.files_for_session(session_id).await?;
        let documents = aggregate_documents(self.extractor.as_ref(), &document_refs(&files))
            .await
            .context("Failed to read session documents")?;

        Ok(SessionContext {
            transcript,
            documents,
        })
    }
}
