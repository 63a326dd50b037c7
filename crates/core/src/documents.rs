//! Document context for both pipelines.
//!
//! Turning uploaded files into text is an external concern; this module only
//! defines the seam and how extracted texts are stitched into one block.

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::future::try_join_all;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A stored file whose text may be fed to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRef {
    pub original_filename: String,
    pub path: PathBuf,
    pub mime_type: String,
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract_text(&self, path: &Path, mime_type: &str) -> Result<String>;
}

/// Reads text-like files as UTF-8.
pub struct PlainTextExtractor;

#[async_trait]
impl DocumentExtractor for PlainTextExtractor {
    async fn extract_text(&self, path: &Path, mime_type: &str) -> Result<String> {
        let textual = mime_type.starts_with("text/")
            || matches!(mime_type, "application/json" | "application/xml");
        if !textual {
            bail!("Unsupported file type: {}", mime_type);
        }
        Ok(tokio::fs::read_to_string(path).await?)
    }
}

/// Extracts all documents concurrently and joins them, in the given order,
/// each wrapped in start/end markers naming the file.
pub async fn aggregate_documents(
    extractor: &dyn DocumentExtractor,
    documents: &[DocumentRef],
) -> Result<String> {
    let texts = try_join_all(documents.iter().map(|doc| async move {
        let content = extractor.extract_text(&doc.path, &doc.mime_type).await?;
        Ok::<_, anyhow::Error>(format!(
            "--- START OF FILE: {name} ---\n{content}\n--- END OF FILE: {name} ---",
            name = doc.original_filename
        ))
    }))
    .await?;
    Ok(texts.join("\n\n"))
}

/// Everything the decision collaborator needs to know about a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    /// The durable transcript, formatted as `User:` / `AI:` lines.
    pub transcript: String,
    /// Aggregated text of every file referenced by the session's messages.
    pub documents: String,
}

/// Loads the durable context of a session owned by `user_id`.
#[async_trait]
pub trait SessionContextProvider: Send + Sync {
    async fn load(&self, user_id: &str, session_id: Uuid) -> Result<SessionContext>;
}
