//! The `start_session` flow: resolve the session, gather documents and
//! history, ask the model for a command stream and hand it to the
//! Presentation Orchestrator.

use super::{
    protocol::ServerMessage,
    session::ConnectionContext,
    sink::{ClientSink, CommandEmitter},
};
use crate::{
    db::document_refs,
    models::{MessageSender, StoredFile},
    state::AppState,
};
use anyhow::{Context, Result, bail};
use tracing::{error, info, instrument};
use uuid::Uuid;
use zipo_core::{
    Sender,
    documents::aggregate_documents,
    prompt::{format_history, summarize_title},
};

/// Messages of an existing session replayed to the model as history.
const HISTORY_MESSAGES: i64 = 5;

#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub prompt_text: String,
    pub session_id: Option<Uuid>,
    pub file_ids: Vec<Uuid>,
    pub language_code: Option<String>,
}

/// Runs one `start_session` request. Failures are reported to the client as
/// `session_error`.
///
/// Each request gets its own span so the session id never outlives it.
#[instrument(
    name = "start_session",
    skip_all,
    fields(session_id)
)]
pub async fn handle_start_session(
    state: &AppState,
    ctx: &ConnectionContext,
    sink: &dyn ClientSink,
    request: StartSessionRequest,
) {
    if let Err(e) = start_session(state, ctx, sink, request).await {
        error!(error = ?e, "Failed to process session");
        let _ = sink
            .send(ServerMessage::SessionError {
                message: format!("Failed to process session. {}", e),
            })
            .await;
    }
}

async fn start_session(
    state: &AppState,
    ctx: &ConnectionContext,
    sink: &dyn ClientSink,
    request: StartSessionRequest,
) -> Result<()> {
    let documents = if request.file_ids.is_empty() {
        String::new()
    } else {
        let found = state
            .db
            .files_by_ids(&ctx.user_id, &request.file_ids)
            .await?;
        let files = in_request_order(&request.file_ids, found)?;
        aggregate_documents(state.extractor.as_ref(), &document_refs(&files))
            .await
            .context("Failed to read documents")?
    };

    let (session_id, history) = match request.session_id {
        None => {
            let title = summarize_title(state.llm.as_ref(), &state.prompts, &request.prompt_text)
                .await
                .context("Failed to summarize session title")?;
            let session = state.db.create_session(&ctx.user_id, &title).await?;
            info!(session_id = %session.id, %title, "Session created");
            sink.send(ServerMessage::SessionCreated {
                session_id: session.id,
                title: session.title,
                updated_at: session.updated_at,
            })
            .await?;
            (session.id, None)
        }
        Some(id) => {
            let session = state
                .db
                .get_session(id, &ctx.user_id)
                .await?
                .context("Session could not be found or created.")?;
            let recent = state.db.recent_messages(session.id, HISTORY_MESSAGES).await?;
            let history = format_history(
                recent
                    .iter()
                    .map(|m| (Sender::from(m.sender), m.text.as_str())),
            );
            (session.id, Some(history))
        }
    };
    tracing::Span::current().record("session_id", session_id.to_string().as_str());

    state
        .db
        .add_message(
            session_id,
            MessageSender::User,
            &request.prompt_text,
            &request.file_ids,
        )
        .await?;
    state.db.touch_session(session_id).await?;

    let prompt = state
        .prompts
        .presentation(&request.prompt_text, history.as_deref(), &documents);
    let answer = state.llm.generate(&prompt).await?;
    if answer.trim().is_empty() {
        bail!("The language model returned an empty response.");
    }

    let language_code = request
        .language_code
        .unwrap_or_else(|| state.config.default_language_code.clone());
    state
        .presentation
        .run(
            &answer,
            session_id,
            &language_code,
            state.db.as_ref(),
            &CommandEmitter::new(sink),
        )
        .await?;
    Ok(())
}

/// Orders `found` like `requested`; every requested id must be present.
fn in_request_order(requested: &[Uuid], found: Vec<StoredFile>) -> Result<Vec<StoredFile>> {
    let mut ordered = Vec::with_capacity(requested.len());
    for id in requested {
        let Some(file) = found.iter().find(|f| f.id == *id) else {
            bail!("File mismatch or access denied.");
        };
        ordered.push(file.clone());
    }
    Ok(ordered)
}
