//! Presentation Orchestrator
//!
//! One invocation per user turn: parse the model output (or fall back), attach
//! audio to every spoken step, persist the stream, then emit it.

use crate::{
    command::Command,
    parser::{fallback_stream, parse_command_stream},
    speech::{SpeechSynthesizer, synthesize_commands},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Durable storage for assistant presentations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresentationStore: Send + Sync {
    async fn save_presentation(&self, session_id: Uuid, commands: &[Command]) -> Result<()>;
}

/// Delivers a finished stream to the connection that asked for it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresentationEmitter: Send + Sync {
    async fn emit_commands(&self, session_id: Uuid, commands: Vec<Command>) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresentationOutcome {
    /// Number of commands emitted.
    pub commands: usize,
    /// False when the model output could not be parsed and the fallback was sent.
    pub parsed: bool,
}

#[derive(Clone)]
pub struct PresentationOrchestrator {
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl PresentationOrchestrator {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self { synthesizer }
    }

    /// Runs the pipeline for `raw_model_text`.
    ///
    /// The stream is persisted before it is emitted; a failed save means
    /// nothing is emitted.
    pub async fn run(
        &self,
        raw_model_text: &str,
        session_id: Uuid,
        language_code: &str,
        store: &dyn PresentationStore,
        emitter: &dyn PresentationEmitter,
    ) -> Result<PresentationOutcome> {
        let (commands, parsed) = match parse_command_stream(raw_model_text) {
            Ok(commands) => (commands, true),
            Err(e) => {
                warn!(%session_id, error = %e, "Model output unparsable; sending fallback stream");
                (fallback_stream(), false)
            }
        };

        let commands = synthesize_commands(self.synthesizer.as_ref(), commands, language_code).await;

        store
            .save_presentation(session_id, &commands)
            .await
            .context("Failed to save presentation")?;

        let count = commands.len();
        emitter
            .emit_commands(session_id, commands)
            .await
            .context("Failed to emit presentation")?;

        info!(%session_id, commands = count, parsed, "Presentation delivered");
        Ok(PresentationOutcome {
            commands: count,
            parsed,
        })
    }
}
