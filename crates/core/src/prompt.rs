//! Prompt Templates and History Formatting
//!
//! Templates are markdown files loaded once at startup; placeholders are
//! written as `{name}` and filled with plain string replacement.

use crate::{
    command::{Command, CommandPayload},
    conversation::{ConversationTurn, Sender},
    llm_client::LanguageModel,
};
use anyhow::{Context, Result};
use std::{collections::HashMap, fs, path::Path};
use thiserror::Error;
use tracing::debug;

pub const PRESENTATION: &str = "presentation";
pub const DOCUMENT_CONTEXT: &str = "document_context";
pub const SESSION_TITLE: &str = "session_title";
pub const VOICE_AGENT: &str = "voice_agent";

const REQUIRED: [&str; 4] = [PRESENTATION, DOCUMENT_CONTEXT, SESSION_TITLE, VOICE_AGENT];

/// How many characters of the user's prompt are used when no title comes back.
const TITLE_FALLBACK_CHARS: usize = 30;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Missing prompt template: '{0}'")]
    MissingTemplate(String),
}

/// The set of prompt templates used by the service.
#[derive(Debug, Clone)]
pub struct PromptBook {
    templates: HashMap<String, String>,
}

impl PromptBook {
    /// Builds a prompt book, checking that every template the service uses is present.
    pub fn new(templates: HashMap<String, String>) -> Result<Self, PromptError> {
        for key in REQUIRED {
            if !templates.contains_key(key) {
                return Err(PromptError::MissingTemplate(key.to_string()));
            }
        }
        Ok(Self { templates })
    }

    /// Loads every `*.md` file in `dir`, keyed by file stem.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut templates = HashMap::new();
        for entry in fs::read_dir(dir)
            .with_context(|| format!("Could not read prompts directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
                let key = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .context("Could not get file stem")?
                    .to_string();
                templates.insert(key, fs::read_to_string(&path)?);
            }
        }
        debug!(count = templates.len(), "Prompt templates loaded");
        Ok(Self::new(templates)?)
    }

    fn template(&self, key: &str) -> &str {
        // Presence is checked in `new`.
        self.templates.get(key).map(String::as_str).unwrap_or_default()
    }

    /// The prompt asking the model for a command stream answering `user_input`.
    pub fn presentation(&self, user_input: &str, history: Option<&str>, documents: &str) -> String {
        let documents_section = if documents.trim().is_empty() {
            String::new()
        } else {
            self.template(DOCUMENT_CONTEXT).replace("{documents}", documents)
        };
        let conversation = match history.filter(|h| !h.is_empty()) {
            Some(history) => format!("{}\nUser: {}", history, user_input),
            None => format!("User: {}", user_input),
        };
        self.template(PRESENTATION)
            .replace("{documents}", &documents_section)
            .replace("{conversation}", &conversation)
    }

    pub fn session_title(&self, prompt_text: &str) -> String {
        self.template(SESSION_TITLE).replace("{prompt}", prompt_text)
    }

    /// The prompt for the live voice agent deciding how to answer `utterance`.
    pub fn voice_agent(
        &self,
        utterance: &str,
        turns: &[ConversationTurn],
        session_context: &str,
        documents: &str,
    ) -> String {
        self.template(VOICE_AGENT)
            .replace("{session_context}", session_context)
            .replace("{documents}", documents)
            .replace("{live_history}", &format_turns(turns))
            .replace("{utterance}", utterance)
    }
}

/// Formats stored session messages as a `User:` / `AI:` transcript.
///
/// Assistant messages hold a serialized command stream; only their spoken
/// text is kept.
pub fn format_history<'a, I>(messages: I) -> String
where
    I: IntoIterator<Item = (Sender, &'a str)>,
{
    messages
        .into_iter()
        .map(|(sender, text)| match sender {
            Sender::User => format!("User: {}", text),
            Sender::Assistant => match serde_json::from_str::<Vec<Command>>(text) {
                Ok(commands) => format!("AI: {}", spoken_text(&commands)),
                Err(_) => "AI: (response could not be processed)".to_string(),
            },
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// All `speak` texts of a stream, joined by spaces.
pub fn spoken_text(commands: &[Command]) -> String {
    commands
        .iter()
        .filter_map(|c| match c.typed_payload() {
            Ok(CommandPayload::Speak(speak)) if !speak.text.is_empty() => Some(speak.text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats the in-memory live conversation.
pub fn format_turns(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|turn| match turn.sender {
            Sender::User => format!("User: {}", turn.text),
            Sender::Assistant => format!("AI: {}", turn.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Asks the model for a short session title.
pub async fn summarize_title(
    llm: &dyn LanguageModel,
    prompts: &PromptBook,
    prompt_text: &str,
) -> Result<String> {
    let answer = llm.generate(&prompts.session_title(prompt_text)).await?;
    let title = clean_title(&answer);
    if title.is_empty() {
        Ok(prompt_text.chars().take(TITLE_FALLBACK_CHARS).collect())
    } else {
        Ok(title)
    }
}

fn clean_title(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != '"' && *c != '\'')
        .collect::<String>()
        .trim()
        .to_string()
}
