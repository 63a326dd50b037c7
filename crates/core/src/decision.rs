//! Decision collaborator: given a live utterance, decides what to say back and
//! whether the utterance deserves a full visual presentation.

use crate::{
    conversation::ConversationTurn, llm_client::LanguageModel, parser::balanced_literals,
    prompt::PromptBook,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    #[serde(default)]
    pub verbal_response: String,
    #[serde(default)]
    pub trigger_visualization: bool,
    #[serde(default, rename = "promptForLLM")]
    pub prompt_for_llm: Option<String>,
}

impl Decision {
    /// The prompt to hand to the presentation pipeline, when one was requested.
    pub fn visualization_prompt(&self) -> Option<&str> {
        if !self.trigger_visualization {
            return None;
        }
        self.prompt_for_llm
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

#[async_trait]
pub trait DecisionAgent: Send + Sync {
    async fn decide(
        &self,
        utterance: &str,
        turns: &[ConversationTurn],
        session_context: &str,
        documents: &str,
    ) -> Result<Decision>;
}

/// A `DecisionAgent` that asks the generative model for a JSON verdict.
pub struct LlmDecisionAgent {
    llm: Arc<dyn LanguageModel>,
    prompts: Arc<PromptBook>,
}

impl LlmDecisionAgent {
    pub fn new(llm: Arc<dyn LanguageModel>, prompts: Arc<PromptBook>) -> Self {
        Self { llm, prompts }
    }
}

#[async_trait]
impl DecisionAgent for LlmDecisionAgent {
    async fn decide(
        &self,
        utterance: &str,
        turns: &[ConversationTurn],
        session_context: &str,
        documents: &str,
    ) -> Result<Decision> {
        let prompt = self
            .prompts
            .voice_agent(utterance, turns, session_context, documents);
        let answer = self.llm.generate(&prompt).await?;
        Ok(interpret(&answer))
    }
}

/// Reads the first decodable JSON object in `answer`; otherwise the whole
/// answer is the verbal reply.
fn interpret(answer: &str) -> Decision {
    if let Some(decision) = balanced_literals(answer, b'{', b'}').find_map(|candidate| {
        let value: Value = serde_json::from_str(candidate).ok()?;
        let object = value.as_object()?;
        if !object.contains_key("verbalResponse") && !object.contains_key("triggerVisualization") {
            return None;
        }
        serde_json::from_value::<Decision>(value).ok()
    }) {
        return decision;
    }
    debug!("Decision answer carried no JSON object; using it as the verbal reply");
    Decision {
        verbal_response: answer.trim().to_string(),
        ..Default::default()
    }
}
