//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds all shared,
//! clonable resources like database pools and service clients.

use crate::{config::Config, db::Db, ws::live::LiveServices};
use std::sync::Arc;
use zipo_core::{
    documents::DocumentExtractor, llm_client::LanguageModel,
    presentation::PresentationOrchestrator, prompt::PromptBook,
};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub llm: Arc<dyn LanguageModel>,
    pub prompts: Arc<PromptBook>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub presentation: PresentationOrchestrator,
    pub live: LiveServices,
    pub config: Arc<Config>,
}
