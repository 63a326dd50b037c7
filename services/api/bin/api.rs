//! Main Entrypoint for the Zipo API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Initializing shared services (language model, speech and document collaborators).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use axum::http::HeaderValue;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};
use zipo_api::{
    config::{Config, LlmProvider, TtsProvider},
    db::{Db, SessionContextLoader},
    router::create_router,
    state::AppState,
    ws::{live::LiveServices, provider::OpenAIRealtimeRecognizer},
};
use zipo_core::{
    decision::LlmDecisionAgent,
    documents::{DocumentExtractor, PlainTextExtractor},
    llm_client::{LanguageModel, OpenAICompatibleClient},
    presentation::PresentationOrchestrator,
    prompt::PromptBook,
    speech::{GoogleSpeechSynthesizer, OpenAISpeechSynthesizer, SpeechSynthesizer},
};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn openai_config(api_key: &str) -> OpenAIConfig {
    OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base("https://api.openai.com/v1/")
}

fn language_model(config: &Config) -> anyhow::Result<Arc<dyn LanguageModel>> {
    let llm_config = match config.llm_provider {
        LlmProvider::OpenAI => {
            info!("Using OpenAI language model provider.");
            openai_config(&config.openai_api_key)
        }
        LlmProvider::Gemini => {
            info!("Using Gemini language model provider.");
            let api_key = config
                .gemini_api_key
                .as_deref()
                .context("GEMINI_API_KEY is required for the gemini provider")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(GEMINI_API_BASE)
        }
    };
    Ok(Arc::new(OpenAICompatibleClient::new(
        llm_config,
        config.chat_model.clone(),
    )))
}

fn speech_synthesizer(config: &Config) -> anyhow::Result<Arc<dyn SpeechSynthesizer>> {
    Ok(match config.tts_provider {
        TtsProvider::OpenAI => Arc::new(OpenAISpeechSynthesizer::new(
            openai_config(&config.openai_api_key),
            &config.tts_voice,
        )),
        TtsProvider::Google => {
            let api_key = config
                .google_tts_api_key
                .clone()
                .context("GOOGLE_TTS_API_KEY is required for the google speech provider")?;
            Arc::new(GoogleSpeechSynthesizer::new(api_key))
        }
    })
}

fn cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let origin = match &config.frontend_url {
        Some(url) => AllowOrigin::exact(
            url.parse::<HeaderValue>()
                .context("FRONTEND_URL is not a valid origin")?,
        ),
        None => AllowOrigin::any(),
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize Shared Services ---
    let prompts = Arc::new(PromptBook::from_dir(&config.prompts_path)?);
    let llm = language_model(&config)?;
    let synthesizer = speech_synthesizer(&config)?;
    let extractor: Arc<dyn DocumentExtractor> = Arc::new(PlainTextExtractor);

    let live = LiveServices {
        decision: Arc::new(LlmDecisionAgent::new(llm.clone(), prompts.clone())),
        synthesizer: synthesizer.clone(),
        recognizer: Arc::new(OpenAIRealtimeRecognizer::new(
            config.openai_api_key.clone(),
            config.transcription_model.clone(),
        )),
        context: Arc::new(SessionContextLoader::new(db.clone(), extractor.clone())),
        default_language_code: config.default_language_code.clone(),
    };

    let app_state = Arc::new(AppState {
        db,
        llm,
        prompts,
        extractor,
        presentation: PresentationOrchestrator::new(synthesizer),
        live,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let app = create_router(app_state).layer(cors_layer(&config)?);

    // --- 6. Start Server ---
    info!(
        llm_provider = ?config.llm_provider,
        tts_provider = ?config.tts_provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
