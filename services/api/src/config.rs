use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Backends for the generative-language collaborator. Both speak the
/// OpenAI chat completions protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
}

/// Backends for the speech synthesis collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAI,
    Google,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub llm_provider: LlmProvider,
    pub openai_api_key: String,
    pub gemini_api_key: Option<String>,
    pub chat_model: String,
    pub tts_provider: TtsProvider,
    pub google_tts_api_key: Option<String>,
    pub tts_voice: String,
    pub transcription_model: String,
    pub default_language_code: String,
    pub frontend_url: Option<String>,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:3000");
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let llm_provider_str = var_or("LLM_PROVIDER", "openai");
        let llm_provider = match llm_provider_str.to_lowercase().as_str() {
            "openai" => LlmProvider::OpenAI,
            "gemini" => LlmProvider::Gemini,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_PROVIDER".to_string(),
                    format!("'{}' is not one of openai, gemini", other),
                ));
            }
        };

        let tts_provider_str = var_or("TTS_PROVIDER", "openai");
        let tts_provider = match tts_provider_str.to_lowercase().as_str() {
            "openai" => TtsProvider::OpenAI,
            "google" => TtsProvider::Google,
            other => {
                return Err(ConfigError::InvalidValue(
                    "TTS_PROVIDER".to_string(),
                    format!("'{}' is not one of openai, google", other),
                ));
            }
        };

        // Realtime transcription always runs against OpenAI.
        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();
        let google_tts_api_key = std::env::var("GOOGLE_TTS_API_KEY").ok();

        if llm_provider == LlmProvider::Gemini && gemini_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
            ));
        }
        if tts_provider == TtsProvider::Google && google_tts_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "GOOGLE_TTS_API_KEY must be set for 'google' speech provider".to_string(),
            ));
        }

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        Ok(Self {
            bind_address,
            database_url,
            llm_provider,
            openai_api_key,
            gemini_api_key,
            chat_model: var_or("CHAT_MODEL", "gpt-4o"),
            tts_provider,
            google_tts_api_key,
            tts_voice: var_or("TTS_VOICE", "alloy"),
            transcription_model: var_or("TRANSCRIPTION_MODEL", "whisper-1"),
            default_language_code: var_or("DEFAULT_LANGUAGE_CODE", "id-ID"),
            frontend_url: std::env::var("FRONTEND_URL").ok().filter(|u| !u.is_empty()),
            log_level,
            prompts_path,
        })
    }
}
