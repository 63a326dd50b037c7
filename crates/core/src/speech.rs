//! Speech Synthesis
//!
//! This module defines the contract for text-to-speech collaborators, the
//! order-preserving fan-out that attaches audio to every `speak` step of a
//! command stream, and the two concrete synthesizers the service can run with.

use crate::command::Command;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateSpeechRequestArgs, SpeechModel, SpeechResponseFormat, Voice},
};
use async_trait::async_trait;
use base64::Engine;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SynthesisError {
    /// Quota, rate limiting or network trouble. Retrying later may succeed.
    #[error("transient speech synthesis failure: {0}")]
    Transient(String),
    /// The provider refused the request.
    #[error("speech synthesis rejected: {0}")]
    Rejected(String),
}

/// A text-to-speech collaborator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesizes `text` and returns the encoded audio as base64.
    async fn synthesize(&self, text: &str, language_code: &str) -> Result<String, SynthesisError>;
}

/// Attempts synthesis for every `speak` command, concurrently.
///
/// The result has the same length and kind-at-index as the input. A failed
/// call leaves its command without `audioContent`; other indices are unaffected.
pub async fn synthesize_commands(
    synthesizer: &dyn SpeechSynthesizer,
    commands: Vec<Command>,
    language_code: &str,
) -> Vec<Command> {
    let calls = commands.into_iter().enumerate().map(|(index, command)| async move {
        let Some(text) = command.speak_text().map(str::to_owned) else {
            return command;
        };
        match synthesizer.synthesize(&text, language_code).await {
            Ok(audio) => {
                debug!(index, "Speech synthesized for speak command");
                command.with_audio(audio)
            }
            Err(e) => {
                warn!(index, error = %e, "Speech synthesis failed; sending command without audio");
                command
            }
        }
    });
    join_all(calls).await
}

/// Synthesizer backed by the OpenAI speech endpoint.
///
/// The endpoint picks pronunciation from the text itself, so the language code
/// is only logged.
pub struct OpenAISpeechSynthesizer {
    client: Client<OpenAIConfig>,
    voice: Voice,
}

impl OpenAISpeechSynthesizer {
    pub fn new(config: OpenAIConfig, voice: &str) -> Self {
        Self {
            client: Client::with_config(config),
            voice: parse_voice(voice),
        }
    }
}

fn parse_voice(name: &str) -> Voice {
    match name.to_lowercase().as_str() {
        "echo" => Voice::Echo,
        "fable" => Voice::Fable,
        "onyx" => Voice::Onyx,
        "nova" => Voice::Nova,
        "shimmer" => Voice::Shimmer,
        _ => Voice::Alloy,
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAISpeechSynthesizer {
    async fn synthesize(&self, text: &str, language_code: &str) -> Result<String, SynthesisError> {
        debug!(%language_code, chars = text.len(), "Requesting OpenAI speech");
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .voice(self.voice.clone())
            .model(SpeechModel::Tts1)
            .response_format(SpeechResponseFormat::Mp3)
            .build()
            .map_err(|e| SynthesisError::Rejected(e.to_string()))?;

        let response = self
            .client
            .audio()
            .speech(request)
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;

        Ok(base64::engine::general_purpose::STANDARD.encode(&response.bytes))
    }
}

const GOOGLE_TTS_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

/// Synthesizer backed by the Google Cloud Text-to-Speech REST API.
pub struct GoogleSpeechSynthesizer {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleSynthesizeRequest<'a> {
    input: GoogleInput<'a>,
    voice: GoogleVoice<'a>,
    audio_config: GoogleAudioConfig,
}

#[derive(Serialize)]
struct GoogleInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleVoice<'a> {
    language_code: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleAudioConfig {
    audio_encoding: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleSynthesizeResponse {
    audio_content: String,
}

impl GoogleSpeechSynthesizer {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, GOOGLE_TTS_URL.to_string())
    }

    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            endpoint,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for GoogleSpeechSynthesizer {
    async fn synthesize(&self, text: &str, language_code: &str) -> Result<String, SynthesisError> {
        let body = GoogleSynthesizeRequest {
            input: GoogleInput { text },
            voice: GoogleVoice { language_code },
            audio_config: GoogleAudioConfig {
                audio_encoding: "MP3",
            },
        };

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(SynthesisError::Transient(format!("status {}", status)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SynthesisError::Rejected(format!("status {}: {}", status, detail)));
        }

        let decoded: GoogleSynthesizeResponse = response
            .json()
            .await
            .map_err(|e| SynthesisError::Transient(e.to_string()))?;
        Ok(decoded.audio_content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::parser::parse_command_stream;
    use std::time::Duration;

    fn stream() -> Vec<Command> {
        parse_command_stream(
            r#"[
                {"command":"speak","payload":{"text":"a"}},
                {"command":"createText","payload":{"x":1,"y":1,"text":"label"},"delay":500},
                {"command":"speak","payload":{"text":"b"}},
                {"command":"speak","payload":{"text":"c"}},
                {"command":"session_end","payload":{}}
            ]"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn preserves_length_and_kinds() {
        let mut mock = MockSpeechSynthesizer::new();
        mock.expect_synthesize()
            .times(3)
            .returning(|text, _| Ok(format!("audio-{}", text)));

        let input = stream();
        let output = synthesize_commands(&mock, input.clone(), "en-US").await;

        assert_eq!(output.len(), input.len());
        for (before, after) in input.iter().zip(output.iter()) {
            assert_eq!(before.command, after.command);
        }
        assert_eq!(output[0].audio_content(), Some("audio-a"));
        assert_eq!(output[2].audio_content(), Some("audio-b"));
        assert_eq!(output[3].audio_content(), Some("audio-c"));
        assert_eq!(output[1], input[1]);
        assert_eq!(output[4], input[4]);
    }

    #[tokio::test]
    async fn failure_is_isolated_to_its_index() {
        let mut mock = MockSpeechSynthesizer::new();
        mock.expect_synthesize().returning(|text, _| {
            if text == "b" {
                Err(SynthesisError::Transient("quota".to_string()))
            } else {
                Ok("ok".to_string())
            }
        });

        let output = synthesize_commands(&mock, stream(), "en-US").await;
        assert_eq!(output[0].audio_content(), Some("ok"));
        assert_eq!(output[2].audio_content(), None);
        assert_eq!(output[2].speak_text(), Some("b"));
        assert_eq!(output[3].audio_content(), Some("ok"));
    }

    #[tokio::test]
    async fn language_code_is_forwarded() {
        let mut mock = MockSpeechSynthesizer::new();
        mock.expect_synthesize()
            .withf(|_, lang| lang == "id-ID")
            .times(1)
            .returning(|_, _| Ok("x".to_string()));

        let output = synthesize_commands(&mock, vec![Command::speak("halo")], "id-ID").await;
        assert_eq!(output[0].audio_content(), Some("x"));
    }

    #[tokio::test]
    async fn speak_without_text_is_not_synthesized() {
        let mut mock = MockSpeechSynthesizer::new();
        mock.expect_synthesize().never();

        let output = synthesize_commands(&mock, vec![Command::speak("")], "en-US").await;
        assert_eq!(output[0].command, CommandKind::Speak);
        assert_eq!(output[0].audio_content(), None);
    }

    struct SlowFirst;

    #[async_trait]
    impl SpeechSynthesizer for SlowFirst {
        async fn synthesize(&self, text: &str, _: &str) -> Result<String, SynthesisError> {
            if text == "a" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(text.to_uppercase())
        }
    }

    #[tokio::test]
    async fn order_is_positional_not_completion_order() {
        let output = synthesize_commands(&SlowFirst, stream(), "en-US").await;
        let audio: Vec<Option<&str>> = output.iter().map(Command::audio_content).collect();
        assert_eq!(audio, vec![Some("A"), None, Some("B"), Some("C"), None]);
    }

    #[test]
    fn unknown_voice_falls_back_to_alloy() {
        assert!(matches!(parse_voice("nova"), Voice::Nova));
        assert!(matches!(parse_voice("robot"), Voice::Alloy));
    }
}
