//! Streaming speech recognition over the OpenAI Realtime API.
//!
//! The realtime session is configured for transcription only: server-side
//! voice activity detection splits utterances and no model responses are
//! requested.

use anyhow::{Context, Result, bail};
use async_openai::types::realtime::{
    self as oai_realtime, ClientEvent as OAIClientEvent, ServerEvent as OAIServerEvent,
};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};
use zipo_core::transcription::{
    RecognizerStream, SpeechRecognizer, TranscriptionError, TranscriptionResult,
};

const REALTIME_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-10-01";

type RealtimeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ResultSender = mpsc::Sender<Result<TranscriptionResult, TranscriptionError>>;

pub struct OpenAIRealtimeRecognizer {
    api_key: String,
    transcription_model: String,
}

impl OpenAIRealtimeRecognizer {
    pub fn new(api_key: String, transcription_model: String) -> Self {
        Self {
            api_key,
            transcription_model,
        }
    }

    fn session_update(&self) -> Result<String> {
        let session_config = oai_realtime::SessionResource {
            modalities: Some(vec!["text".to_string()]),
            input_audio_format: Some(oai_realtime::AudioFormat::PCM16),
            input_audio_transcription: Some(oai_realtime::AudioTranscription {
                model: Some(self.transcription_model.clone()),
                ..Default::default()
            }),
            turn_detection: Some(oai_realtime::TurnDetection::ServerVAD {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 700,
                interrupt_response: Some(false),
                create_response: Some(false),
            }),
            ..Default::default()
        };
        let event = OAIClientEvent::SessionUpdate(oai_realtime::SessionUpdateEvent {
            session: session_config,
            event_id: None,
        });
        Ok(serde_json::to_string(&event)?)
    }

    async fn connect(&self) -> Result<RealtimeSocket> {
        let mut request = REALTIME_URL.into_client_request()?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {}", self.api_key).parse()?);
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (mut ws_stream, _) = connect_async(request)
            .await
            .context("Failed to connect to OpenAI Realtime WebSocket")?;
        ws_stream
            .send(WsMessage::Text(self.session_update()?.into()))
            .await?;
        Ok(ws_stream)
    }
}

#[async_trait]
impl SpeechRecognizer for OpenAIRealtimeRecognizer {
    async fn open_stream(&self, language_code: &str) -> Result<RecognizerStream, TranscriptionError> {
        let ws_stream = self
            .connect()
            .await
            .map_err(|e| TranscriptionError::Connect(format!("{:#}", e)))?;
        info!(%language_code, "Connected to OpenAI Realtime API for transcription.");

        let (audio_tx, audio_rx) = mpsc::unbounded_channel::<Bytes>();
        let (results_tx, results_rx) = mpsc::channel(64);

        let worker = tokio::spawn(async move {
            if let Err(e) = pump(ws_stream, audio_rx, &results_tx).await {
                warn!(error = %e, "Realtime transcription stream failed");
                let _ = results_tx
                    .send(Err(TranscriptionError::Stream(e.to_string())))
                    .await;
            }
        });

        Ok(RecognizerStream {
            audio: audio_tx,
            results: results_rx,
            worker: Some(worker),
        })
    }
}

/// Moves audio up and transcripts down until either side ends.
async fn pump(
    ws_stream: RealtimeSocket,
    mut audio_rx: mpsc::UnboundedReceiver<Bytes>,
    results_tx: &ResultSender,
) -> Result<()> {
    let (mut openai_tx, mut openai_rx) = ws_stream.split();
    let mut partial = String::new();
    loop {
        tokio::select! {
            biased;
            chunk = audio_rx.recv() => {
                let Some(chunk) = chunk else {
                    // Input ended; release the upstream connection.
                    let _ = openai_tx.send(WsMessage::Close(None)).await;
                    return Ok(());
                };
                let append = OAIClientEvent::InputAudioBufferAppend(
                    oai_realtime::InputAudioBufferAppendEvent {
                        audio: base64::engine::general_purpose::STANDARD.encode(&chunk),
                        event_id: None,
                    },
                );
                openai_tx
                    .send(WsMessage::Text(serde_json::to_string(&append)?.into()))
                    .await?;
            },
            msg = openai_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !forward_event(&text, &mut partial, results_tx).await {
                            return Ok(());
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        bail!("OpenAI closed the realtime connection: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => bail!("OpenAI realtime connection ended"),
                }
            },
        }
    }
}

/// Translates one server event. Returns false once the stream should end,
/// either because the consumer is gone or the server reported an error.
///
/// Deltas are accumulated so every partial result carries the whole
/// utterance heard so far.
async fn forward_event(text: &str, partial: &mut String, results_tx: &ResultSender) -> bool {
    let Ok(server_event) = serde_json::from_str::<OAIServerEvent>(text) else {
        return true;
    };
    let result = match server_event {
        OAIServerEvent::ConversationItemInputAudioTranscriptionDelta(e) => {
            partial.push_str(&e.delta);
            TranscriptionResult {
                transcript: partial.clone(),
                is_final: false,
            }
        }
        OAIServerEvent::ConversationItemInputAudioTranscriptionCompleted(e) => {
            partial.clear();
            TranscriptionResult {
                transcript: e.transcript,
                is_final: true,
            }
        }
        OAIServerEvent::Error(e) => {
            warn!(message = %e.error.message, "OpenAI realtime reported an error");
            // The session is no longer trustworthy; the consumer closes it.
            let _ = results_tx
                .send(Err(TranscriptionError::Stream(e.error.message)))
                .await;
            return false;
        }
        _ => return true,
    };
    debug!(is_final = result.is_final, "Transcription result");
    results_tx.send(Ok(result)).await.is_ok()
}
