//! Live Conversation Orchestrator
//!
//! Owns one connection's conversation: the state machine, the transcription
//! session and the turn pipeline. The socket loop feeds it client input,
//! transcription events and turn events; it performs the side effects.
//!
//! Turn pipelines run as spawned tasks so the loop keeps forwarding
//! transcripts (and barge-in signals) while a decision is pending. At most one
//! turn is in flight; later utterances wait in the state machine's queue.

use super::{protocol::ServerMessage, sink::ClientSink};
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zipo_core::{
    Command,
    conversation::{ConversationMachine, ConversationState, ConversationTurn, TranscriptAction, Utterance},
    decision::DecisionAgent,
    documents::SessionContextProvider,
    speech::{SpeechSynthesizer, synthesize_commands},
    transcription::{SessionEvent, SpeechRecognizer, TranscriptionEvent, TranscriptionSession},
};

/// Collaborators shared by every live connection.
#[derive(Clone)]
pub struct LiveServices {
    pub decision: Arc<dyn DecisionAgent>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub context: Arc<dyn SessionContextProvider>,
    pub default_language_code: String,
}

/// Progress reports from a spawned turn pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Decided { epoch: u64 },
    /// `spoken` is the verbal response whose audio reached the client.
    Finished { epoch: u64, spoken: Option<String> },
}

/// Receivers the socket loop must poll alongside the socket.
pub struct LiveEvents {
    pub transcription: mpsc::UnboundedReceiver<SessionEvent>,
    pub turns: mpsc::UnboundedReceiver<TurnEvent>,
}

/// Per-conversation data fixed at `start_conversation`.
#[derive(Clone)]
struct ActiveConversation {
    user_id: String,
    session_id: Uuid,
    language_code: String,
}

pub struct LiveConversation {
    services: LiveServices,
    sink: Arc<dyn ClientSink>,
    user_id: String,
    machine: ConversationMachine,
    transcription: Option<TranscriptionSession>,
    generation: u64,
    active: Option<ActiveConversation>,
    turn_task: Option<JoinHandle<()>>,
    transcription_tx: mpsc::UnboundedSender<SessionEvent>,
    turns_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl LiveConversation {
    pub fn new(
        services: LiveServices,
        sink: Arc<dyn ClientSink>,
        user_id: impl Into<String>,
    ) -> (Self, LiveEvents) {
        let (transcription_tx, transcription) = mpsc::unbounded_channel();
        let (turns_tx, turns) = mpsc::unbounded_channel();
        let conversation = Self {
            services,
            sink,
            user_id: user_id.into(),
            machine: ConversationMachine::new(),
            transcription: None,
            generation: 0,
            active: None,
            turn_task: None,
            transcription_tx,
            turns_tx,
        };
        (
            conversation,
            LiveEvents {
                transcription,
                turns,
            },
        )
    }

    pub fn state(&self) -> ConversationState {
        self.machine.state()
    }

    pub fn history(&self) -> &[ConversationTurn] {
        self.machine.history()
    }

    /// Starts (or restarts) the conversation for `session_id`.
    pub async fn start(&mut self, session_id: Uuid, language_code: Option<String>) {
        self.close_transcription();
        if let Some(task) = self.turn_task.take() {
            task.abort();
        }
        let language_code =
            language_code.unwrap_or_else(|| self.services.default_language_code.clone());

        // Ownership check; turns reload the context themselves.
        if let Err(e) = self.services.context.load(&self.user_id, session_id).await {
            warn!(%session_id, error = ?e, "Could not load conversation context");
            self.machine.disconnect();
            self.active = None;
            self.send(ServerMessage::ConversationError {
                message: format!("Failed to start conversation. {}", e),
            })
            .await;
            return;
        }

        let epoch = self.machine.start();
        self.generation += 1;
        self.active = Some(ActiveConversation {
            user_id: self.user_id.clone(),
            session_id,
            language_code: language_code.clone(),
        });

        match TranscriptionSession::open(
            self.services.recognizer.as_ref(),
            &language_code,
            self.generation,
            self.transcription_tx.clone(),
        )
        .await
        {
            Ok(session) => {
                self.transcription = Some(session);
                info!(%session_id, epoch, generation = self.generation, %language_code, "Live conversation started");
            }
            Err(e) => {
                warn!(%session_id, error = %e, "Could not open transcription stream");
                self.machine.stream_failed();
                self.send(ServerMessage::ConversationError {
                    message: format!("Speech recognition is unavailable. {}", e),
                })
                .await;
            }
        }
    }

    /// Forwards one chunk of PCM16 audio to the open transcription session.
    pub fn push_audio(&self, chunk: Bytes) {
        match &self.transcription {
            Some(session) => session.push(chunk),
            None => debug!("Dropping audio; no transcription session is open"),
        }
    }

    /// Same as [`push_audio`](Self::push_audio) for a base64 chunk.
    pub fn push_encoded_audio(&self, chunk: &str) {
        match base64::engine::general_purpose::STANDARD.decode(chunk) {
            Ok(bytes) => self.push_audio(Bytes::from(bytes)),
            Err(e) => warn!(error = %e, "Discarding audio chunk that is not valid base64"),
        }
    }

    /// Explicit client interruption.
    pub fn interrupt(&mut self) {
        self.close_transcription();
        self.machine.interrupt();
        info!("Live conversation interrupted by client");
    }

    pub async fn on_transcription(&mut self, event: SessionEvent) {
        let current = self.transcription.as_ref().map(TranscriptionSession::generation);
        if current != Some(event.generation) {
            debug!(generation = event.generation, "Dropping event from a closed transcription session");
            return;
        }

        match event.event {
            TranscriptionEvent::Result(result) => {
                self.send(ServerMessage::TranscriptUpdate {
                    transcript: result.transcript.clone(),
                    is_final: result.is_final,
                })
                .await;

                if let TranscriptAction::BargeIn { dispatch } = self.machine.on_transcript(&result) {
                    // Must reach the client before the decision is requested.
                    self.send(ServerMessage::StopAiPlayback).await;
                    match dispatch {
                        Some(utterance) => self.spawn_turn(utterance),
                        None => debug!("Utterance queued behind the turn in flight"),
                    }
                }
            }
            TranscriptionEvent::Error(e) => {
                warn!(error = %e, "Transcription stream failed");
                self.close_transcription();
                self.machine.stream_failed();
                self.send(ServerMessage::ConversationError {
                    message: format!("Speech recognition stopped. {}", e),
                })
                .await;
            }
            TranscriptionEvent::Closed => debug!("Transcription session closed"),
        }
    }

    pub async fn on_turn(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Decided { epoch } => self.machine.on_decision(epoch),
            TurnEvent::Finished { epoch, spoken } => {
                if epoch == self.machine.epoch() {
                    self.turn_task = None;
                }
                if let Some(next) = self.machine.finish_turn(epoch, spoken) {
                    self.spawn_turn(next);
                }
            }
        }
    }

    /// Connection closed.
    pub fn shutdown(&mut self) {
        self.close_transcription();
        if let Some(task) = self.turn_task.take() {
            task.abort();
        }
        self.machine.disconnect();
        self.active = None;
    }

    fn close_transcription(&mut self) {
        if let Some(mut session) = self.transcription.take() {
            session.close();
        }
    }

    fn spawn_turn(&mut self, utterance: Utterance) {
        let Some(active) = self.active.clone() else {
            return;
        };
        let turn = Turn {
            services: self.services.clone(),
            sink: self.sink.clone(),
            events: self.turns_tx.clone(),
            active,
        };
        self.turn_task = Some(tokio::spawn(turn.run(utterance)));
    }

    async fn send(&self, msg: ServerMessage) {
        if let Err(e) = self.sink.send(msg).await {
            debug!(error = ?e, "Client is gone; dropping event");
        }
    }
}

impl Drop for LiveConversation {
    fn drop(&mut self) {
        if let Some(task) = self.turn_task.take() {
            task.abort();
        }
    }
}

/// One utterance's pipeline: decide, optionally trigger a presentation, speak.
struct Turn {
    services: LiveServices,
    sink: Arc<dyn ClientSink>,
    events: mpsc::UnboundedSender<TurnEvent>,
    active: ActiveConversation,
}

impl Turn {
    async fn run(self, utterance: Utterance) {
        let epoch = utterance.epoch;
        let spoken = self.speak_reply(utterance).await;
        let _ = self.events.send(TurnEvent::Finished { epoch, spoken });
    }

    async fn speak_reply(&self, utterance: Utterance) -> Option<String> {
        let session_id = self.active.session_id;
        // Presentations created during the conversation must be visible here.
        let context = match self
            .services
            .context
            .load(&self.active.user_id, session_id)
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!(%session_id, error = ?e, "Could not refresh conversation context");
                self.send(ServerMessage::ConversationError {
                    message: format!("Failed to process your request. {}", e),
                })
                .await;
                return None;
            }
        };
        let decision = match self
            .services
            .decision
            .decide(
                &utterance.text,
                &utterance.history,
                &context.transcript,
                &context.documents,
            )
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(%session_id, error = ?e, "Decision collaborator failed");
                self.send(ServerMessage::ConversationError {
                    message: format!("Failed to process your request. {}", e),
                })
                .await;
                return None;
            }
        };
        let _ = self.events.send(TurnEvent::Decided {
            epoch: utterance.epoch,
        });

        if let Some(prompt) = decision.visualization_prompt() {
            info!(%session_id, "Decision requested a visualization");
            self.send(ServerMessage::TriggerVisualization {
                prompt: prompt.to_string(),
            })
            .await;
        }

        let verbal = decision.verbal_response.trim();
        if verbal.is_empty() {
            return None;
        }

        let synthesized = synthesize_commands(
            self.services.synthesizer.as_ref(),
            vec![Command::speak(verbal)],
            &self.active.language_code,
        )
        .await;
        let audio_content = synthesized.first().and_then(Command::audio_content)?;

        self.send(ServerMessage::AiAudioResponse {
            audio_content: audio_content.to_string(),
            transcript: verbal.to_string(),
        })
        .await;
        Some(verbal.to_string())
    }

    async fn send(&self, msg: ServerMessage) {
        if let Err(e) = self.sink.send(msg).await {
            debug!(error = ?e, "Client is gone; dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::sink::testing::RecordingSink;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use zipo_core::{
        decision::Decision,
        documents::SessionContext,
        speech::SynthesisError,
        transcription::{RecognizerStream, TranscriptionError, TranscriptionResult},
    };

    type ResultSender = mpsc::Sender<Result<TranscriptionResult, TranscriptionError>>;

    #[derive(Default)]
    struct FakeRecognizer {
        streams: Mutex<Vec<ResultSender>>,
    }

    impl FakeRecognizer {
        fn latest(&self) -> ResultSender {
            self.streams.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn open_stream(&self, _: &str) -> Result<RecognizerStream, TranscriptionError> {
            let (audio, _audio_rx) = mpsc::unbounded_channel();
            let (results_tx, results) = mpsc::channel(16);
            self.streams.lock().unwrap().push(results_tx);
            Ok(RecognizerStream {
                audio,
                results,
                worker: None,
            })
        }
    }

    /// Records every call together with what the client had received by then.
    struct FakeDecision {
        sink: Arc<RecordingSink>,
        reply: Decision,
        calls: Mutex<Vec<(String, Vec<ConversationTurn>, Vec<ServerMessage>)>>,
        contexts: Mutex<Vec<String>>,
    }

    impl FakeDecision {
        fn new(sink: Arc<RecordingSink>, reply: Decision) -> Self {
            Self {
                sink,
                reply,
                calls: Mutex::new(Vec::new()),
                contexts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DecisionAgent for FakeDecision {
        async fn decide(
            &self,
            utterance: &str,
            turns: &[ConversationTurn],
            session_context: &str,
            _documents: &str,
        ) -> Result<Decision> {
            self.calls
                .lock()
                .unwrap()
                .push((utterance.to_string(), turns.to_vec(), self.sink.sent()));
            self.contexts
                .lock()
                .unwrap()
                .push(session_context.to_string());
            Ok(self.reply.clone())
        }
    }

    struct FakeSynth {
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(&self, _: &str, _: &str) -> Result<String, SynthesisError> {
            if self.fail {
                Err(SynthesisError::Transient("quota".to_string()))
            } else {
                Ok("QVVESU8=".to_string())
            }
        }
    }

/// Owns every session of `user-1` except the nil id. Each load yields a
    /// fresh transcript so callers can tell loads apart.
    #[derive(Default)]
    struct FakeContext {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl SessionContextProvider for FakeContext {
        async fn load(&self, user_id: &str, session_id: Uuid) -> Result<SessionContext> {
            if user_id != "user-1" || session_id.is_nil() {
                return Err(anyhow!("Session not found"));
            }
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(SessionContext {
                transcript: format!("load-{}", n),
                documents: String::new(),
            })
        }
    }

    struct Harness {
        conversation: LiveConversation,
        events: LiveEvents,
        sink: Arc<RecordingSink>,
        recognizer: Arc<FakeRecognizer>,
        decision: Arc<FakeDecision>,
    }

    fn harness(reply: Decision, synth_fails: bool) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let recognizer = Arc::new(FakeRecognizer::default());
        let decision = Arc::new(FakeDecision::new(sink.clone(), reply));
        let services = LiveServices {
            decision: decision.clone(),
            synthesizer: Arc::new(FakeSynth { fail: synth_fails }),
            recognizer: recognizer.clone(),
            context: Arc::new(FakeContext::default()),
            default_language_code: "id-ID".to_string(),
        };
        let (conversation, events) = LiveConversation::new(services, sink.clone(), "user-1");
        Harness {
            conversation,
            events,
            sink,
            recognizer,
            decision,
        }
    }

    fn reply(text: &str) -> Decision {
        Decision {
            verbal_response: text.to_string(),
            ..Default::default()
        }
    }

    fn result(text: &str, is_final: bool) -> TranscriptionResult {
        TranscriptionResult {
            transcript: text.to_string(),
            is_final,
        }
    }

    impl Harness {
        async fn start(&mut self) {
            self.conversation.start(Uuid::new_v4(), None).await;
        }

        /// Feeds one recognizer result through the session and the conversation.
        /// Close notifications of replaced sessions are processed on the way.
        async fn hear(&mut self, text: &str, is_final: bool) {
            self.recognizer
                .latest()
                .send(Ok(result(text, is_final)))
                .await
                .unwrap();
            loop {
                let event = self.events.transcription.recv().await.unwrap();
                let is_result = matches!(event.event, TranscriptionEvent::Result(_));
                self.conversation.on_transcription(event).await;
                if is_result {
                    break;
                }
            }
        }

        /// Drives the turn in flight to completion.
        async fn finish_turn(&mut self) {
            loop {
                let event = self.events.turns.recv().await.unwrap();
                let done = matches!(event, TurnEvent::Finished { .. });
                self.conversation.on_turn(event).await;
                if done {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn partials_never_become_turns() {
        let mut h = harness(reply("It pulls things down."), false);
        h.start().await;

        h.hear("grav", false).await;
        h.hear("gravity", false).await;
        h.hear("gravity is", true).await;
        h.finish_turn().await;

        assert_eq!(
            h.conversation.history(),
            &[
                ConversationTurn::user("gravity is"),
                ConversationTurn::assistant("It pulls things down."),
            ]
        );
        let sent = h.sink.sent();
        assert_eq!(
            &sent[..4],
            &[
                ServerMessage::TranscriptUpdate {
                    transcript: "grav".to_string(),
                    is_final: false
                },
                ServerMessage::TranscriptUpdate {
                    transcript: "gravity".to_string(),
                    is_final: false
                },
                ServerMessage::TranscriptUpdate {
                    transcript: "gravity is".to_string(),
                    is_final: true
                },
                ServerMessage::StopAiPlayback,
            ]
        );
        assert_eq!(
            sent[4],
            ServerMessage::AiAudioResponse {
                audio_content: "QVVESU8=".to_string(),
                transcript: "It pulls things down.".to_string(),
            }
        );
        assert_eq!(h.conversation.state(), ConversationState::Listening);
    }

    #[tokio::test]
    async fn stop_playback_precedes_decision() {
        let mut h = harness(reply("Sure."), false);
        h.start().await;
        h.hear("tell me more", true).await;
        h.finish_turn().await;

        let calls = h.decision.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (utterance, turns, seen_by_client) = &calls[0];
        assert_eq!(utterance, "tell me more");
        assert_eq!(turns, &vec![ConversationTurn::user("tell me more")]);
        assert_eq!(seen_by_client.last(), Some(&ServerMessage::StopAiPlayback));
    }

    #[tokio::test]
    async fn whitespace_final_is_ignored() {
        let mut h = harness(reply("unused"), false);
        h.start().await;
        h.hear("   ", true).await;

        assert!(h.conversation.history().is_empty());
        assert!(h.decision.calls.lock().unwrap().is_empty());
        assert!(!h.sink.sent().contains(&ServerMessage::StopAiPlayback));
    }

    #[tokio::test]
    async fn visualization_is_requested_before_audio() {
        let decision = Decision {
            verbal_response: "Let me draw that.".to_string(),
            trigger_visualization: true,
            prompt_for_llm: Some("Diagram of orbital motion".to_string()),
        };
        let mut h = harness(decision, false);
        h.start().await;
        h.hear("show me an orbit", true).await;
        h.finish_turn().await;

        let sent = h.sink.sent();
        let trigger = sent
            .iter()
            .position(|m| matches!(m, ServerMessage::TriggerVisualization { .. }))
            .unwrap();
        let audio = sent
            .iter()
            .position(|m| matches!(m, ServerMessage::AiAudioResponse { .. }))
            .unwrap();
        assert!(trigger < audio);
        assert_eq!(
            sent[trigger],
            ServerMessage::TriggerVisualization {
                prompt: "Diagram of orbital motion".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failed_synthesis_records_no_assistant_turn() {
        let mut h = harness(reply("You cannot hear this."), true);
        h.start().await;
        h.hear("hello", true).await;
        h.finish_turn().await;

        assert_eq!(h.conversation.history(), &[ConversationTurn::user("hello")]);
        assert!(
            !h.sink
                .sent()
                .iter()
                .any(|m| matches!(m, ServerMessage::AiAudioResponse { .. }))
        );
    }

    #[tokio::test]
    async fn stream_error_is_reported_and_stops_listening() {
        let mut h = harness(reply("unused"), false);
        h.start().await;
        h.recognizer
            .latest()
            .send(Err(TranscriptionError::Stream("reset".to_string())))
            .await
            .unwrap();
        let event = h.events.transcription.recv().await.unwrap();
        h.conversation.on_transcription(event).await;

        assert!(
            h.sink
                .sent()
                .iter()
                .any(|m| matches!(m, ServerMessage::ConversationError { .. }))
        );
        // Anything still buffered from the dead stream is discarded.
        let stale = SessionEvent {
            generation: 1,
            event: TranscriptionEvent::Result(result("late", true)),
        };
        h.conversation.on_transcription(stale).await;
        assert!(h.conversation.history().is_empty());
    }

    #[tokio::test]
    async fn restart_discards_previous_stream_and_history() {
        let mut h = harness(reply("ok"), false);
        h.start().await;
        h.hear("first conversation", true).await;
        h.finish_turn().await;

        h.start().await;
        assert!(h.conversation.history().is_empty());

        let stale = SessionEvent {
            generation: 1,
            event: TranscriptionEvent::Result(result("old stream", true)),
        };
        h.conversation.on_transcription(stale).await;
        assert!(h.conversation.history().is_empty());

        h.hear("second conversation", true).await;
        assert_eq!(
            h.conversation.history(),
            &[ConversationTurn::user("second conversation")]
        );
    }

    #[tokio::test]
    async fn interruption_closes_the_stream() {
        let mut h = harness(reply("ok"), false);
        h.start().await;
        h.conversation.interrupt();

        assert_eq!(h.conversation.state(), ConversationState::Listening);
        let stale = SessionEvent {
            generation: 1,
            event: TranscriptionEvent::Result(result("after stop", true)),
        };
        h.conversation.on_transcription(stale).await;
        assert!(h.conversation.history().is_empty());
    }

    #[tokio::test]
    async fn every_turn_reloads_the_session_context() {
        let mut h = harness(reply("ok"), false);
        h.start().await;
        h.hear("first question", true).await;
        h.finish_turn().await;
        h.hear("second question", true).await;
        h.finish_turn().await;

        // load-0 was the ownership check at start.
        assert_eq!(*h.decision.contexts.lock().unwrap(), ["load-1", "load-2"]);
    }

    #[tokio::test]
    async fn failed_restart_resets_the_conversation() {
        let mut h = harness(reply("ok"), false);
        h.start().await;
        h.hear("are you there", true).await;
        assert_eq!(h.conversation.state(), ConversationState::Thinking);

        h.conversation.start(Uuid::nil(), None).await;

        assert_eq!(h.conversation.state(), ConversationState::Idle);
        assert!(h.conversation.history().is_empty());
        assert!(matches!(
            h.sink.sent().last(),
            Some(ServerMessage::ConversationError { .. })
        ));
    }

    #[tokio::test]
    async fn foreign_session_is_refused() {
        let sink = Arc::new(RecordingSink::default());
        let services = LiveServices {
            decision: Arc::new(FakeDecision::new(sink.clone(), reply("x"))),
            synthesizer: Arc::new(FakeSynth { fail: false }),
            recognizer: Arc::new(FakeRecognizer::default()),
            context: Arc::new(FakeContext::default()),
            default_language_code: "id-ID".to_string(),
        };
        let (mut conversation, _events) = LiveConversation::new(services, sink.clone(), "intruder");
        conversation.start(Uuid::new_v4(), None).await;

        assert_eq!(conversation.state(), ConversationState::Idle);
        assert!(matches!(
            sink.sent().as_slice(),
            [ServerMessage::ConversationError { .. }]
        ));
    }
}
