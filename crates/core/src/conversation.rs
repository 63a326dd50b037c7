//! Conversation State Machine
//!
//! Governs turn-taking for one live connection. The machine is synchronous
//! and owns the connection's turn history; the live orchestrator feeds it
//! transcription results and turn completions and performs the side effects
//! it asks for.
//!
//! `Speaking` labels "assistant turn in flight", not a wait for client
//! playback: the transcription stream stays open in every state except `Idle`.

use crate::transcription::TranscriptionResult;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub sender: Sender,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Assistant,
            text: text.into(),
        }
    }
}

/// A finalized utterance ready to be handed to the decision collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// Identifies the conversation the utterance belongs to.
    pub epoch: u64,
    pub text: String,
    /// Turn history at dispatch time, ending with this utterance's user turn
    /// unless later utterances were queued behind it.
    pub history: Vec<ConversationTurn>,
}

/// What the orchestrator must do with a transcription result.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptAction {
    /// A partial result; forward it, touch nothing.
    Provisional,
    /// A final result with no words, or one arriving with no stream open.
    Ignored,
    /// A durable utterance: emit the stop-playback signal now, then start
    /// `dispatch` if present. Without it the utterance was queued behind the
    /// turn in flight.
    BargeIn { dispatch: Option<Utterance> },
}

#[derive(Debug)]
pub struct ConversationMachine {
    state: ConversationState,
    stream_live: bool,
    epoch: u64,
    turn_in_flight: bool,
    history: Vec<ConversationTurn>,
    pending: VecDeque<String>,
}

impl Default for ConversationMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationMachine {
    pub fn new() -> Self {
        Self {
            state: ConversationState::Idle,
            stream_live: false,
            epoch: 0,
            turn_in_flight: false,
            history: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a transcription stream is currently expected to be open.
    pub fn is_stream_live(&self) -> bool {
        self.stream_live
    }

    /// `start`: a new conversation with an empty history. Returns its epoch.
    pub fn start(&mut self) -> u64 {
        self.epoch += 1;
        self.history.clear();
        self.pending.clear();
        self.turn_in_flight = false;
        self.stream_live = true;
        self.state = ConversationState::Listening;
        debug!(epoch = self.epoch, "Conversation started");
        self.epoch
    }

    pub fn on_transcript(&mut self, result: &TranscriptionResult) -> TranscriptAction {
        if !result.is_final {
            return TranscriptAction::Provisional;
        }
        let text = result.transcript.trim();
        if text.is_empty() || !self.stream_live {
            return TranscriptAction::Ignored;
        }

        self.history.push(ConversationTurn::user(text));
        if self.turn_in_flight {
            self.pending.push_back(text.to_string());
            return TranscriptAction::BargeIn { dispatch: None };
        }
        TranscriptAction::BargeIn {
            dispatch: Some(self.dispatch(text.to_string())),
        }
    }

    fn dispatch(&mut self, text: String) -> Utterance {
        self.turn_in_flight = true;
        self.state = ConversationState::Thinking;
        Utterance {
            epoch: self.epoch,
            text,
            history: self.history.clone(),
        }
    }

    /// The decision collaborator answered for the turn in flight.
    pub fn on_decision(&mut self, epoch: u64) {
        if epoch == self.epoch && self.turn_in_flight {
            self.state = ConversationState::Speaking;
        }
    }

    /// The turn in flight finished. `spoken` is the verbal response whose
    /// audio was delivered, if any. Returns the next queued utterance.
    pub fn finish_turn(&mut self, epoch: u64, spoken: Option<String>) -> Option<Utterance> {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Ignoring turn from a previous conversation");
            return None;
        }
        if let Some(text) = spoken.filter(|t| !t.is_empty()) {
            self.history.push(ConversationTurn::assistant(text));
        }
        self.turn_in_flight = false;
        self.state = ConversationState::Listening;
        let next = self.pending.pop_front()?;
        Some(self.dispatch(next))
    }

    /// Explicit client interruption: the stream is discarded, nothing reopens
    /// it until the next `start`.
    pub fn interrupt(&mut self) {
        self.stream_live = false;
        if self.state != ConversationState::Idle && !self.turn_in_flight {
            self.state = ConversationState::Listening;
        }
    }

    /// The transcription stream failed and is gone.
    pub fn stream_failed(&mut self) {
        self.interrupt();
    }

    /// Connection closed: back to `Idle` with nothing retained.
    pub fn disconnect(&mut self) {
        self.epoch += 1;
        self.history.clear();
        self.pending.clear();
        self.turn_in_flight = false;
        self.stream_live = false;
        self.state = ConversationState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(text: &str) -> TranscriptionResult {
        TranscriptionResult {
            transcript: text.to_string(),
            is_final: false,
        }
    }

    fn final_(text: &str) -> TranscriptionResult {
        TranscriptionResult {
            transcript: text.to_string(),
            is_final: true,
        }
    }

    #[test]
    fn starts_idle() {
        let machine = ConversationMachine::new();
        assert_eq!(machine.state(), ConversationState::Idle);
        assert!(!machine.is_stream_live());
    }

    #[test]
    fn only_final_transcripts_become_turns() {
        let mut machine = ConversationMachine::new();
        machine.start();

        assert_eq!(machine.on_transcript(&partial("grav")), TranscriptAction::Provisional);
        assert_eq!(machine.on_transcript(&partial("gravity")), TranscriptAction::Provisional);
        let action = machine.on_transcript(&final_("gravity is"));

        match action {
            TranscriptAction::BargeIn { dispatch: Some(u) } => assert_eq!(u.text, "gravity is"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(machine.history(), &[ConversationTurn::user("gravity is")]);
        assert_eq!(machine.state(), ConversationState::Thinking);
    }

    #[test]
    fn whitespace_final_is_ignored() {
        let mut machine = ConversationMachine::new();
        machine.start();
        assert_eq!(machine.on_transcript(&final_("   \n")), TranscriptAction::Ignored);
        assert!(machine.history().is_empty());
        assert_eq!(machine.state(), ConversationState::Listening);
    }

    #[test]
    fn full_turn_cycle() {
        let mut machine = ConversationMachine::new();
        let epoch = machine.start();
        machine.on_transcript(&final_("hello"));
        machine.on_decision(epoch);
        assert_eq!(machine.state(), ConversationState::Speaking);

        assert!(machine.finish_turn(epoch, Some("hi there".to_string())).is_none());
        assert_eq!(machine.state(), ConversationState::Listening);
        assert_eq!(
            machine.history(),
            &[ConversationTurn::user("hello"), ConversationTurn::assistant("hi there")]
        );
    }

    #[test]
    fn unspoken_reply_is_not_recorded() {
        let mut machine = ConversationMachine::new();
        let epoch = machine.start();
        machine.on_transcript(&final_("hello"));
        machine.finish_turn(epoch, None);
        machine.on_transcript(&final_("again"));
        machine.finish_turn(epoch, Some(String::new()));
        assert_eq!(
            machine.history(),
            &[ConversationTurn::user("hello"), ConversationTurn::user("again")]
        );
    }

    #[test]
    fn utterances_queue_behind_turn_in_flight() {
        let mut machine = ConversationMachine::new();
        let epoch = machine.start();
        machine.on_transcript(&final_("first"));

        assert_eq!(
            machine.on_transcript(&final_("second")),
            TranscriptAction::BargeIn { dispatch: None }
        );

        let next = machine.finish_turn(epoch, Some("answer one".to_string())).unwrap();
        assert_eq!(next.text, "second");
        assert_eq!(machine.state(), ConversationState::Thinking);
        assert_eq!(
            next.history,
            vec![
                ConversationTurn::user("first"),
                ConversationTurn::user("second"),
                ConversationTurn::assistant("answer one"),
            ]
        );
    }

    #[test]
    fn start_resets_history() {
        let mut machine = ConversationMachine::new();
        let first = machine.start();
        machine.on_transcript(&final_("hello"));
        let second = machine.start();

        assert_ne!(first, second);
        assert!(machine.history().is_empty());
        // A late completion from the first conversation changes nothing.
        assert!(machine.finish_turn(first, Some("late".to_string())).is_none());
        assert!(machine.history().is_empty());
    }

    #[test]
    fn interruption_stops_accepting_transcripts() {
        let mut machine = ConversationMachine::new();
        machine.start();
        machine.interrupt();
        assert_eq!(machine.state(), ConversationState::Listening);
        assert!(!machine.is_stream_live());
        assert_eq!(machine.on_transcript(&final_("late words")), TranscriptAction::Ignored);
    }

    #[test]
    fn disconnect_discards_everything() {
        let mut machine = ConversationMachine::new();
        let epoch = machine.start();
        machine.on_transcript(&final_("hello"));
        machine.disconnect();
        assert_eq!(machine.state(), ConversationState::Idle);
        assert!(machine.history().is_empty());
        assert!(machine.finish_turn(epoch, Some("x".to_string())).is_none());
    }
}
