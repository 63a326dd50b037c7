//! Domain core of the tutoring service: the command-stream protocol and the
//! two orchestration pipelines built on it.

pub mod command;
pub mod conversation;
pub mod decision;
pub mod documents;
pub mod llm_client;
pub mod parser;
pub mod presentation;
pub mod prompt;
pub mod speech;
pub mod transcription;

pub use command::{Command, CommandKind};
pub use conversation::{ConversationMachine, ConversationState, ConversationTurn, Sender};
pub use transcription::{TranscriptionResult, TranscriptionSession};
