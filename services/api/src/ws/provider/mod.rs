//! Third-party streaming speech-to-text connections.

pub mod openai;

pub use openai::OpenAIRealtimeRecognizer;
