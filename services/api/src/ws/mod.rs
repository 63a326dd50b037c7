//! WebSocket Session Management
//!
//! Real-time tutoring runs over two WebSocket endpoints, one per pipeline:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the connection lifecycle, from handshake to termination.
//! - `presentation`: The `start_session` flow feeding the Presentation Orchestrator.
//! - `live`: The Live Conversation Orchestrator.
//! - `sink`: The outbound half of a connection.
//! - `provider`: Handles connections to third-party real-time speech APIs.

pub mod live;
pub mod presentation;
pub mod protocol;
pub mod provider;
pub mod session;
pub mod sink;

pub use session::{live_ws_handler, presentation_ws_handler};
