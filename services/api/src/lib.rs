//! Zipo API Library Crate
//!
//! This library contains the web service around the tutoring core: the
//! application state, database access, REST handlers, WebSocket pipelines
//! and routing. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
