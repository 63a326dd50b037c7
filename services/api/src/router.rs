//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, both WebSocket endpoints, and OpenAPI documentation.

use crate::{
    handlers,
    models::{ErrorResponse, Message, MessageSender, Session},
    state::AppState,
    ws::{live_ws_handler, presentation_ws_handler},
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_sessions,
        handlers::get_session,
        handlers::session_messages,
    ),
    components(
        schemas(Session, Message, MessageSender, ErrorResponse)
    ),
    tags(
        (name = "Zipo API", description = "Session history for the Zipo tutoring service")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}/messages", get(handlers::session_messages))
        .route("/ws", get(presentation_ws_handler))
        .route("/ws/live", get(live_ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
