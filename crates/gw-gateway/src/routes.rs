//! Route table assembly.

use axum::routing::{get, post};
use axum::Router;

use crate::chat;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(chat::health))
        .route("/v1/models", get(chat::list_models))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .with_state(state)
}
