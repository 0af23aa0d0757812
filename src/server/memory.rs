use super::Gateway;
use crate::protocol::{ContextSizeResponse, MessagesResponse, StatusResponse};
use axum::Json;
use axum::extract::State;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn reset(State(gateway): State<Arc<Gateway>>) -> Json<StatusResponse> {
    let agent = gateway.default_agent().await;
    agent.reset_messages().await;
    info!(agent = %agent.name(), "memory reset");
    Json(StatusResponse::ok_with("Memory reset successfully"))
}

pub(crate) async fn list_messages(State(gateway): State<Arc<Gateway>>) -> Json<MessagesResponse> {
    let messages = gateway.default_agent().await.messages().await;
    Json(MessagesResponse { messages })
}

pub(crate) async fn context_size(State(gateway): State<Arc<Gateway>>) -> Json<ContextSizeResponse> {
    let agent = gateway.default_agent().await;
    Json(ContextSizeResponse {
        messages_count: agent.messages().await.len(),
        characters_count: agent.context_size().await,
        limit: gateway.context_size_limit(),
    })
}
