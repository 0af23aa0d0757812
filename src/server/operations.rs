use super::{ApiError, Gateway};
use crate::protocol::{OperationRequest, OperationResponse, PendingOperationsResponse, ResetResponse};
use crate::tools::ConfirmationOutcome;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::info;

pub(crate) async fn validate(
    State(gateway): State<Arc<Gateway>>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    decide(&gateway, request, ConfirmationOutcome::Confirmed).await
}

pub(crate) async fn cancel(
    State(gateway): State<Arc<Gateway>>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    decide(&gateway, request, ConfirmationOutcome::Denied).await
}

async fn decide(
    gateway: &Gateway,
    request: OperationRequest,
    outcome: ConfirmationOutcome,
) -> Result<Response, ApiError> {
    let operation_id = request.operation_id.trim().to_string();
    if operation_id.is_empty() {
        return Err(ApiError::invalid_request("operation_id is required"));
    }

    if !gateway.registry().resolve(&operation_id, outcome).await {
        let body = OperationResponse {
            status: "not_found".to_string(),
            message: format!("❌ Operation {} not found", operation_id),
            operation_id,
        };
        return Ok((StatusCode::NOT_FOUND, Json(body)).into_response());
    }

    let message = match outcome {
        ConfirmationOutcome::Confirmed => format!("✅ Operation {} validated", operation_id),
        ConfirmationOutcome::Denied => format!("⛔️ Operation {} cancelled", operation_id),
        ConfirmationOutcome::Quit => format!("🛑 Operation {} aborted", operation_id),
    };
    Ok(Json(OperationResponse {
        status: "ok".to_string(),
        operation_id,
        message,
    })
    .into_response())
}

pub(crate) async fn reset(State(gateway): State<Arc<Gateway>>) -> Json<ResetResponse> {
    let count = gateway.registry().reset_all().await;
    info!(count, "pending operations reset");
    Json(ResetResponse {
        status: "ok".to_string(),
        count,
        message: format!("🔄 All pending operations cancelled ({} operations)", count),
    })
}

pub(crate) async fn pending(State(gateway): State<Arc<Gateway>>) -> Json<PendingOperationsResponse> {
    Json(PendingOperationsResponse {
        operations: gateway.registry().pending().await,
    })
}

#[cfg(test)]
mod tests {
    use crate::confirmation::ConfirmationRegistry;
    use crate::server::{Gateway, router};
    use crate::testing::{ScriptedBackend, body_json, chat_agent};
    use crate::tools::ConfirmationOutcome;
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(registry: Arc<ConfirmationRegistry>) -> axum::Router {
        router(Arc::new(
            Gateway::builder()
                .with_agent(chat_agent(Arc::new(ScriptedBackend::new()), "chat-model"))
                .with_registry(registry)
                .build()
                .unwrap(),
        ))
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn validate_resolves_the_waiting_call() {
        let registry = Arc::new(ConfirmationRegistry::new());
        let decision = registry.register("op_1", "calculate_sum", "{}").await;

        let response = app(Arc::clone(&registry))
            .oneshot(post("/operation/validate", json!({"operation_id": "op_1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
        assert_eq!(decision.await.unwrap(), ConfirmationOutcome::Confirmed);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn cancel_denies_and_unknown_ids_are_not_found() {
        let registry = Arc::new(ConfirmationRegistry::new());
        let decision = registry.register("op_2", "say_hello", "{}").await;
        let app = app(Arc::clone(&registry));

        let response = app
            .clone()
            .oneshot(post("/operation/cancel", json!({"operation_id": "op_2"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(decision.await.unwrap(), ConfirmationOutcome::Denied);

        let missing = app
            .oneshot(post("/operation/validate", json!({"operation_id": "op_2"})))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(missing).await["status"], "not_found");
    }

    #[tokio::test]
    async fn reset_and_pending_listing() {
        let registry = Arc::new(ConfirmationRegistry::new());
        let _first = registry.register("op_a", "calculate_sum", "{}").await;
        let _second = registry.register("op_b", "say_hello", "{}").await;
        let app = app(Arc::clone(&registry));

        let listed = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/operation/pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(listed).await;
        assert_eq!(body["operations"].as_array().unwrap().len(), 2);

        let reset = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/operation/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(reset).await;
        assert_eq!(body["count"], 2);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn missing_operation_id_is_a_bad_request() {
        let response = app(Arc::new(ConfirmationRegistry::new()))
            .oneshot(post("/operation/validate", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
