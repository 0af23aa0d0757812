use crate::error::{AgentError, ClientError};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

/// OpenAI style error body: `{"error": {"message", "type", "code"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: Option<&'static str>,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: Some("invalid_api_key"),
            message: "Missing or invalid API key".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn error_type(&self) -> &'static str {
        match self.status {
            StatusCode::UNAUTHORIZED => "authentication_error",
            StatusCode::BAD_GATEWAY => "api_error",
            status if status.is_client_error() => "invalid_request_error",
            _ => "server_error",
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_request(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::NoMessages => Self::invalid_request(err.to_string()),
            AgentError::Client(ClientError::Status { status, body }) => {
                error!(status, "backend rejected completion");
                Self {
                    status: StatusCode::BAD_GATEWAY,
                    code: Some("backend_error"),
                    message: format!("backend returned {}: {}", status, body),
                }
            }
            AgentError::Client(other) => {
                error!(error = %other, "backend call failed");
                Self {
                    status: StatusCode::BAD_GATEWAY,
                    code: Some("backend_error"),
                    message: other.to_string(),
                }
            }
            AgentError::Halted => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.message,
                "type": self.error_type(),
                "code": self.code,
            }
        });
        (self.status, Json(body)).into_response()
    }
}
