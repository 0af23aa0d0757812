use crate::ai_sdk::{ChatCompletionChunk, Message, ToolCall};
use crate::confirmation::{PendingSummary, ToolCallNotification};
use serde::{Deserialize, Serialize};

/// Body of `POST /completion`: `{"data": {"message": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub data: CompletionData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionData {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            message: None,
        }
    }

    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResponse {
    pub status: String,
    pub operation_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: String,
    pub count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperationsResponse {
    pub operations: Vec<PendingSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSizeResponse {
    pub messages_count: usize,
    pub characters_count: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsInformation {
    pub status: String,
    pub chat_model: String,
    pub embeddings_model: String,
    pub tools_model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub owned_by: String,
}

/// Chunk carrying a pending confirmation. Plain OpenAI clients see an empty
/// delta and ignore the extension field.
#[derive(Debug, Clone, Serialize)]
pub struct PendingOperationChunk {
    #[serde(flatten)]
    pub chunk: ChatCompletionChunk,
    pub pending_operation: ToolCallNotification,
}

/// Events of the `/completion` envelope stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EnvelopeEvent {
    Message {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    ToolCalls {
        tool_calls: Vec<ToolCall>,
    },
    Notification {
        kind: String,
        status: String,
        operation_id: String,
        function_name: String,
        arguments: String,
        message: String,
    },
    Error {
        error: String,
    },
}

/// What a completion run produces, independent of the wire framing.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Role,
    Content(String),
    ToolCalls(Vec<ToolCall>),
    PendingConfirmation(ToolCallNotification),
    ToolResults(String),
    Finish(String),
    Error(String),
    Done,
}
