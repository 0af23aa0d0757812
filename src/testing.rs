use crate::agent::{AgentConfig, ChatAgent};
use crate::ai_sdk::{
    ChatCompletion, ChatCompletionChunk, ChatRequest, Delta, Message, Role, ToolCall,
};
use crate::client::{ChatBackend, ChunkStream};
use crate::error::ClientError;
use async_trait::async_trait;
use axum::response::Response;
use futures::StreamExt;
use futures::stream;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Backend that replays queued completions in order and records every request.
/// Streaming calls replay the same script as word-sized chunks.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    responses: Mutex<VecDeque<ChatCompletion>>,
    requests: Mutex<Vec<ChatRequest>>,
    streams_tool_calls: bool,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_streamed_tool_calls() -> Self {
        Self {
            streams_tool_calls: true,
            ..Self::default()
        }
    }

    pub(crate) async fn push(&self, completion: ChatCompletion) {
        self.responses.lock().await.push_back(completion);
    }

    pub(crate) async fn push_text(&self, content: &str) {
        self.push(ChatCompletion::new("chatcmpl-test", "backend", Message::assistant(content), "stop"))
            .await;
    }

    pub(crate) async fn push_tool_calls(&self, calls: Vec<ToolCall>) {
        self.push(ChatCompletion::new(
            "chatcmpl-test",
            "backend",
            Message::assistant_tool_calls("", calls),
            "tool_calls",
        ))
        .await;
    }

    pub(crate) async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }

    async fn next(&self, request: ChatRequest) -> Result<ChatCompletion, ClientError> {
        self.requests.lock().await.push(request);
        self.responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| ClientError::Status {
                status: 500,
                body: "no scripted response".to_string(),
            })
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, ClientError> {
        self.next(request).await
    }

    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ClientError> {
        let completion = self.next(request).await?;
        let mut chunks = vec![chunk(Delta::role(Role::Assistant), None)];
        let Some(choice) = completion.choices.into_iter().next() else {
            return Ok(stream::iter(chunks.into_iter().map(Ok)).boxed());
        };

        for word in choice.message.content.split_inclusive(' ') {
            chunks.push(chunk(Delta::content(word), None));
        }
        if !choice.message.tool_calls.is_empty() {
            chunks.push(chunk(Delta::tool_calls(&choice.message.tool_calls), None));
        }
        chunks.push(chunk(Delta::default(), choice.finish_reason.as_deref()));

        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    fn streams_tool_calls(&self) -> bool {
        self.streams_tool_calls
    }
}

fn chunk(delta: Delta, finish_reason: Option<&str>) -> ChatCompletionChunk {
    ChatCompletionChunk::new("chatcmpl-test", "backend", 0, delta, finish_reason)
}

pub(crate) fn chat_agent(backend: Arc<ScriptedBackend>, model: &str) -> Arc<ChatAgent> {
    Arc::new(ChatAgent::new(
        AgentConfig {
            name: format!("{}-agent", model),
            model: model.to_string(),
            system_instructions: String::new(),
            keep_conversation_history: false,
        },
        backend,
    ))
}

pub(crate) async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub(crate) async fn body_json(response: Response) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// `data:` payloads of an SSE body, in order.
pub(crate) fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}
