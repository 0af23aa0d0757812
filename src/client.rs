use crate::ai_sdk::{ChatCompletion, ChatCompletionChunk, ChatRequest, ToolCall, ToolCallDelta};
use crate::error::ClientError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client as HttpClient;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk, ClientError>>;

/// An OpenAI Chat Completions compatible model provider.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatCompletion, ClientError>;

    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ClientError>;

    /// Whether streamed responses carry complete `tool_calls` deltas and a
    /// trustworthy finish reason. When false, callers that stream must issue
    /// a non-streaming follow-up to detect tool calls.
    fn streams_tool_calls(&self) -> bool {
        false
    }
}

pub struct BackendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub streams_tool_calls: bool,
}

#[derive(Clone)]
pub struct OpenAiBackend {
    base_url: String,
    api_key: Option<String>,
    streams_tool_calls: bool,
    http: HttpClient,
}

impl OpenAiBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            api_key: config.api_key.filter(|key| !key.is_empty()),
            streams_tool_calls: config.streams_tool_calls,
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response, ClientError> {
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(&self, mut request: ChatRequest) -> Result<ChatCompletion, ClientError> {
        request.stream = false;
        debug!(model = %request.model, messages = request.messages.len(), "backend completion");

        let response = self.post(&request).await?;
        let body = response.text().await?;
        let completion: ChatCompletion = serde_json::from_str(&body)?;
        if completion.choices.is_empty() {
            return Err(ClientError::EmptyChoices);
        }
        Ok(completion)
    }

    async fn complete_stream(&self, mut request: ChatRequest) -> Result<ChunkStream, ClientError> {
        request.stream = true;
        debug!(model = %request.model, messages = request.messages.len(), "backend stream");

        let response = self.post(&request).await?;
        Ok(decode_chunks(Box::pin(response.bytes_stream())).boxed())
    }

    fn streams_tool_calls(&self) -> bool {
        self.streams_tool_calls
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

struct DecodeState<S> {
    bytes: S,
    buffer: Vec<u8>,
    ready: VecDeque<Result<String, ClientError>>,
    finished: bool,
}

impl<S> DecodeState<S> {
    /// Moves every complete event out of the buffer. Events are only decoded
    /// as UTF-8 once whole, so a character split across reads survives.
    fn drain_events(&mut self) {
        while let Some(idx) = find_event_boundary(&self.buffer) {
            let raw_event: Vec<u8> = self.buffer.drain(..idx + 2).take(idx).collect();
            self.queue_event(&raw_event);
        }
    }

    fn queue_event(&mut self, raw_event: &[u8]) {
        match std::str::from_utf8(raw_event) {
            Ok(raw_event) => {
                if let Some(data) = extract_sse_data(raw_event) {
                    self.ready.push_back(Ok(data));
                }
            }
            Err(err) => self.ready.push_back(Err(ClientError::from(err))),
        }
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Turns a raw SSE byte stream into chat completion chunks, ending at `[DONE]`.
pub(crate) fn decode_chunks<S, B>(
    bytes: S,
) -> impl Stream<Item = Result<ChatCompletionChunk, ClientError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
{
    let state = DecodeState {
        bytes,
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            match state.ready.pop_front() {
                Some(Ok(data)) => {
                    if is_done_marker(&data) {
                        return None;
                    }
                    let item =
                        serde_json::from_str::<ChatCompletionChunk>(&data).map_err(ClientError::from);
                    return Some((item, state));
                }
                Some(Err(err)) => {
                    state.finished = true;
                    state.ready.clear();
                    return Some((Err(err), state));
                }
                None => {}
            }

            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    // `\r` never appears inside a multi-byte UTF-8 sequence.
                    state
                        .buffer
                        .extend(chunk.as_ref().iter().copied().filter(|byte| *byte != b'\r'));
                    state.drain_events();
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(ClientError::from(err)), state));
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    state.queue_event(&rest);
                }
            }
        }
    })
}

fn is_done_marker(data: &str) -> bool {
    data.trim() == "[DONE]"
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Reassembles tool calls from indexed stream fragments.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, ToolCall>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let call = self
                .calls
                .entry(delta.index)
                .or_insert_with(|| ToolCall::new(String::new(), String::new(), String::new()));
            if let Some(id) = delta.id.as_deref().filter(|id| !id.is_empty()) {
                call.id = id.to_string();
            }
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    call.function.name.push_str(name);
                }
                if let Some(arguments) = &function.arguments {
                    call.function.arguments.push_str(arguments);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn finish(self) -> Vec<ToolCall> {
        self.calls.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_sdk::{FunctionDelta, Message, Role};
    use httpmock::prelude::*;

    fn backend(server: &MockServer, api_key: Option<&str>) -> OpenAiBackend {
        OpenAiBackend::new(BackendConfig {
            base_url: format!("{}/v1/", server.base_url()),
            api_key: api_key.map(str::to_string),
            streams_tool_calls: false,
        })
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::user("hello")],
            ..ChatRequest::default()
        }
    }

    #[test]
    fn normalize_base_url_trims_trailing_slash() {
        assert_eq!(normalize_base_url("http://x/v1/"), "http://x/v1");
        assert_eq!(normalize_base_url("http://x/v1"), "http://x/v1");
    }

    #[test]
    fn extract_sse_data_joins_data_lines() {
        assert_eq!(extract_sse_data("event: x\ndata: a\ndata: b"), Some("a\nb".to_string()));
        assert_eq!(extract_sse_data(": keep-alive"), None);
    }

    #[tokio::test]
    async fn multibyte_characters_survive_split_reads() {
        let body = "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"café\"},\"finish_reason\":null}]}\n\ndata: [DONE]\n\n"
            .as_bytes();
        let split = body
            .windows(2)
            .position(|pair| pair == "é".as_bytes())
            .unwrap()
            + 1;
        let reads: Vec<Result<Vec<u8>, reqwest::Error>> =
            vec![Ok(body[..split].to_vec()), Ok(body[split..].to_vec())];

        let chunks: Vec<_> = decode_chunks(stream::iter(reads)).collect().await;
        assert_eq!(chunks.len(), 1);
        let chunk = chunks.into_iter().next().unwrap().unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("café"));
    }

    #[tokio::test]
    async fn invalid_utf8_in_an_event_is_an_error() {
        let reads: Vec<Result<Vec<u8>, reqwest::Error>> =
            vec![Ok(b"data: {\"id\":\"\xff\"}\n\ndata: [DONE]\n\n".to_vec())];

        let chunks: Vec<_> = decode_chunks(stream::iter(reads)).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(ClientError::Utf8(_))));
    }

    #[tokio::test]
    async fn complete_posts_bearer_request_and_parses_completion() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer secret")
                .body_includes("\"stream\":false");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"m",
                    "choices":[{"index":0,"message":{"role":"assistant","content":"hi there"},"finish_reason":"stop"}]}"#,
                );
        });

        let completion = backend(&server, Some("secret")).complete(request()).await.unwrap();
        mock.assert();
        let choice = completion.first_choice().unwrap();
        assert_eq!(choice.message.content, "hi there");
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn complete_maps_error_status() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("overloaded");
        });

        match backend(&server, None).complete(request()).await {
            Err(ClientError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn complete_rejects_empty_choices() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(r#"{"id":"x","choices":[]}"#);
        });

        let result = backend(&server, None).complete(request()).await;
        assert!(matches!(result, Err(ClientError::EmptyChoices)));
    }

    #[tokio::test]
    async fn complete_stream_yields_chunks_until_done() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .body_includes("\"stream\":true");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\r\n\r\n",
                    ": keep-alive\n\n",
                    "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
                    "data: {\"id\":\"c\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
                    "data: [DONE]\n\n",
                    "data: {\"id\":\"ignored\",\"choices\":[]}\n\n"
                ));
        });

        let stream = backend(&server, None).complete_stream(request()).await.unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 3);

        let chunks: Vec<ChatCompletionChunk> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));
        let text: String = chunks
            .iter()
            .filter_map(|chunk| chunk.choices[0].delta.content.clone())
            .collect();
        assert_eq!(text, "Hello");
        assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn accumulator_merges_fragments_by_index() {
        let mut accumulator = ToolCallAccumulator::default();
        accumulator.push(&[ToolCallDelta {
            index: 0,
            id: Some("call_1".to_string()),
            kind: None,
            function: Some(FunctionDelta {
                name: Some("calculate_sum".to_string()),
                arguments: Some("{\"a\":".to_string()),
            }),
        }]);
        accumulator.push(&[
            ToolCallDelta {
                index: 0,
                id: None,
                kind: None,
                function: Some(FunctionDelta {
                    name: None,
                    arguments: Some("40,\"b\":2}".to_string()),
                }),
            },
            ToolCallDelta {
                index: 1,
                id: Some("call_2".to_string()),
                kind: None,
                function: Some(FunctionDelta {
                    name: Some("say_hello".to_string()),
                    arguments: Some("{}".to_string()),
                }),
            },
        ]);

        let calls = accumulator.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments(), "{\"a\":40,\"b\":2}");
        assert_eq!(calls[1].name(), "say_hello");
    }
}
