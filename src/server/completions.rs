use super::{ApiError, ConfirmationMode, ExecutionStage, Gateway, session_id};
use crate::agent::{ChatAgent, Conversation, ModelOptions};
use crate::ai_sdk::{
    ChatCompletion, ChatCompletionChunk, ChatRequest, Delta, Message, Role, ToolCall, ToolSpec,
    Usage, unix_timestamp,
};
use crate::confirmation::RegistryGate;
use crate::error::AgentError;
use crate::protocol::{
    CompletionRequest, EnvelopeEvent, PendingOperationChunk, StatusResponse, StopRequest,
    StreamEvent,
};
use crate::tools::ConfirmationGate;
use crate::tools::engine::{
    CallOutcome, DENIED_MESSAGE, FinishReason, HistoryScope, ToolCallResult, with_call_ids,
};
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUIT_MESSAGE: &str = "Tool execution was quit by user.";

/// Stop flags of the streams currently running, per session.
#[derive(Default)]
pub(crate) struct StreamControl {
    active: Mutex<HashMap<String, Vec<Arc<AtomicBool>>>>,
}

impl StreamControl {
    pub(crate) async fn begin(&self, session_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.active
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(Arc::clone(&flag));
        flag
    }

    pub(crate) async fn end(&self, session_id: &str, flag: &Arc<AtomicBool>) {
        let mut active = self.active.lock().await;
        if let Some(flags) = active.get_mut(session_id) {
            flags.retain(|candidate| !Arc::ptr_eq(candidate, flag));
            if flags.is_empty() {
                active.remove(session_id);
            }
        }
    }

    /// Raises the stop flag of every stream in `session_id`, or of every
    /// stream when no session is given. Returns how many were signalled.
    pub(crate) async fn stop(&self, session_id: Option<&str>) -> usize {
        let active = self.active.lock().await;
        let flags: Vec<&Arc<AtomicBool>> = match session_id {
            Some(session_id) => active.get(session_id).into_iter().flatten().collect(),
            None => active.values().flatten().collect(),
        };
        for flag in &flags {
            flag.store(true, Ordering::SeqCst);
        }
        flags.len()
    }
}

/// One request's worth of context, after routing, compression and retrieval.
pub(crate) struct Turn {
    session_id: String,
    /// Notification sink of this request alone; concurrent requests of one
    /// session never share it.
    sink_key: String,
    agent: Arc<ChatAgent>,
    history: Conversation,
    question: Option<Message>,
    /// Messages after the question, such as tool results of a passthrough call.
    trailing: Vec<Message>,
    tool_context: Vec<Message>,
    model: String,
    options: ModelOptions,
    request_messages: Vec<Message>,
    request_tools: Vec<ToolSpec>,
}

impl Turn {
    fn messages(&self) -> Vec<Message> {
        let mut messages = self.history.messages().to_vec();
        messages.extend(self.question.iter().cloned());
        messages.extend(self.trailing.iter().cloned());
        messages.extend(self.tool_context.iter().cloned());
        messages
    }

    fn prompt_chars(&self) -> usize {
        self.messages()
            .iter()
            .map(|message| message.content.chars().count())
            .sum::<usize>()
            + self.agent.system_instructions().chars().count()
    }
}

enum ToolStage {
    Skipped,
    Answered(String),
    Enriched(String),
}

struct DetectedCalls {
    content: String,
    calls: Vec<ToolCall>,
    usage: Option<Usage>,
}

struct StreamOutcome {
    finish_reason: String,
    content: String,
}

impl StreamOutcome {
    fn halted() -> Self {
        Self {
            finish_reason: FinishReason::Stop.to_string(),
            content: String::new(),
        }
    }
}

fn new_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

/// Text returned when server-side tools settled the turn without asking the
/// chat model again.
fn direct_answer(result: &ToolCallResult) -> String {
    if !result.last_assistant_message.is_empty() {
        return result.last_assistant_message.clone();
    }
    if result.last_outcome == Some(CallOutcome::Denied) {
        return DENIED_MESSAGE.to_string();
    }
    if !result.results.is_empty() {
        return result.results.join("\n");
    }
    if result.finish_reason == FinishReason::UserQuit {
        return QUIT_MESSAGE.to_string();
    }
    String::new()
}

fn text_completion(id: &str, turn: &Turn, content: String, finish_reason: &str) -> ChatCompletion {
    let usage = Usage::estimate(turn.prompt_chars(), content.chars().count());
    let mut completion =
        ChatCompletion::new(id, turn.model.as_str(), Message::assistant(content), finish_reason);
    completion.usage = Some(usage);
    completion
}

impl Gateway {
    async fn prepare_turn(
        &self,
        session_id: String,
        mut messages: Vec<Message>,
        agent: Option<Arc<ChatAgent>>,
        model: &str,
        options: ModelOptions,
        request_tools: Vec<ToolSpec>,
    ) -> Turn {
        self.before_completion();

        let request_messages = messages.clone();
        let question_index = messages.iter().rposition(|message| message.role == Role::User);
        let (question, trailing) = match question_index {
            Some(index) => {
                let trailing = messages.split_off(index + 1);
                (messages.pop(), trailing)
            }
            None => (None, Vec::new()),
        };
        let query = question
            .as_ref()
            .map(|message| message.content.clone())
            .unwrap_or_default();

        let agent = match agent {
            Some(agent) => agent,
            None => self.route_agent(&query).await,
        };

        let mut history = Conversation::from(messages);
        if let Some(compression) = &self.compression {
            let extra = agent.system_instructions().chars().count() + query.chars().count();
            compression.compress_if_needed(&mut history, extra).await;
        }
        if let Some(rag) = &self.rag {
            if let Some(context) = rag.context_for(&query).await {
                history.push(context);
            }
        }

        let model = if model.is_empty() {
            agent.model().to_string()
        } else {
            model.to_string()
        };

        let sink_key = format!("{}/{}", session_id, Uuid::new_v4().simple());
        Turn {
            session_id,
            sink_key,
            agent,
            history,
            question,
            trailing,
            tool_context: Vec::new(),
            model,
            options,
            request_messages,
            request_tools,
        }
    }

    async fn detect_client_tools(&self, turn: &Turn) -> Option<DetectedCalls> {
        let detector = self.client_tools.as_ref()?;
        if turn.request_tools.is_empty() {
            return None;
        }

        let completion = match detector
            .complete_with_tools(
                &turn.request_messages,
                turn.request_tools.clone(),
                &turn.options,
            )
            .await
        {
            Ok(completion) => completion,
            Err(err) => {
                warn!(error = %err, "client-side tool detection failed, continuing");
                return None;
            }
        };

        let usage = completion.usage;
        let choice = completion.choices.into_iter().next()?;
        if choice.message.tool_calls.is_empty() {
            return None;
        }

        info!(
            calls = choice.message.tool_calls.len(),
            "returning tool calls to the client"
        );
        Some(DetectedCalls {
            content: choice.message.content,
            calls: with_call_ids(choice.message.tool_calls),
            usage,
        })
    }

    async fn run_server_tools(&self, turn: &mut Turn) -> ToolStage {
        let Some(tools) = &self.tools else {
            return ToolStage::Skipped;
        };
        if tools.agent.tools().is_empty() || turn.question.is_none() {
            return ToolStage::Skipped;
        }

        let registry_gate;
        let gate: Option<&dyn ConfirmationGate> = match &tools.confirmation {
            ConfirmationMode::Auto => None,
            ConfirmationMode::Web => {
                registry_gate =
                    RegistryGate::new(Arc::clone(&self.registry), turn.sink_key.clone());
                Some(&registry_gate)
            }
            ConfirmationMode::Custom(gate) => Some(gate.as_ref()),
        };

        // Each request starts from its own messages, whatever the agent keeps.
        let result = tools
            .agent
            .run(
                turn.messages(),
                tools.mode,
                tools.executor.as_ref(),
                gate,
                None,
                HistoryScope::Request,
            )
            .await;

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "server-side tools failed, falling back to plain completion");
                return ToolStage::Skipped;
            }
        };

        info!(
            finish_reason = %result.finish_reason,
            results = result.results.len(),
            "server-side tools finished"
        );

        if result.tools_executed() || result.last_outcome == Some(CallOutcome::Failed) {
            let context = if result.last_assistant_message.is_empty() {
                result.results.join("\n")
            } else {
                result.last_assistant_message
            };
            turn.tool_context.push(Message::system(context.clone()));
            ToolStage::Enriched(context)
        } else {
            ToolStage::Answered(direct_answer(&result))
        }
    }

    /// Runs server-side tools while forwarding confirmation notifications of
    /// this session to the stream.
    async fn stream_server_tools(&self, turn: &mut Turn, emitter: &Emitter) -> ToolStage {
        if self.tools.is_none() {
            return ToolStage::Skipped;
        }

        let sink_key = turn.sink_key.clone();
        let mut notifications = self.registry.attach_sink(&sink_key).await;
        let stage = {
            let run = self.run_server_tools(turn);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    stage = &mut run => break stage,
                    Some(notification) = notifications.recv() => {
                        emitter.emit(StreamEvent::PendingConfirmation(notification));
                    }
                }
            }
        };
        self.registry.detach_sink(&sink_key).await;
        stage
    }

    async fn complete_turn(&self, turn: Turn) -> Result<ChatCompletion, ApiError> {
        let completion = self.answer_turn(turn).await;
        self.after_completion();
        completion
    }

    async fn answer_turn(&self, mut turn: Turn) -> Result<ChatCompletion, ApiError> {
        let id = new_completion_id();

        for stage in &self.execution_order {
            match stage {
                ExecutionStage::ClientSideTools => {
                    if let Some(detected) = self.detect_client_tools(&turn).await {
                        let usage = detected.usage.unwrap_or_else(|| {
                            Usage::estimate(turn.prompt_chars(), detected.content.chars().count())
                        });
                        let message = Message::assistant_tool_calls(detected.content, detected.calls);
                        let mut completion = ChatCompletion::new(
                            id.as_str(),
                            turn.model.as_str(),
                            message,
                            FinishReason::ToolCalls.as_str(),
                        );
                        completion.usage = Some(usage);
                        return Ok(completion);
                    }
                }
                ExecutionStage::ServerSideTools => {
                    if let ToolStage::Answered(text) = self.run_server_tools(&mut turn).await {
                        return Ok(text_completion(&id, &turn, text, FinishReason::Stop.as_str()));
                    }
                }
            }
        }

        let completion = turn
            .agent
            .generate_completion(&turn.messages(), &turn.options)
            .await?;
        Ok(text_completion(
            &id,
            &turn,
            completion.content,
            &completion.finish_reason,
        ))
    }

    async fn stream_turn(
        &self,
        turn: &mut Turn,
        emitter: &Emitter,
    ) -> Result<StreamOutcome, AgentError> {
        for stage in &self.execution_order {
            if emitter.cancelled() {
                return Ok(StreamOutcome::halted());
            }
            match stage {
                ExecutionStage::ClientSideTools => {
                    if let Some(detected) = self.detect_client_tools(turn).await {
                        if !detected.content.is_empty() {
                            emitter.emit(StreamEvent::Content(detected.content));
                        }
                        emitter.emit(StreamEvent::ToolCalls(detected.calls));
                        return Ok(StreamOutcome {
                            finish_reason: FinishReason::ToolCalls.to_string(),
                            content: String::new(),
                        });
                    }
                }
                ExecutionStage::ServerSideTools => {
                    match self.stream_server_tools(turn, emitter).await {
                        ToolStage::Answered(text) => {
                            if !text.is_empty() {
                                emitter.emit(StreamEvent::Content(text.clone()));
                            }
                            return Ok(StreamOutcome {
                                finish_reason: FinishReason::Stop.to_string(),
                                content: text,
                            });
                        }
                        ToolStage::Enriched(context) => {
                            emitter.emit(StreamEvent::ToolResults(context));
                        }
                        ToolStage::Skipped => {}
                    }
                }
            }
        }

        if emitter.cancelled() {
            return Ok(StreamOutcome::halted());
        }

        let mut sink = |chunk: &str| {
            if emitter.emit(StreamEvent::Content(chunk.to_string())) {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        };
        match turn
            .agent
            .generate_stream_completion(&turn.messages(), &turn.options, &mut sink)
            .await
        {
            Ok(completion) => Ok(StreamOutcome {
                finish_reason: completion.finish_reason,
                content: completion.content,
            }),
            Err(AgentError::Halted) => {
                debug!(session = %turn.session_id, "stream stopped");
                Ok(StreamOutcome::halted())
            }
            Err(err) => Err(err),
        }
    }

    async fn drive_stream(
        self: Arc<Self>,
        mut turn: Turn,
        framing: Framing,
        tx: mpsc::UnboundedSender<Event>,
        remember: bool,
    ) {
        let stop = self.streams.begin(&turn.session_id).await;
        let emitter = Emitter {
            tx,
            framing,
            stop: Arc::clone(&stop),
        };

        emitter.emit(StreamEvent::Role);
        match self.stream_turn(&mut turn, &emitter).await {
            Ok(outcome) => {
                if remember && turn.agent.keeps_history() && !outcome.content.is_empty() {
                    let mut exchange: Vec<Message> = turn.question.iter().cloned().collect();
                    exchange.push(Message::assistant(outcome.content));
                    turn.agent.add_messages(exchange).await;
                }
                emitter.finish(&outcome.finish_reason);
            }
            Err(err) => {
                warn!(error = %err, "streaming completion failed");
                emitter.send(&StreamEvent::Error(err.to_string()));
                emitter.send(&StreamEvent::Done);
            }
        }

        self.streams.end(&turn.session_id, &stop).await;
        self.after_completion();
    }
}

/// Wire format of a stream.
#[derive(Debug, Clone)]
enum Framing {
    OpenAi {
        id: String,
        model: String,
        created: u64,
    },
    Envelope,
}

fn data_event<T: Serialize>(value: &T) -> Event {
    Event::default().data(serde_json::to_string(value).unwrap_or_default())
}

impl Framing {
    fn encode(&self, event: &StreamEvent) -> Option<Event> {
        if *event == StreamEvent::Done {
            return Some(Event::default().data("[DONE]"));
        }
        match self {
            Self::OpenAi { id, model, created } => {
                let chunk = |delta: Delta, finish_reason: Option<&str>| {
                    ChatCompletionChunk::new(id.as_str(), model.as_str(), *created, delta, finish_reason)
                };
                match event {
                    StreamEvent::Role => Some(data_event(&chunk(Delta::role(Role::Assistant), None))),
                    StreamEvent::Content(text) => {
                        Some(data_event(&chunk(Delta::content(text.as_str()), None)))
                    }
                    StreamEvent::ToolCalls(calls) => {
                        Some(data_event(&chunk(Delta::tool_calls(calls), None)))
                    }
                    StreamEvent::PendingConfirmation(notification) => {
                        Some(data_event(&PendingOperationChunk {
                            chunk: chunk(Delta::default(), None),
                            pending_operation: notification.clone(),
                        }))
                    }
                    StreamEvent::ToolResults(_) => None,
                    StreamEvent::Finish(reason) => {
                        Some(data_event(&chunk(Delta::default(), Some(reason.as_str()))))
                    }
                    StreamEvent::Error(message) => Some(data_event(
                        &json!({"error": {"message": message, "type": "server_error"}}),
                    )),
                    StreamEvent::Done => None,
                }
            }
            Self::Envelope => {
                let envelope = match event {
                    StreamEvent::Role | StreamEvent::Done => return None,
                    StreamEvent::Content(text) => EnvelopeEvent::Message {
                        message: text.clone(),
                        finish_reason: None,
                    },
                    StreamEvent::ToolCalls(calls) => EnvelopeEvent::ToolCalls {
                        tool_calls: calls.clone(),
                    },
                    StreamEvent::PendingConfirmation(notification) => EnvelopeEvent::Notification {
                        kind: "tool_call".to_string(),
                        status: "pending".to_string(),
                        operation_id: notification.operation_id.clone(),
                        function_name: notification.function_name.clone(),
                        arguments: notification.arguments.clone(),
                        message: notification.message.clone(),
                    },
                    StreamEvent::ToolResults(context) => EnvelopeEvent::Message {
                        message: format!("<hr>{}<hr>", context),
                        finish_reason: None,
                    },
                    StreamEvent::Finish(reason) => EnvelopeEvent::Message {
                        message: String::new(),
                        finish_reason: Some(reason.clone()),
                    },
                    StreamEvent::Error(message) => EnvelopeEvent::Error {
                        error: message.clone(),
                    },
                };
                Some(data_event(&envelope))
            }
        }
    }
}

struct Emitter {
    tx: mpsc::UnboundedSender<Event>,
    framing: Framing,
    stop: Arc<AtomicBool>,
}

impl Emitter {
    fn cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Sends `event` unless the stream was stopped or the client left.
    fn emit(&self, event: StreamEvent) -> bool {
        if self.cancelled() {
            return false;
        }
        self.send(&event)
    }

    fn send(&self, event: &StreamEvent) -> bool {
        match self.framing.encode(event) {
            Some(frame) => self.tx.send(frame).is_ok(),
            None => true,
        }
    }

    /// Terminal chunk and `[DONE]`, attempted even after a stop.
    fn finish(&self, finish_reason: &str) {
        self.send(&StreamEvent::Finish(finish_reason.to_string()));
        self.send(&StreamEvent::Done);
    }
}

fn stream_events(
    gateway: Arc<Gateway>,
    turn: Turn,
    framing: Framing,
    remember: bool,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(gateway.drive_stream(turn, framing, tx, remember));

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

pub(crate) async fn chat_completions(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    if request.messages.is_empty() {
        return Err(ApiError::invalid_request("messages must not be empty"));
    }

    let options = ModelOptions::from_request(&request);
    let stream = request.stream;
    let turn = gateway
        .prepare_turn(
            session_id(&headers),
            request.messages,
            None,
            &request.model,
            options,
            request.tools,
        )
        .await;
    debug!(
        session = %turn.session_id,
        agent = %turn.agent.name(),
        stream,
        "chat completion request"
    );

    if stream {
        let framing = Framing::OpenAi {
            id: new_completion_id(),
            model: turn.model.clone(),
            created: unix_timestamp(),
        };
        return Ok(stream_events(gateway, turn, framing, false).into_response());
    }

    let completion = gateway.complete_turn(turn).await?;
    Ok(Json(completion).into_response())
}

/// Session style chat: the default agent's memory supplies the history.
pub(crate) async fn completion(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let question = request.data.message.trim().to_string();
    if question.is_empty() {
        return Err(ApiError::invalid_request("message must not be empty"));
    }

    let agent = gateway.default_agent().await;
    let mut messages = agent.messages().await;
    messages.push(Message::user(question));

    let turn = gateway
        .prepare_turn(
            session_id(&headers),
            messages,
            Some(agent),
            "",
            ModelOptions::default(),
            Vec::new(),
        )
        .await;
    Ok(stream_events(gateway, turn, Framing::Envelope, true).into_response())
}

pub(crate) async fn stop_stream(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let request: StopRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StopRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::invalid_request(format!("Invalid request body: {}", err)))?
    };

    let session = request.session_id.or_else(|| {
        headers
            .contains_key(super::SESSION_HEADER)
            .then(|| session_id(&headers))
    });
    let stopped = gateway.streams.stop(session.as_deref()).await;
    info!(session = ?session, stopped, "stop requested");

    let message = if stopped > 0 {
        "Stream stopped"
    } else {
        "No stream to stop"
    };
    Ok(Json(StatusResponse::ok_with(message)))
}
