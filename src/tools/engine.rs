//! Tool-call state machine.
//!
//! Every entry point runs the same step: send the working history to the
//! backend, then branch on the finish reason. A `tool_calls` turn appends the
//! assistant message carrying the calls, then confirms and executes each call
//! in the order the model emitted them. `stop` records the final assistant
//! message. Parallel mode does one round, loop mode repeats until `stop`,
//! `user_quit` or a failure.

use crate::agent::{AgentConfig, Conversation, ModelOptions, build_request};
use crate::ai_sdk::{ChatRequest, Message, ToolCall};
use crate::client::{ChatBackend, ToolCallAccumulator};
use crate::error::{AgentError, ClientError};
use crate::tools::{ConfirmationGate, ConfirmationOutcome, ContentSink, ToolDefinition, ToolExecutor};
use futures::StreamExt;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_ROUNDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    UserQuit,
    ExitLoop,
    Unexpected(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::ToolCalls => "tool_calls",
            Self::UserQuit => "user_quit",
            Self::ExitLoop => "exit_loop",
            Self::Unexpected(raw) => raw,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the last processed call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Executed,
    Failed,
    Denied,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub finish_reason: FinishReason,
    pub results: Vec<String>,
    pub last_assistant_message: String,
    pub last_outcome: Option<CallOutcome>,
}

impl ToolCallResult {
    /// True when at least one result exists and the final call actually ran.
    pub fn tools_executed(&self) -> bool {
        !self.results.is_empty() && self.last_outcome == Some(CallOutcome::Executed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Parallel,
    Loop,
}

/// Which history a run starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    /// The agent's saved history, written back when `keep_conversation_history` is set.
    Agent,
    /// Only the messages handed to the run. The saved history is neither read nor written.
    Request,
}

pub const DENIED_MESSAGE: &str = "Tool execution was denied by user";

pub fn denied_payload() -> String {
    json!({"status": "denied", "message": DENIED_MESSAGE}).to_string()
}

pub fn empty_result_payload() -> String {
    json!({"error": "empty result"}).to_string()
}

fn failure_payload(err: &dyn std::error::Error) -> String {
    json!({"error": format!("Function execution failed: {}", err)}).to_string()
}

pub fn new_call_id() -> String {
    format!("call_{}", &Uuid::new_v4().simple().to_string()[..24])
}

struct Turn {
    content: String,
    finish_reason: Option<String>,
    tool_calls: Vec<ToolCall>,
}

#[derive(Default)]
struct RunState {
    results: Vec<String>,
    last_assistant_message: String,
    last_outcome: Option<CallOutcome>,
}

enum BatchFlow {
    Continue,
    Stop(FinishReason),
}

/// Agent that detects and runs tool calls. Holds a base history that is only
/// written back when `keep_conversation_history` is set.
pub struct ToolsAgent {
    config: AgentConfig,
    options: ModelOptions,
    backend: Arc<dyn ChatBackend>,
    tools: Vec<ToolDefinition>,
    max_rounds: usize,
    history: Mutex<Conversation>,
}

impl ToolsAgent {
    pub fn new(config: AgentConfig, backend: Arc<dyn ChatBackend>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            config,
            options: ModelOptions::default(),
            backend,
            tools,
            max_rounds: DEFAULT_MAX_ROUNDS,
            history: Mutex::new(Conversation::new()),
        }
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn parallel_tool_calls(&self) -> bool {
        self.options.parallel_tool_calls.unwrap_or(false)
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.history.lock().await.messages().to_vec()
    }

    pub async fn add_message(&self, message: Message) {
        self.history.lock().await.push(message);
    }

    pub async fn reset_messages(&self) {
        self.history.lock().await.clear();
    }

    pub async fn context_size(&self) -> usize {
        self.history.lock().await.context_size() + self.config.system_instructions.chars().count()
    }

    pub async fn detect_parallel_tool_calls(
        &self,
        messages: Vec<Message>,
        executor: &dyn ToolExecutor,
    ) -> Result<ToolCallResult, AgentError> {
        self.run(messages, ExecutionMode::Parallel, executor, None, None, HistoryScope::Agent)
            .await
    }

    pub async fn detect_parallel_tool_calls_with_confirmation(
        &self,
        messages: Vec<Message>,
        executor: &dyn ToolExecutor,
        gate: &dyn ConfirmationGate,
    ) -> Result<ToolCallResult, AgentError> {
        self.run(messages, ExecutionMode::Parallel, executor, Some(gate), None, HistoryScope::Agent)
            .await
    }

    pub async fn detect_tool_calls_loop(
        &self,
        messages: Vec<Message>,
        executor: &dyn ToolExecutor,
    ) -> Result<ToolCallResult, AgentError> {
        self.run(messages, ExecutionMode::Loop, executor, None, None, HistoryScope::Agent)
            .await
    }

    pub async fn detect_tool_calls_loop_with_confirmation(
        &self,
        messages: Vec<Message>,
        executor: &dyn ToolExecutor,
        gate: &dyn ConfirmationGate,
    ) -> Result<ToolCallResult, AgentError> {
        self.run(messages, ExecutionMode::Loop, executor, Some(gate), None, HistoryScope::Agent)
            .await
    }

    pub async fn detect_tool_calls_loop_stream(
        &self,
        messages: Vec<Message>,
        executor: &dyn ToolExecutor,
        sink: &mut dyn ContentSink,
    ) -> Result<ToolCallResult, AgentError> {
        self.run(messages, ExecutionMode::Loop, executor, None, Some(sink), HistoryScope::Agent)
            .await
    }

    pub async fn detect_tool_calls_loop_with_confirmation_stream(
        &self,
        messages: Vec<Message>,
        executor: &dyn ToolExecutor,
        gate: &dyn ConfirmationGate,
        sink: &mut dyn ContentSink,
    ) -> Result<ToolCallResult, AgentError> {
        self.run(
            messages,
            ExecutionMode::Loop,
            executor,
            Some(gate),
            Some(sink),
            HistoryScope::Agent,
        )
        .await
    }

    /// Shared core behind every entry point. Servers handling unrelated
    /// callers run with [`HistoryScope::Request`].
    pub async fn run(
        &self,
        messages: Vec<Message>,
        mode: ExecutionMode,
        executor: &dyn ToolExecutor,
        gate: Option<&dyn ConfirmationGate>,
        mut sink: Option<&mut dyn ContentSink>,
        scope: HistoryScope,
    ) -> Result<ToolCallResult, AgentError> {
        if messages.is_empty() {
            return Err(AgentError::NoMessages);
        }

        let mut working = match scope {
            HistoryScope::Agent => self.history.lock().await.clone().into_messages(),
            HistoryScope::Request => Vec::new(),
        };
        working.extend(messages);

        let mut state = RunState::default();
        let mut rounds = 0;

        let finish_reason = loop {
            if rounds == self.max_rounds {
                warn!(agent = %self.config.name, rounds, "round limit reached");
                break FinishReason::ExitLoop;
            }
            rounds += 1;
            debug!(agent = %self.config.name, round = rounds, messages = working.len(), "tool detection round");

            let turn = match sink.as_deref_mut() {
                Some(sink) => self.streamed_turn(&working, sink).await?,
                None => self.request_turn(&working).await?,
            };

            // Some backends report `stop` alongside tool calls, others omit the reason.
            let reason = if turn.tool_calls.is_empty() {
                turn.finish_reason.as_deref().unwrap_or("stop")
            } else {
                "tool_calls"
            };

            match reason {
                "tool_calls" => {
                    if turn.tool_calls.is_empty() {
                        warn!(agent = %self.config.name, "tool_calls finish without any calls");
                        break FinishReason::ToolCalls;
                    }

                    working.push(Message::assistant_tool_calls(
                        turn.content,
                        turn.tool_calls.clone(),
                    ));
                    let flow = self
                        .process_batch(&turn.tool_calls, &mut working, &mut state, executor, gate)
                        .await;
                    if let BatchFlow::Stop(reason) = flow {
                        break reason;
                    }
                    if mode == ExecutionMode::Parallel {
                        break FinishReason::ToolCalls;
                    }
                }
                "stop" => {
                    working.push(Message::assistant(turn.content.clone()));
                    state.last_assistant_message = turn.content;
                    break FinishReason::Stop;
                }
                other => {
                    error!(agent = %self.config.name, finish_reason = %other, "unexpected finish reason");
                    break FinishReason::Unexpected(other.to_string());
                }
            }
        };

        info!(
            agent = %self.config.name,
            finish_reason = %finish_reason,
            results = state.results.len(),
            "tool detection finished"
        );

        // Only persist histories where every emitted call has its result.
        let consistent = matches!(finish_reason, FinishReason::Stop | FinishReason::ToolCalls);
        if scope == HistoryScope::Agent && self.config.keep_conversation_history && consistent {
            *self.history.lock().await = Conversation::from(working);
        }

        Ok(ToolCallResult {
            finish_reason,
            results: state.results,
            last_assistant_message: state.last_assistant_message,
            last_outcome: state.last_outcome,
        })
    }

    fn request(&self, working: &[Message]) -> ChatRequest {
        build_request(
            &self.config.model,
            &self.config.system_instructions,
            working,
            self.tools.iter().map(ToolDefinition::to_spec).collect(),
            &self.options,
        )
    }

    async fn request_turn(&self, working: &[Message]) -> Result<Turn, AgentError> {
        let completion = self.backend.complete(self.request(working)).await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or(ClientError::EmptyChoices)?;

        Ok(Turn {
            content: choice.message.content,
            finish_reason: choice.finish_reason,
            tool_calls: with_call_ids(choice.message.tool_calls),
        })
    }

    async fn streamed_turn(
        &self,
        working: &[Message],
        sink: &mut dyn ContentSink,
    ) -> Result<Turn, AgentError> {
        let mut request = self.request(working);
        request.stream = true;
        let mut stream = self.backend.complete_stream(request).await?;
        let mut content = String::new();
        let mut finish_reason = None;
        let mut calls = ToolCallAccumulator::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for choice in chunk.choices {
                if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                    if sink.push(&text).is_break() {
                        return Err(AgentError::Halted);
                    }
                    content.push_str(&text);
                }
                if let Some(deltas) = &choice.delta.tool_calls {
                    calls.push(deltas);
                }
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason;
                }
            }
        }

        if self.backend.streams_tool_calls() {
            return Ok(Turn {
                content,
                finish_reason,
                tool_calls: with_call_ids(calls.finish()),
            });
        }

        // The stream cannot be trusted for tool calls here; ask again without streaming.
        let detected = self.request_turn(working).await?;
        Ok(Turn {
            content,
            finish_reason: detected.finish_reason,
            tool_calls: detected.tool_calls,
        })
    }

    async fn process_batch(
        &self,
        calls: &[ToolCall],
        working: &mut Vec<Message>,
        state: &mut RunState,
        executor: &dyn ToolExecutor,
        gate: Option<&dyn ConfirmationGate>,
    ) -> BatchFlow {
        for call in calls {
            info!(tool = %call.name(), call_id = %call.id, "processing tool call");

            let decision = match gate {
                Some(gate) => gate.confirm(call.name(), call.arguments()).await,
                None => ConfirmationOutcome::Confirmed,
            };

            let (content, outcome) = match decision {
                ConfirmationOutcome::Quit => {
                    warn!(tool = %call.name(), call_id = %call.id, "tool execution quit by user");
                    state.last_outcome = Some(CallOutcome::Quit);
                    return BatchFlow::Stop(FinishReason::UserQuit);
                }
                ConfirmationOutcome::Denied => {
                    warn!(tool = %call.name(), call_id = %call.id, "tool execution denied by user");
                    (denied_payload(), CallOutcome::Denied)
                }
                ConfirmationOutcome::Confirmed => {
                    match executor.execute(call.name(), call.arguments()).await {
                        Ok(result) if result.trim().is_empty() => {
                            warn!(tool = %call.name(), "tool returned an empty result");
                            (empty_result_payload(), CallOutcome::Executed)
                        }
                        Ok(result) => (result, CallOutcome::Executed),
                        Err(err) => {
                            error!(tool = %call.name(), error = %err, "tool execution failed");
                            (failure_payload(&err), CallOutcome::Failed)
                        }
                    }
                }
            };

            working.push(Message::tool(call.id.clone(), content.clone()));
            state.results.push(content);
            state.last_outcome = Some(outcome);

            if outcome == CallOutcome::Failed {
                return BatchFlow::Stop(FinishReason::ExitLoop);
            }
        }

        BatchFlow::Continue
    }
}

pub(crate) fn with_call_ids(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.is_empty() {
                call.id = new_call_id();
            }
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_sdk::Role;
    use crate::error::ToolError;
    use crate::testing::ScriptedBackend;
    use crate::tools::ToolRegistry;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::ops::ControlFlow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sum_call(id: &str, a: i64, b: i64) -> ToolCall {
        ToolCall::new(id, "calculate_sum", json!({"a": a, "b": b}).to_string())
    }

    fn agent(backend: Arc<ScriptedBackend>, keep_history: bool) -> ToolsAgent {
        ToolsAgent::new(
            AgentConfig {
                name: "tools".to_string(),
                model: "tools-model".to_string(),
                system_instructions: "Use tools.".to_string(),
                keep_conversation_history: keep_history,
            },
            backend,
            ToolRegistry::builtin().definitions(),
        )
    }

    /// Gate that replays a fixed sequence of decisions and counts prompts.
    struct ScriptedGate {
        decisions: std::sync::Mutex<VecDeque<ConfirmationOutcome>>,
        asked: AtomicUsize,
    }

    impl ScriptedGate {
        fn new(decisions: Vec<ConfirmationOutcome>) -> Self {
            Self {
                decisions: std::sync::Mutex::new(decisions.into()),
                asked: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ConfirmationGate for ScriptedGate {
        async fn confirm(&self, _name: &str, _arguments: &str) -> ConfirmationOutcome {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.decisions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ConfirmationOutcome::Confirmed)
        }
    }

    fn tool_messages(request: &ChatRequest) -> Vec<&Message> {
        request
            .messages
            .iter()
            .filter(|message| message.role == Role::Tool)
            .collect()
    }

    #[tokio::test]
    async fn parallel_mode_executes_batch_in_one_round_trip() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_tool_calls(vec![sum_call("call_1", 40, 2), sum_call("call_2", 1, 1)])
            .await;

        let registry = ToolRegistry::builtin();
        let result = agent(Arc::clone(&backend), false)
            .detect_parallel_tool_calls(vec![Message::user("sum 40 and 2, then 1 and 1")], &registry)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        assert_eq!(result.results, vec![r#"{"result":42}"#, r#"{"result":2}"#]);
        assert_eq!(result.last_outcome, Some(CallOutcome::Executed));
        assert!(result.tools_executed());
        assert!(result.last_assistant_message.is_empty());

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "tools-model");
        assert_eq!(requests[0].tools.len(), 2);
        assert_eq!(requests[0].messages[0], Message::system("Use tools."));
    }

    #[tokio::test]
    async fn loop_mode_feeds_results_back_until_stop() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_tool_calls(vec![sum_call("call_1", 40, 2)]).await;
        backend
            .push_tool_calls(vec![ToolCall::new("call_2", "say_hello", r#"{"name":"Bob"}"#)])
            .await;
        backend.push_text("The sum is 42 and Bob was greeted.").await;

        let registry = ToolRegistry::builtin();
        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop(vec![Message::user("sum 40 and 2 then greet Bob")], &registry)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.last_assistant_message, "The sum is 42 and Bob was greeted.");
        assert!(result.tools_executed());

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 3);

        // Each round carries the previous round's calls and results.
        let last = &requests[2];
        let tools = tool_messages(last);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tools[1].tool_call_id.as_deref(), Some("call_2"));
        let assistant_ids: Vec<&str> = last
            .messages
            .iter()
            .flat_map(|message| message.tool_calls.iter().map(|call| call.id.as_str()))
            .collect();
        assert_eq!(assistant_ids, vec!["call_1", "call_2"]);
    }

    #[tokio::test]
    async fn quit_halts_the_rest_of_the_batch() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_tool_calls(vec![
                sum_call("call_1", 1, 2),
                sum_call("call_2", 3, 4),
                sum_call("call_3", 5, 6),
            ])
            .await;

        let executed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executed);
        let executor = move |_name: String, _arguments: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ToolError>(r#"{"ok":true}"#.to_string())
            }
        };
        let gate = ScriptedGate::new(vec![ConfirmationOutcome::Confirmed, ConfirmationOutcome::Quit]);

        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop_with_confirmation(vec![Message::user("go")], &executor, &gate)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::UserQuit);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.last_outcome, Some(CallOutcome::Quit));
        assert!(!result.tools_executed());
        assert_eq!(executed.load(Ordering::SeqCst), 1);
        assert_eq!(gate.asked.load(Ordering::SeqCst), 2);
        assert_eq!(backend.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn denied_call_is_reported_and_sent_back_without_retry() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_tool_calls(vec![sum_call("call_1", 40, 2)]).await;
        backend.push_text("Understood, I will not add the numbers.").await;

        let registry = ToolRegistry::builtin();
        let gate = ScriptedGate::new(vec![ConfirmationOutcome::Denied]);
        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop_with_confirmation(vec![Message::user("sum 40 and 2")], &registry, &gate)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.last_outcome, Some(CallOutcome::Denied));
        assert!(!result.tools_executed());
        let denial: Value = serde_json::from_str(&result.results[0]).unwrap();
        assert_eq!(denial["status"], "denied");

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 2);
        let tools = tool_messages(&requests[1]);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tools[0].content, denied_payload());
        assert_eq!(gate.asked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executor_failure_stops_with_exit_loop() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push_tool_calls(vec![
                ToolCall::new("call_1", "missing_tool", "{}"),
                sum_call("call_2", 1, 1),
            ])
            .await;

        let registry = ToolRegistry::builtin();
        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop(vec![Message::user("go")], &registry)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::ExitLoop);
        assert_eq!(result.last_outcome, Some(CallOutcome::Failed));
        let error: Value = serde_json::from_str(&result.results[0]).unwrap();
        assert_eq!(
            error["error"],
            "Function execution failed: tool not found: missing_tool"
        );
        assert_eq!(result.results.len(), 1);
        assert_eq!(backend.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn empty_tool_result_is_normalized() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_tool_calls(vec![ToolCall::new("call_1", "noop", "{}")]).await;

        let executor = |_name: String, _arguments: String| async { Ok::<_, ToolError>("  ".to_string()) };
        let result = agent(backend, false)
            .detect_parallel_tool_calls(vec![Message::user("go")], &executor)
            .await
            .unwrap();

        assert_eq!(result.results, vec![empty_result_payload()]);
        assert_eq!(result.last_outcome, Some(CallOutcome::Executed));
    }

    #[tokio::test]
    async fn stop_without_tool_calls_returns_answer() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_text("No tools needed.").await;

        let registry = ToolRegistry::builtin();
        let result = agent(backend, false)
            .detect_parallel_tool_calls(vec![Message::user("hello")], &registry)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.last_assistant_message, "No tools needed.");
        assert!(result.results.is_empty());
        assert_eq!(result.last_outcome, None);
    }

    #[tokio::test]
    async fn unexpected_finish_reason_is_terminal() {
        let backend = Arc::new(ScriptedBackend::new());
        backend
            .push(crate::ai_sdk::ChatCompletion::new(
                "x",
                "m",
                Message::assistant("truncated"),
                "length",
            ))
            .await;

        let registry = ToolRegistry::builtin();
        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop(vec![Message::user("hello")], &registry)
            .await
            .unwrap();
        assert_eq!(result.finish_reason, FinishReason::Unexpected("length".to_string()));
        assert_eq!(backend.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn round_limit_bounds_loop_mode() {
        let backend = Arc::new(ScriptedBackend::new());
        for i in 0..3 {
            backend.push_tool_calls(vec![sum_call(&format!("call_{}", i), i, i)]).await;
        }

        let registry = ToolRegistry::builtin();
        let result = agent(Arc::clone(&backend), false)
            .with_max_rounds(2)
            .detect_tool_calls_loop(vec![Message::user("forever")], &registry)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::ExitLoop);
        assert_eq!(result.results.len(), 2);
        assert_eq!(backend.requests().await.len(), 2);
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let backend = Arc::new(ScriptedBackend::new());
        let registry = ToolRegistry::builtin();
        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop(Vec::new(), &registry)
            .await;
        assert!(matches!(result, Err(AgentError::NoMessages)));
        assert!(backend.requests().await.is_empty());
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let backend = Arc::new(ScriptedBackend::new());
        let registry = ToolRegistry::builtin();
        let result = agent(backend, false)
            .detect_tool_calls_loop(vec![Message::user("hello")], &registry)
            .await;
        assert!(matches!(result, Err(AgentError::Client(ClientError::Status { .. }))));
    }

    #[test]
    fn missing_call_ids_are_generated() {
        let calls = with_call_ids(vec![sum_call("", 1, 1), sum_call("keep", 1, 1)]);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].id.len(), "call_".len() + 24);
        assert_eq!(calls[1].id, "keep");
        assert_ne!(new_call_id(), new_call_id());
    }

    #[tokio::test]
    async fn history_is_kept_only_when_configured() {
        let registry = ToolRegistry::builtin();

        let backend = Arc::new(ScriptedBackend::new());
        backend.push_tool_calls(vec![sum_call("call_1", 1, 2)]).await;
        backend.push_text("3").await;
        let stateless = agent(Arc::clone(&backend), false);
        stateless
            .detect_tool_calls_loop(vec![Message::user("sum")], &registry)
            .await
            .unwrap();
        assert!(stateless.messages().await.is_empty());

        let backend = Arc::new(ScriptedBackend::new());
        backend.push_tool_calls(vec![sum_call("call_1", 1, 2)]).await;
        backend.push_text("3").await;
        let stateful = agent(Arc::clone(&backend), true);
        stateful
            .detect_tool_calls_loop(vec![Message::user("sum")], &registry)
            .await
            .unwrap();

        let history = stateful.messages().await;
        let roles: Vec<Role> = history.iter().map(|message| message.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(history[3].content, "3");

        stateful.reset_messages().await;
        assert!(stateful.messages().await.is_empty());
    }

    #[tokio::test]
    async fn request_scope_ignores_saved_history() {
        let registry = ToolRegistry::builtin();
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_tool_calls(vec![sum_call("call_1", 40, 2)]).await;
        backend.push_text("The sum is 42").await;
        backend.push_text("Hello Bob").await;

        let agent = agent(Arc::clone(&backend), true);
        agent.add_message(Message::user("earlier question")).await;

        for question in ["first sum", "second question"] {
            agent
                .run(
                    vec![Message::user(question)],
                    ExecutionMode::Loop,
                    &registry,
                    None,
                    None,
                    HistoryScope::Request,
                )
                .await
                .unwrap();
        }

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 3);
        let contents: Vec<&str> = requests[2]
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(contents, vec!["Use tools.", "second question"]);
        assert_eq!(agent.messages().await, vec![Message::user("earlier question")]);
    }

    #[tokio::test]
    async fn stream_variant_requeries_for_tool_calls() {
        let backend = Arc::new(ScriptedBackend::new());
        // Round 1: streamed content, then the follow-up detection finds a call.
        backend.push_text("Let me add.").await;
        backend.push_tool_calls(vec![sum_call("call_1", 40, 2)]).await;
        // Round 2: streamed answer, then the follow-up confirms `stop`.
        backend.push_text("The sum is 42").await;
        backend.push_text("The sum is 42").await;

        let registry = ToolRegistry::builtin();
        let mut streamed = String::new();
        let mut sink = |chunk: &str| {
            streamed.push_str(chunk);
            ControlFlow::Continue(())
        };
        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop_stream(vec![Message::user("sum 40 and 2")], &registry, &mut sink)
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.last_assistant_message, "The sum is 42");
        assert_eq!(result.results, vec![r#"{"result":42}"#]);
        assert_eq!(streamed, "Let me add.The sum is 42");

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 4);
        assert!(requests[0].stream);
        assert!(!requests[1].stream);
    }

    #[tokio::test]
    async fn stream_variant_uses_streamed_tool_calls_when_backend_supports_them() {
        let backend = Arc::new(ScriptedBackend::with_streamed_tool_calls());
        backend.push_tool_calls(vec![sum_call("call_1", 40, 2)]).await;
        backend.push_text("The sum is 42").await;

        let registry = ToolRegistry::builtin();
        let gate = ScriptedGate::new(vec![ConfirmationOutcome::Confirmed]);
        let mut sink = |_chunk: &str| ControlFlow::Continue(());
        let result = agent(Arc::clone(&backend), false)
            .detect_tool_calls_loop_with_confirmation_stream(
                vec![Message::user("sum 40 and 2")],
                &registry,
                &gate,
                &mut sink,
            )
            .await
            .unwrap();

        assert_eq!(result.finish_reason, FinishReason::Stop);
        assert_eq!(result.results, vec![r#"{"result":42}"#]);
        let requests = backend.requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|request| request.stream));
    }

    #[tokio::test]
    async fn stream_variant_halts_when_sink_breaks() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_text("a b c").await;

        let registry = ToolRegistry::builtin();
        let mut sink = |_chunk: &str| ControlFlow::Break(());
        let result = agent(backend, false)
            .detect_tool_calls_loop_stream(vec![Message::user("hi")], &registry, &mut sink)
            .await;
        assert!(matches!(result, Err(AgentError::Halted)));
    }
}
