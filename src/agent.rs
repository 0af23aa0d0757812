use crate::ai_sdk::{ChatCompletion, ChatRequest, Message, Role, ToolSpec};
use crate::client::ChatBackend;
use crate::error::{AgentError, ClientError};
use crate::tools::ContentSink;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub name: String,
    pub model: String,
    pub system_instructions: String,
    pub keep_conversation_history: bool,
}

/// Sampling settings forwarded to the backend when set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub parallel_tool_calls: Option<bool>,
    /// Only sent when the request offers tools.
    pub tool_choice: Option<Value>,
    pub stop: Option<Value>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
}

impl ModelOptions {
    /// Values in `overrides` win over the ones configured here.
    pub fn merged(&self, overrides: &ModelOptions) -> ModelOptions {
        ModelOptions {
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            parallel_tool_calls: overrides.parallel_tool_calls.or(self.parallel_tool_calls),
            tool_choice: overrides.tool_choice.clone().or_else(|| self.tool_choice.clone()),
            stop: overrides.stop.clone().or_else(|| self.stop.clone()),
            frequency_penalty: overrides.frequency_penalty.or(self.frequency_penalty),
            presence_penalty: overrides.presence_penalty.or(self.presence_penalty),
        }
    }

    pub fn from_request(request: &ChatRequest) -> Self {
        Self {
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            parallel_tool_calls: request.parallel_tool_calls,
            tool_choice: request.tool_choice.clone(),
            stop: request.stop.clone(),
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
        }
    }
}

/// Ordered message history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Total characters of message content.
    pub fn context_size(&self) -> usize {
        self.messages
            .iter()
            .map(|message| message.content.chars().count())
            .sum()
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
}

pub(crate) fn build_request(
    model: &str,
    system_instructions: &str,
    messages: &[Message],
    tools: Vec<ToolSpec>,
    options: &ModelOptions,
) -> ChatRequest {
    let mut all = Vec::with_capacity(messages.len() + 1);
    if !system_instructions.is_empty() {
        all.push(Message::system(system_instructions));
    }
    all.extend_from_slice(messages);

    let tool_choice = if tools.is_empty() {
        None
    } else {
        options.tool_choice.clone()
    };

    ChatRequest {
        model: model.to_string(),
        messages: all,
        tools,
        tool_choice,
        parallel_tool_calls: options.parallel_tool_calls,
        temperature: options.temperature,
        top_p: options.top_p,
        max_tokens: options.max_tokens,
        stop: options.stop.clone(),
        frequency_penalty: options.frequency_penalty,
        presence_penalty: options.presence_penalty,
        ..ChatRequest::default()
    }
}

/// Plain chat path: single completions over caller-supplied messages plus a
/// long-lived memory used by the session style endpoints.
pub struct ChatAgent {
    config: AgentConfig,
    options: ModelOptions,
    backend: Arc<dyn ChatBackend>,
    memory: Mutex<Conversation>,
}

impl ChatAgent {
    pub fn new(config: AgentConfig, backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            config,
            options: ModelOptions::default(),
            backend,
            memory: Mutex::new(Conversation::new()),
        }
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn system_instructions(&self) -> &str {
        &self.config.system_instructions
    }

    pub fn keeps_history(&self) -> bool {
        self.config.keep_conversation_history
    }

    fn request(&self, messages: &[Message], overrides: &ModelOptions) -> ChatRequest {
        build_request(
            &self.config.model,
            &self.config.system_instructions,
            messages,
            Vec::new(),
            &self.options.merged(overrides),
        )
    }

    pub async fn generate_completion(
        &self,
        messages: &[Message],
        overrides: &ModelOptions,
    ) -> Result<Completion, AgentError> {
        if messages.is_empty() {
            return Err(AgentError::NoMessages);
        }

        let completion = self.backend.complete(self.request(messages, overrides)).await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or(ClientError::EmptyChoices)?;

        Ok(Completion {
            content: choice.message.content,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }

    /// Single completion offering caller-supplied tools. The tools are only
    /// advertised, never executed here.
    pub async fn complete_with_tools(
        &self,
        messages: &[Message],
        tools: Vec<ToolSpec>,
        overrides: &ModelOptions,
    ) -> Result<ChatCompletion, AgentError> {
        if messages.is_empty() {
            return Err(AgentError::NoMessages);
        }

        let request = build_request(
            &self.config.model,
            &self.config.system_instructions,
            messages,
            tools,
            &self.options.merged(overrides),
        );
        let completion = self.backend.complete(request).await?;
        if completion.choices.is_empty() {
            return Err(ClientError::EmptyChoices.into());
        }
        Ok(completion)
    }

    /// Streams content into `sink`. A sink that breaks ends the call with
    /// [`AgentError::Halted`] and drops the backend stream.
    pub async fn generate_stream_completion(
        &self,
        messages: &[Message],
        overrides: &ModelOptions,
        sink: &mut dyn ContentSink,
    ) -> Result<Completion, AgentError> {
        if messages.is_empty() {
            return Err(AgentError::NoMessages);
        }

        let mut request = self.request(messages, overrides);
        request.stream = true;
        let mut stream = self.backend.complete_stream(request).await?;
        let mut content = String::new();
        let mut finish_reason = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for choice in chunk.choices {
                if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                    if sink.push(&text).is_break() {
                        debug!(agent = %self.config.name, "stream halted by consumer");
                        return Err(AgentError::Halted);
                    }
                    content.push_str(&text);
                }
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason;
                }
            }
        }

        Ok(Completion {
            content,
            finish_reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.memory.lock().await.messages().to_vec()
    }

    pub async fn add_message(&self, message: Message) {
        self.memory.lock().await.push(message);
    }

    pub async fn add_messages(&self, messages: Vec<Message>) {
        self.memory.lock().await.extend(messages);
    }

    /// Clears the memory. System instructions live on the config and survive.
    pub async fn reset_messages(&self) {
        self.memory.lock().await.clear();
    }

    /// Characters held in memory plus the system instructions.
    pub async fn context_size(&self) -> usize {
        self.memory.lock().await.context_size() + self.config.system_instructions.chars().count()
    }
}
