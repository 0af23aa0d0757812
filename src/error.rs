use thiserror::Error;

/// Failures talking to the chat completion backend.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("backend transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed backend payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("event stream is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("backend response carried no choices")]
    EmptyChoices,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no messages provided")]
    NoMessages,
    #[error("stream halted by consumer")]
    Halted,
}

/// Errors raised by a tool executor. The engine turns these into in-band
/// `{"error": ...}` tool results instead of propagating them.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

impl From<String> for ToolError {
    fn from(message: String) -> Self {
        Self::Failed(message)
    }
}

impl From<&str> for ToolError {
    fn from(message: &str) -> Self {
        Self::Failed(message.to_string())
    }
}

/// Invalid gateway wiring detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one chat agent is required")]
    NoAgents,
    #[error("default agent `{0}` is not part of the crew")]
    UnknownDefaultAgent(String),
    #[error("invalid value for {option}: {message}")]
    Invalid { option: &'static str, message: String },
}

/// Rejected changes to the crew of a running gateway.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CrewError {
    #[error("agent id must not be empty")]
    EmptyId,
    #[error("agent `{0}` is already part of the crew")]
    AlreadyExists(String),
    #[error("no agent `{0}` in the crew")]
    NotFound(String),
    #[error("agent `{0}` is the selected agent and cannot be removed")]
    Selected(String),
}
