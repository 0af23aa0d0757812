use crate::ai_sdk::{FunctionSpec, ToolKind, ToolSpec};
use crate::error::ToolError;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;

mod calculate_sum;
pub mod engine;
mod say_hello;

/// A function the model may call. Immutable once handed to an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    name: String,
    description: String,
    parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: json!({"type": "object", "properties": {}}),
        }
    }

    /// Builds a definition from a full JSON schema, such as one derived with schemars.
    pub fn from_schema(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        let mut parameters = schema;
        if let Some(object) = parameters.as_object_mut() {
            object.remove("$schema");
            object.remove("title");
        }
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(
        mut self,
        name: &str,
        kind: &str,
        description: &str,
        required: bool,
    ) -> Self {
        let Some(schema) = self.parameters.as_object_mut() else {
            return self;
        };

        if let Some(properties) = schema
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
        {
            properties.insert(
                name.to_string(),
                json!({"type": kind, "description": description}),
            );
        }

        if required {
            if let Some(list) = schema
                .entry("required")
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
            {
                list.push(Value::String(name.to_string()));
            }
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            kind: ToolKind::Function,
            function: FunctionSpec {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

/// Decision returned by a confirmation gate for a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed,
    Denied,
    Quit,
}

impl fmt::Display for ConfirmationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Confirmed => "confirmed",
            Self::Denied => "denied",
            Self::Quit => "quit",
        };
        f.write_str(label)
    }
}

/// Runs a named tool with JSON-encoded arguments and returns its JSON result.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, name: &str, arguments: &str) -> Result<String, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolExecutor for F
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, ToolError>> + Send,
{
    async fn execute(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
        (self)(name.to_string(), arguments.to_string()).await
    }
}

/// Approves, denies or aborts a tool call before it runs.
#[async_trait]
pub trait ConfirmationGate: Send + Sync {
    async fn confirm(&self, name: &str, arguments: &str) -> ConfirmationOutcome;
}

#[async_trait]
impl<F, Fut> ConfirmationGate for F
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = ConfirmationOutcome> + Send,
{
    async fn confirm(&self, name: &str, arguments: &str) -> ConfirmationOutcome {
        (self)(name.to_string(), arguments.to_string()).await
    }
}

/// Receives assistant content as it streams. `Break` stops the producer.
pub trait ContentSink: Send {
    fn push(&mut self, chunk: &str) -> ControlFlow<()>;
}

impl<F> ContentSink for F
where
    F: FnMut(&str) -> ControlFlow<()> + Send,
{
    fn push(&mut self, chunk: &str) -> ControlFlow<()> {
        (self)(chunk)
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;

type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
}

/// Name to handler table that doubles as a `ToolExecutor`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the bundled demo tools.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(calculate_sum::definition(), calculate_sum::calculate_sum_impl);
        registry.register(say_hello::definition(), say_hello::say_hello_impl);
        registry
    }

    pub fn register<F, Fut>(&mut self, definition: ToolDefinition, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.tools.retain(|tool| tool.definition.name() != definition.name());
        self.tools.push(RegisteredTool {
            definition,
            handler: Arc::new(move |input| Box::pin(handler(input))),
        });
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|tool| tool.definition.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, arguments: &str) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|tool| tool.definition.name() == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let input: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)?
        };
        (tool.handler)(input).await
    }
}
