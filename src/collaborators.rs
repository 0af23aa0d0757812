use crate::agent::{ChatAgent, Conversation, ModelOptions};
use crate::ai_sdk::{Message, Role};
use crate::error::AgentError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RAG_CONTEXT_PREFIX: &str = "Relevant information to help you answer the question:\n";
pub const DEFAULT_SIMILARITY_LIMIT: f64 = 0.6;
pub const DEFAULT_MAX_SIMILARITIES: usize = 3;
pub const DEFAULT_CONTEXT_SIZE_LIMIT: usize = 8000;

pub const COMPRESSION_INSTRUCTIONS: &str = "You summarize conversations. Keep every fact, \
decision, name and number the assistant will need to continue. Answer with the summary only.";

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Similarity {
    pub prompt: String,
    pub score: f64,
}

/// Retrieval store queried for context before a completion.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search_top_n(
        &self,
        query: &str,
        threshold: f64,
        max_results: usize,
    ) -> Result<Vec<Similarity>, CollaboratorError>;
}

/// Summarizes a conversation that grew past the context limit.
#[async_trait]
pub trait ContextCompressor: Send + Sync {
    async fn compress(&self, messages: &[Message]) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait TopicRouter: Send + Sync {
    async fn identify_topic(&self, query: &str) -> Result<String, CollaboratorError>;
}

pub fn rag_context_message(similarities: &[Similarity]) -> Option<Message> {
    if similarities.is_empty() {
        return None;
    }
    let prompts: Vec<&str> = similarities
        .iter()
        .map(|similarity| similarity.prompt.as_str())
        .collect();
    Some(Message::system(format!(
        "{}{}",
        RAG_CONTEXT_PREFIX,
        prompts.join("\n---\n")
    )))
}

#[derive(Clone)]
pub struct RagSettings {
    pub store: Arc<dyn SimilaritySearch>,
    pub similarity_limit: f64,
    pub max_similarities: usize,
}

impl RagSettings {
    pub fn new(store: Arc<dyn SimilaritySearch>) -> Self {
        Self {
            store,
            similarity_limit: DEFAULT_SIMILARITY_LIMIT,
            max_similarities: DEFAULT_MAX_SIMILARITIES,
        }
    }

    /// Context message for `query`, or None when nothing relevant was found
    /// or the store failed.
    pub async fn context_for(&self, query: &str) -> Option<Message> {
        if query.trim().is_empty() {
            return None;
        }
        match self
            .store
            .search_top_n(query, self.similarity_limit, self.max_similarities)
            .await
        {
            Ok(similarities) => {
                debug!(found = similarities.len(), "similarity search done");
                rag_context_message(&similarities)
            }
            Err(err) => {
                warn!(error = %err, "similarity search failed, continuing without context");
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct CompressionSettings {
    pub compressor: Arc<dyn ContextCompressor>,
    pub context_size_limit: usize,
}

impl CompressionSettings {
    pub fn new(compressor: Arc<dyn ContextCompressor>) -> Self {
        Self {
            compressor,
            context_size_limit: DEFAULT_CONTEXT_SIZE_LIMIT,
        }
    }

    /// Replaces the conversation with a single summary message when its size
    /// plus `extra_chars` exceeds the limit. Returns whether it compressed.
    pub async fn compress_if_needed(&self, conversation: &mut Conversation, extra_chars: usize) -> bool {
        let size = conversation.context_size() + extra_chars;
        if size <= self.context_size_limit || conversation.is_empty() {
            return false;
        }

        match self.compressor.compress(conversation.messages()).await {
            Ok(summary) => {
                info!(before = size, after = summary.chars().count(), "conversation compressed");
                conversation.clear();
                conversation.push(Message::system(summary));
                true
            }
            Err(err) => {
                warn!(error = %err, "compression failed, keeping full history");
                false
            }
        }
    }
}

/// Compressor that asks a chat agent for the summary.
pub struct AgentCompressor {
    agent: Arc<ChatAgent>,
}

impl AgentCompressor {
    pub fn new(agent: Arc<ChatAgent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl ContextCompressor for AgentCompressor {
    async fn compress(&self, messages: &[Message]) -> Result<String, CollaboratorError> {
        let transcript = messages
            .iter()
            .map(|message| format!("{}: {}", role_label(message.role), message.content))
            .collect::<Vec<_>>()
            .join("\n");
        let completion = self
            .agent
            .generate_completion(&[Message::user(transcript)], &ModelOptions::default())
            .await?;
        Ok(completion.content)
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Developer => "developer",
        Role::Tool => "tool",
    }
}

/// Maps the topic of a question to one of the configured agents.
#[derive(Clone)]
pub struct TopicRoute {
    pub router: Arc<dyn TopicRouter>,
    agents_by_topic: HashMap<String, String>,
}

impl TopicRoute {
    pub fn new(router: Arc<dyn TopicRouter>) -> Self {
        Self {
            router,
            agents_by_topic: HashMap::new(),
        }
    }

    pub fn with_topic(mut self, topic: &str, agent_id: &str) -> Self {
        self.agents_by_topic
            .insert(topic.trim().to_lowercase(), agent_id.to_string());
        self
    }

    /// Agent id for `query`, falling back to `default_agent` on unknown topics
    /// or router failure.
    pub async fn select(&self, query: &str, default_agent: &str) -> String {
        let topic = match self.router.identify_topic(query).await {
            Ok(topic) => topic.trim().to_lowercase(),
            Err(err) => {
                warn!(error = %err, "topic detection failed, using default agent");
                return default_agent.to_string();
            }
        };

        match self.agents_by_topic.get(&topic) {
            Some(agent_id) => {
                debug!(topic = %topic, agent = %agent_id, "routed by topic");
                agent_id.clone()
            }
            None => default_agent.to_string(),
        }
    }
}
