use crate::agent::ChatAgent;
use crate::ai_sdk::unix_timestamp;
use crate::collaborators::{
    CompressionSettings, DEFAULT_CONTEXT_SIZE_LIMIT, RagSettings, TopicRoute,
};
use crate::confirmation::ConfirmationRegistry;
use crate::error::{ConfigError, CrewError};
use crate::protocol::{ModelEntry, ModelList, ModelsInformation, StatusResponse};
use crate::tools::engine::{ExecutionMode, ToolsAgent};
use tokio::sync::RwLock;
use crate::tools::{ConfirmationGate, ToolExecutor};
use axum::Json;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum_server::tls_rustls::RustlsConfig;
use std::collections::BTreeMap;
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

mod completions;
mod error;
mod memory;
mod operations;

use completions::StreamControl;
pub use error::ApiError;

/// Header carrying the caller's session key.
pub const SESSION_HEADER: &str = "x-session-id";
pub const SINGLE_AGENT_ID: &str = "single";

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Who approves server-side tool calls.
#[derive(Clone)]
pub enum ConfirmationMode {
    /// Every call runs without asking.
    Auto,
    /// Calls wait on the registry until an HTTP caller validates or cancels them.
    Web,
    Custom(Arc<dyn ConfirmationGate>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStage {
    ClientSideTools,
    ServerSideTools,
}

pub const DEFAULT_EXECUTION_ORDER: [ExecutionStage; 2] = [
    ExecutionStage::ClientSideTools,
    ExecutionStage::ServerSideTools,
];

/// Called with the gateway before or after each completion request.
pub type CompletionHook = Arc<dyn Fn(&Gateway) + Send + Sync>;

/// Chat agents by id, and the one serving requests no route claims.
struct Crew {
    agents: BTreeMap<String, Arc<ChatAgent>>,
    selected_id: String,
    selected: Arc<ChatAgent>,
}

struct ServerTools {
    agent: Arc<ToolsAgent>,
    executor: Arc<dyn ToolExecutor>,
    confirmation: ConfirmationMode,
    mode: ExecutionMode,
}

/// Shared state behind every route.
pub struct Gateway {
    crew: RwLock<Crew>,
    topic_route: Option<TopicRoute>,
    tools: Option<ServerTools>,
    client_tools: Option<Arc<ChatAgent>>,
    execution_order: Vec<ExecutionStage>,
    rag: Option<RagSettings>,
    compression: Option<CompressionSettings>,
    embeddings_model: Option<String>,
    registry: Arc<ConfirmationRegistry>,
    streams: StreamControl,
    api_key: Option<String>,
    before_completion: Option<CompletionHook>,
    after_completion: Option<CompletionHook>,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    pub fn registry(&self) -> &Arc<ConfirmationRegistry> {
        &self.registry
    }

    /// The selected agent: serves `/completion`, the memory routes, and
    /// every request topic routing does not claim.
    pub async fn default_agent(&self) -> Arc<ChatAgent> {
        Arc::clone(&self.crew.read().await.selected)
    }

    pub async fn selected_agent_id(&self) -> String {
        self.crew.read().await.selected_id.clone()
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.crew.read().await.agents.keys().cloned().collect()
    }

    pub async fn add_agent(&self, id: &str, agent: Arc<ChatAgent>) -> Result<(), CrewError> {
        if id.is_empty() {
            return Err(CrewError::EmptyId);
        }
        let mut crew = self.crew.write().await;
        if crew.agents.contains_key(id) {
            return Err(CrewError::AlreadyExists(id.to_string()));
        }
        crew.agents.insert(id.to_string(), agent);
        info!(agent = %id, "agent added to the crew");
        Ok(())
    }

    pub async fn remove_agent(&self, id: &str) -> Result<Arc<ChatAgent>, CrewError> {
        if id.is_empty() {
            return Err(CrewError::EmptyId);
        }
        let mut crew = self.crew.write().await;
        if crew.selected_id == id {
            return Err(CrewError::Selected(id.to_string()));
        }
        let agent = crew
            .agents
            .remove(id)
            .ok_or_else(|| CrewError::NotFound(id.to_string()))?;
        info!(agent = %id, "agent removed from the crew");
        Ok(agent)
    }

    pub async fn select_agent(&self, id: &str) -> Result<(), CrewError> {
        let mut crew = self.crew.write().await;
        let Some(agent) = crew.agents.get(id).cloned() else {
            return Err(CrewError::NotFound(id.to_string()));
        };
        crew.selected_id = id.to_string();
        crew.selected = agent;
        info!(agent = %id, "switched selected agent");
        Ok(())
    }

    pub fn context_size_limit(&self) -> usize {
        self.compression
            .as_ref()
            .map(|compression| compression.context_size_limit)
            .unwrap_or(DEFAULT_CONTEXT_SIZE_LIMIT)
    }

    /// Agent answering `query`: the topic route's pick, else the selected agent.
    pub(crate) async fn route_agent(&self, query: &str) -> Arc<ChatAgent> {
        let Some(route) = &self.topic_route else {
            return self.default_agent().await;
        };
        if query.trim().is_empty() {
            return self.default_agent().await;
        }

        let selected_id = self.selected_agent_id().await;
        let agent_id = route.select(query, &selected_id).await;
        let routed = self.crew.read().await.agents.get(&agent_id).cloned();
        match routed {
            Some(agent) => agent,
            None => {
                warn!(agent = %agent_id, "topic mapped to an unknown agent, using default");
                self.default_agent().await
            }
        }
    }

    pub(crate) fn before_completion(&self) {
        if let Some(hook) = &self.before_completion {
            hook(self);
        }
    }

    pub(crate) fn after_completion(&self) {
        if let Some(hook) = &self.after_completion {
            hook(self);
        }
    }

    /// `(model, owner)` pairs listed by `/v1/models`.
    async fn served_models(&self) -> Vec<(String, String)> {
        let mut models: Vec<(String, String)> = self
            .crew
            .read()
            .await
            .agents
            .iter()
            .map(|(id, agent)| (agent.model().to_string(), format!("toolgate:{}", id)))
            .collect();
        if let Some(tools) = &self.tools {
            models.push((tools.agent.model().to_string(), "toolgate:tools".to_string()));
        }
        models.retain(|(model, _)| !model.is_empty());
        models
    }
}

pub struct GatewayBuilder {
    agents: BTreeMap<String, Arc<ChatAgent>>,
    default_agent_id: Option<String>,
    topic_route: Option<TopicRoute>,
    tools: Option<(Arc<ToolsAgent>, Arc<dyn ToolExecutor>)>,
    confirmation: ConfirmationMode,
    client_tools: Option<Arc<ChatAgent>>,
    execution_order: Vec<ExecutionStage>,
    rag: Option<RagSettings>,
    compression: Option<CompressionSettings>,
    embeddings_model: Option<String>,
    registry: Option<Arc<ConfirmationRegistry>>,
    api_key: Option<String>,
    before_completion: Option<CompletionHook>,
    after_completion: Option<CompletionHook>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            agents: BTreeMap::new(),
            default_agent_id: None,
            topic_route: None,
            tools: None,
            confirmation: ConfirmationMode::Auto,
            client_tools: None,
            execution_order: DEFAULT_EXECUTION_ORDER.to_vec(),
            rag: None,
            compression: None,
            embeddings_model: None,
            registry: None,
            api_key: None,
            before_completion: None,
            after_completion: None,
        }
    }
}

impl GatewayBuilder {
    /// Single agent setup.
    pub fn with_agent(self, agent: Arc<ChatAgent>) -> Self {
        self.with_crew([(SINGLE_AGENT_ID.to_string(), agent)], SINGLE_AGENT_ID)
    }

    pub fn with_crew(
        mut self,
        agents: impl IntoIterator<Item = (String, Arc<ChatAgent>)>,
        default_agent_id: &str,
    ) -> Self {
        self.agents.extend(agents);
        self.default_agent_id = Some(default_agent_id.to_string());
        self
    }

    pub fn with_topic_route(mut self, route: TopicRoute) -> Self {
        self.topic_route = Some(route);
        self
    }

    pub fn with_tools(mut self, agent: Arc<ToolsAgent>, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some((agent, executor));
        self
    }

    pub fn with_confirmation(mut self, mode: ConfirmationMode) -> Self {
        self.confirmation = mode;
        self
    }

    /// Enables tool-call passthrough: request tools are offered to `detector`
    /// and detected calls go back to the caller unexecuted.
    pub fn with_client_side_tools(mut self, detector: Arc<ChatAgent>) -> Self {
        self.client_tools = Some(detector);
        self
    }

    pub fn with_execution_order(mut self, order: Vec<ExecutionStage>) -> Self {
        self.execution_order = order;
        self
    }

    pub fn with_rag(mut self, rag: RagSettings) -> Self {
        self.rag = Some(rag);
        self
    }

    pub fn with_compression(mut self, compression: CompressionSettings) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_embeddings_model(mut self, model: impl Into<String>) -> Self {
        self.embeddings_model = Some(model.into());
        self
    }

    pub fn with_registry(mut self, registry: Arc<ConfirmationRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    pub fn with_before_completion(mut self, hook: impl Fn(&Gateway) + Send + Sync + 'static) -> Self {
        self.before_completion = Some(Arc::new(hook));
        self
    }

    pub fn with_after_completion(mut self, hook: impl Fn(&Gateway) + Send + Sync + 'static) -> Self {
        self.after_completion = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Gateway, ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        let default_agent_id = self
            .default_agent_id
            .unwrap_or_else(|| SINGLE_AGENT_ID.to_string());
        let default_agent = self
            .agents
            .get(&default_agent_id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownDefaultAgent(default_agent_id.clone()))?;

        let tools = self.tools.map(|(agent, executor)| {
            let mode = if agent.parallel_tool_calls() {
                ExecutionMode::Parallel
            } else {
                ExecutionMode::Loop
            };
            ServerTools {
                agent,
                executor,
                confirmation: self.confirmation,
                mode,
            }
        });

        Ok(Gateway {
            crew: RwLock::new(Crew {
                agents: self.agents,
                selected_id: default_agent_id,
                selected: default_agent,
            }),
            topic_route: self.topic_route,
            tools,
            client_tools: self.client_tools,
            execution_order: self.execution_order,
            rag: self.rag,
            compression: self.compression,
            embeddings_model: self.embeddings_model,
            registry: self.registry.unwrap_or_default(),
            streams: StreamControl::default(),
            api_key: self.api_key,
            before_completion: self.before_completion,
            after_completion: self.after_completion,
        })
    }
}

pub enum TlsConfig {
    Files { cert: PathBuf, key: PathBuf },
    Pem { cert: Vec<u8>, key: Vec<u8> },
}

impl TlsConfig {
    async fn load(self) -> std::io::Result<RustlsConfig> {
        match self {
            Self::Files { cert, key } => RustlsConfig::from_pem_file(cert, key).await,
            Self::Pem { cert, key } => RustlsConfig::from_pem(cert, key).await,
        }
    }
}

pub struct ServerConfig {
    pub listen: String,
    pub tls: Option<TlsConfig>,
}

pub fn router(gateway: Arc<Gateway>) -> axum::Router {
    axum::Router::new()
        .route("/v1/chat/completions", post(completions::chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/models", get(models_information))
        .route("/completion", post(completions::completion))
        .route("/completion/stop", post(completions::stop_stream))
        .route("/memory/reset", post(memory::reset))
        .route("/memory/messages/list", get(memory::list_messages))
        .route("/memory/messages/context-size", get(memory::context_size))
        .route("/operation/validate", post(operations::validate))
        .route("/operation/cancel", post(operations::cancel))
        .route("/operation/reset", post(operations::reset))
        .route("/operation/pending", get(operations::pending))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&gateway),
            require_api_key,
        ))
        .layer(middleware::from_fn(cors))
        .with_state(gateway)
}

pub async fn run(gateway: Arc<Gateway>, config: ServerConfig) -> ServerResult<()> {
    let app = router(gateway);
    let listen = normalize_listen(&config.listen);

    match config.tls {
        Some(tls) => {
            let rustls = tls.load().await?;
            let address: SocketAddr = listen.parse()?;
            info!(address = %address, "toolgate listening on https");
            axum_server::bind_rustls(address, rustls)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(&listen).await?;
            info!(address = %listen, "toolgate listening on http");
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

/// `:8080` binds every interface.
pub fn normalize_listen(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    }
}

/// Session from the `x-session-id` header, or a fresh one.
pub(crate) fn session_id(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse::ok())
}

async fn list_models(State(gateway): State<Arc<Gateway>>) -> Json<ModelList> {
    let created = unix_timestamp();
    let data = gateway
        .served_models()
        .await
        .into_iter()
        .map(|(id, owned_by)| ModelEntry {
            id,
            object: "model".to_string(),
            created,
            owned_by,
        })
        .collect();
    Json(ModelList {
        object: "list".to_string(),
        data,
    })
}

async fn models_information(State(gateway): State<Arc<Gateway>>) -> Json<ModelsInformation> {
    let or_none = |model: Option<&str>| {
        model
            .filter(|model| !model.is_empty())
            .unwrap_or("none")
            .to_string()
    };
    let chat = gateway.default_agent().await;
    Json(ModelsInformation {
        status: "ok".to_string(),
        chat_model: or_none(Some(chat.model())),
        embeddings_model: or_none(gateway.embeddings_model.as_deref()),
        tools_model: or_none(gateway.tools.as_ref().map(|tools| tools.agent.model())),
    })
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Accept, X-Session-Id"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    response
}

async fn require_api_key(
    State(gateway): State<Arc<Gateway>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(api_key) = gateway.api_key.as_deref() else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    match authorize(request.headers(), api_key) {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

fn authorize(headers: &HeaderMap, token: &str) -> Result<(), ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(value) if value == token => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}
