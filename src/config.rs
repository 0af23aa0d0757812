use crate::agent::{AgentConfig, ChatAgent, ModelOptions};
use crate::client::{BackendConfig, ChatBackend, OpenAiBackend};
use crate::collaborators::{
    AgentCompressor, COMPRESSION_INSTRUCTIONS, CompressionSettings, DEFAULT_CONTEXT_SIZE_LIMIT,
};
use crate::error::ConfigError;
use crate::server::{ConfirmationMode, Gateway, ServerConfig, TlsConfig};
use crate::tools::ToolRegistry;
use crate::tools::engine::ToolsAgent;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:12434/engines/llama.cpp/v1";
pub const DEFAULT_CHAT_MODEL: &str = "ai/qwen2.5:1.5B-F16";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ToolMode {
    Parallel,
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Confirmation {
    Auto,
    Web,
}

#[derive(Debug, Parser)]
#[command(
    name = "toolgate",
    about = "OpenAI compatible chat gateway that runs or forwards tool calls",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "TOOLGATE_LISTEN",
        default_value = "0.0.0.0:8080",
        help = "Address to listen on; `:8080` binds every interface"
    )]
    pub listen: String,

    #[arg(
        long,
        env = "TOOLGATE_BACKEND_URL",
        default_value = DEFAULT_BACKEND_URL,
        help = "Base URL of the OpenAI compatible backend"
    )]
    pub backend_url: String,

    #[arg(long, env = "TOOLGATE_BACKEND_API_KEY", help = "Bearer token sent to the backend")]
    pub backend_api_key: Option<String>,

    #[arg(long, env = "TOOLGATE_CHAT_MODEL", default_value = DEFAULT_CHAT_MODEL)]
    pub chat_model: String,

    #[arg(
        long,
        env = "TOOLGATE_TOOLS_MODEL",
        help = "Model used for tool detection; enables server-side tools"
    )]
    pub tools_model: Option<String>,

    #[arg(long, env = "TOOLGATE_SYSTEM_INSTRUCTIONS", default_value = "")]
    pub system_instructions: String,

    #[arg(long, value_enum, env = "TOOLGATE_TOOL_MODE", default_value_t = ToolMode::Loop)]
    pub tool_mode: ToolMode,

    #[arg(
        long,
        value_enum,
        env = "TOOLGATE_CONFIRMATION",
        default_value_t = Confirmation::Auto,
        help = "`web` holds each tool call until /operation/validate or /operation/cancel"
    )]
    pub confirmation: Confirmation,

    #[arg(
        long,
        env = "TOOLGATE_CLIENT_SIDE_TOOLS",
        help = "Return tool calls for request tools to the caller instead of running them"
    )]
    pub client_side_tools: bool,

    #[arg(long, env = "TOOLGATE_KEEP_HISTORY")]
    pub keep_history: bool,

    #[arg(
        long,
        env = "TOOLGATE_CONTEXT_SIZE_LIMIT",
        default_value_t = DEFAULT_CONTEXT_SIZE_LIMIT,
        help = "Characters of history kept before it is summarized"
    )]
    pub context_size_limit: usize,

    #[arg(
        long,
        env = "TOOLGATE_API_KEY",
        help = "Bearer token required from callers on every route except /health"
    )]
    pub api_key: Option<String>,

    #[arg(long, env = "TOOLGATE_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "TOOLGATE_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    #[arg(
        long,
        env = "TOOLGATE_STREAMS_TOOL_CALLS",
        help = "The backend carries tool call deltas in streamed responses"
    )]
    pub streams_tool_calls: bool,
}

impl Cli {
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            base_url: self.backend_url.clone(),
            api_key: self.backend_api_key.clone().filter(|key| !key.is_empty()),
            streams_tool_calls: self.streams_tool_calls,
        }
    }

    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig::Files {
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid {
                    option: "--tls-cert/--tls-key",
                    message: "both files are required to enable TLS".to_string(),
                });
            }
        };

        Ok(ServerConfig {
            listen: self.listen.clone(),
            tls,
        })
    }

    fn agent_config(&self, name: &str, model: &str, system_instructions: &str) -> AgentConfig {
        AgentConfig {
            name: name.to_string(),
            model: model.to_string(),
            system_instructions: system_instructions.to_string(),
            keep_conversation_history: self.keep_history,
        }
    }

    pub fn build_gateway(&self) -> Result<Gateway, ConfigError> {
        self.build_gateway_with(Arc::new(OpenAiBackend::new(self.backend_config())))
    }

    /// Wires agents and collaborators around `backend`.
    pub fn build_gateway_with(&self, backend: Arc<dyn ChatBackend>) -> Result<Gateway, ConfigError> {
        if self.chat_model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                option: "--chat-model",
                message: "must not be empty".to_string(),
            });
        }

        let chat = ChatAgent::new(
            self.agent_config("chat", &self.chat_model, &self.system_instructions),
            Arc::clone(&backend),
        );
        let compressor = ChatAgent::new(
            AgentConfig {
                keep_conversation_history: false,
                ..self.agent_config("compressor", &self.chat_model, COMPRESSION_INSTRUCTIONS)
            },
            Arc::clone(&backend),
        );

        let mut builder = Gateway::builder()
            .with_agent(Arc::new(chat))
            .with_compression(CompressionSettings {
                compressor: Arc::new(AgentCompressor::new(Arc::new(compressor))),
                context_size_limit: self.context_size_limit,
            })
            .with_api_key(self.api_key.clone());

        let tools_model = self.tools_model.as_deref().filter(|model| !model.is_empty());
        if let Some(model) = tools_model {
            let registry = ToolRegistry::builtin();
            let agent = ToolsAgent::new(
                self.agent_config("tools", model, ""),
                Arc::clone(&backend),
                registry.definitions(),
            )
            .with_options(ModelOptions {
                parallel_tool_calls: Some(self.tool_mode == ToolMode::Parallel),
                ..ModelOptions::default()
            });
            let confirmation = match self.confirmation {
                Confirmation::Auto => ConfirmationMode::Auto,
                Confirmation::Web => ConfirmationMode::Web,
            };
            info!(model = %model, mode = ?self.tool_mode, confirmation = ?self.confirmation, "server-side tools enabled");
            builder = builder
                .with_tools(Arc::new(agent), Arc::new(registry))
                .with_confirmation(confirmation);
        }

        if self.client_side_tools {
            let model = tools_model.unwrap_or(&self.chat_model);
            let detector = ChatAgent::new(
                AgentConfig {
                    keep_conversation_history: false,
                    ..self.agent_config("client-tools", model, "")
                },
                Arc::clone(&backend),
            );
            info!(model = %model, "client-side tool passthrough enabled");
            builder = builder.with_client_side_tools(Arc::new(detector));
        }

        builder.build()
    }
}
