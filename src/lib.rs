//! # toolgate
//!
//! OpenAI compatible chat completions gateway that detects tool calls, runs
//! them server-side (optionally behind a human confirmation) or hands them
//! back to the caller, and streams the answer as Server-Sent Events.
//!
//! ## Layout
//!
//! - **`tools::engine`**: the tool-call loop (`ToolsAgent`), parallel or
//!   iterative, with or without a `ConfirmationGate`.
//! - **`confirmation`**: pending operations waiting on a decision, plus the
//!   per-session notification sinks used to announce them.
//! - **`server`**: the axum router, one completion pipeline for every mode.
//! - **`client`**: the `ChatBackend` seam and its reqwest implementation.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use toolgate::agent::{AgentConfig, ChatAgent};
//! use toolgate::client::{BackendConfig, OpenAiBackend};
//! use toolgate::server::{self, Gateway, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let backend = Arc::new(OpenAiBackend::new(BackendConfig {
//!         base_url: "http://localhost:12434/engines/llama.cpp/v1".to_string(),
//!         api_key: None,
//!         streams_tool_calls: false,
//!     }));
//!     let chat = ChatAgent::new(
//!         AgentConfig {
//!             name: "chat".to_string(),
//!             model: "ai/qwen2.5:1.5B-F16".to_string(),
//!             ..AgentConfig::default()
//!         },
//!         backend,
//!     );
//!     let gateway = Gateway::builder().with_agent(Arc::new(chat)).build()?;
//!
//!     server::run(
//!         Arc::new(gateway),
//!         ServerConfig {
//!             listen: "127.0.0.1:8080".to_string(),
//!             tls: None,
//!         },
//!     )
//!     .await
//! }
//! ```

pub mod agent;
pub mod ai_sdk;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod confirmation;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tools;

#[cfg(test)]
mod testing;
