//! # agent-runtime
//!
//! Runtime providers and tool-source transports for the agent system.
//!
//! ## Providers
//!
//! - **Ollama**: local inference via the native `/api/chat` endpoint
//! - **OpenAI**: the Responses API with streamed function calls
//!
//! ## Tool sources
//!
//! - **MCP**: stdio subprocesses and streamable-HTTP servers via `rmcp`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{OllamaProvider, RmcpConnector};
//!
//! let provider = Arc::new(OllamaProvider::from_env()?);
//! let channel = Arc::new(ExternalToolChannel::new(Arc::new(RmcpConnector::new()), provider.schema_dialect()));
//! let tools = ToolRegistry::build(provider.schema_dialect(), &channel, &sources, None).await;
//! let engine = EngineBuilder::new()
//!     .provider(provider)
//!     .tools(Arc::new(tools))
//!     .build()?;
//! ```

mod http;
pub mod mcp;
pub mod ollama;
pub mod openai;

pub use mcp::RmcpConnector;
pub use ollama::{OllamaConfig, OllamaProvider};
pub use openai::{OpenAiConfig, OpenAiProvider};

// Re-export core types for convenience
pub use agent_core::{
    AgentError, ConversationEngine, ConversationState, EngineBuilder, ExternalChannelConfig, ExternalToolChannel,
    LlmProvider, Result, Tool, ToolRegistry,
};
