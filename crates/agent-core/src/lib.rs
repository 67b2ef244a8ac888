//! # agent-core
//!
//! Provider-agnostic tool orchestration for LLM conversations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      ConversationEngine                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │ StreamDecoder│  │ ToolRegistry │  │     LlmProvider        │  │
//! │  │  (per model) │──│  + Schema    │──│     (Strategy)         │  │
//! │  └──────────────┘  └──────┬───────┘  └────────────────────────┘  │
//! │                           │                                      │
//! │                 ┌─────────┴──────────┐                           │
//! │                 │ ExternalToolChannel│ (one connection per call) │
//! │                 └────────────────────┘                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between OpenAI and Ollama
//! without changing engine logic; `ChannelConnector` does the same for the
//! transport that reaches external tool sources.

pub mod channel;
pub mod engine;
pub mod error;
pub mod message;
pub mod provider;
pub mod schema;
pub mod stream;
pub mod tool;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelConnection, ChannelConnector, ExternalChannelConfig, ExternalToolChannel, LaunchSpec};
pub use engine::{ConversationEngine, EngineBuilder, EngineConfig, Exchange, ExchangeEvent, ExchangeOutcome};
pub use error::{AgentError, Result};
pub use message::{ConversationState, Turn};
pub use provider::{GenerationOptions, LlmProvider, ProviderInfo};
pub use schema::{ParameterSchema, SchemaDialect, SchemaNormalizer};
pub use stream::{EventStream, StreamDecoder, StreamEvent};
pub use tool::{Tool, ToolCall, ToolDescriptor, ToolRegistry, ToolResult, ToolResultPayload};
