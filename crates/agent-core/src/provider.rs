//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for model backends (OpenAI Responses, Ollama)
//! so the engine can drive any of them without code changes. A provider
//! renders the conversation and tool descriptors into its own request shape
//! and returns the decoded [`EventStream`] of one model turn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::ConversationState;
use crate::schema::SchemaDialect;
use crate::stream::EventStream;
use crate::tool::ToolDescriptor;

/// Configuration for LLM generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier (e.g., "llama3.2", "gpt-4.1")
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate per model turn
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Top-p nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 2048 }
fn default_top_p() -> f32 { 0.9 }

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "llama3.2".into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
        }
    }
}

impl GenerationOptions {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

/// Provider metadata
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider name (e.g., "ollama", "openai")
    pub name: String,

    /// Configured model
    pub model: String,

    /// Whether streaming is supported
    pub supports_streaming: bool,

    /// Whether tool/function calling is supported
    pub supports_tools: bool,
}

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The engine works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get provider information and capabilities
    fn info(&self) -> ProviderInfo;

    /// Schema dialect tool descriptors must be normalized to
    fn schema_dialect(&self) -> SchemaDialect;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool>;

    /// Start one model turn over the conversation so far.
    ///
    /// Connection and HTTP-status failures are returned here; anything that
    /// goes wrong once streaming has begun arrives as a `DecodeError` event.
    async fn stream_turn(
        &self,
        conversation: &ConversationState,
        tools: &[ToolDescriptor],
        options: &GenerationOptions,
    ) -> Result<EventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_options_defaults() {
        let opts = GenerationOptions::default();
        assert_eq!(opts.temperature, 0.7);
        assert_eq!(opts.max_tokens, 2048);
        assert_eq!(opts.model, "llama3.2");

        let opts = GenerationOptions::with_model("gpt-4.1-mini");
        assert_eq!(opts.model, "gpt-4.1-mini");
        assert_eq!(opts.top_p, 0.9);
    }
}
