//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Tool source process or endpoint could not be reached
    #[error("Tool source '{source_name}' unavailable: {reason}")]
    ChannelUnavailable { source_name: String, reason: String },

    /// Operation still absent after rediscovery
    #[error("Operation '{operation}' not found on tool source '{source_name}'")]
    OperationNotFound { source_name: String, operation: String },

    /// Connection dropped or misbehaved mid-call
    #[error("Tool source '{source_name}' I/O error: {reason}")]
    ChannelIo { source_name: String, reason: String },

    /// Malformed or truncated provider stream
    #[error("Decode error: {0}")]
    Decode(String),

    /// Model asked for a tool that is not registered
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// Two tools registered under the same name
    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),

    /// Tool arguments do not fit the declared schema
    #[error("Schema violation for '{tool}': {reason}")]
    SchemaViolation { tool: String, reason: String },

    /// The tool ran but reported failure
    #[error("Tool '{tool}' failed: {reason}")]
    ToolFailed { tool: String, reason: String },

    /// Tool call exceeded the configured timeout
    #[error("Tool '{0}' timed out after {1}s")]
    ToolTimeout(String, u64),

    /// The host cancelled the exchange
    #[error("Exchange cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    pub fn channel_unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::ChannelUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn channel_io(source_name: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::ChannelIo {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn schema_violation(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        AgentError::SchemaViolation {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::ProviderUnavailable(_)
                | AgentError::ChannelUnavailable { .. }
                | AgentError::ChannelIo { .. }
                | AgentError::ToolTimeout(..)
                | AgentError::Io(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Provider(msg) => format!("The AI service encountered an error: {}", msg),
            AgentError::ProviderUnavailable(_) => "The AI service is currently unavailable. Please try again.".into(),
            AgentError::Decode(_) => "The AI service sent a response that could not be read. Please try again.".into(),
            AgentError::UnknownTool(name) => format!("The tool '{}' is not available.", name),
            AgentError::ChannelUnavailable { source_name, .. } => {
                format!("The tool source '{}' is not reachable.", source_name)
            }
            AgentError::Cancelled => "The request was cancelled.".into(),
            AgentError::Config(msg) => format!("Configuration problem: {}", msg),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}
