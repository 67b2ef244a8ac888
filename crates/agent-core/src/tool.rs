//! Tool System
//!
//! Every invocable capability implements [`Tool`], whether it runs in-process
//! or behind an [`ExternalToolChannel`]. The [`ToolRegistry`] indexes tools by
//! their (namespaced) name, normalizes their schemas for the active provider
//! and validates arguments before dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{ExternalChannelConfig, ExternalTool, ExternalToolChannel};
use crate::error::{AgentError, Result};
use crate::schema::{ParameterSchema, SchemaDialect, SchemaNormalizer};

/// Separator between a source name and its operation name.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Build the registry name for an operation exposed by `source`.
pub fn namespaced_name(source: &str, operation: &str) -> String {
    format!("{source}{NAMESPACE_SEPARATOR}{operation}")
}

/// Tool call request from the LLM, finalized from a streamed intent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call ID
    pub id: String,

    /// Registry name of the tool
    pub name: String,

    /// Parsed arguments (normally a JSON object)
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Result from tool execution, always text by the time it is stored
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Call this result answers
    pub call_id: String,

    /// Tool that was called
    pub name: String,

    /// Output text (success output or error description)
    pub content: String,

    /// Whether execution failed
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn failure(call: &ToolCall, error: &AgentError) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: format!("Error: {}", error),
            is_error: true,
        }
    }
}

/// One block of a multi-part tool result
#[derive(Clone, Debug, PartialEq)]
pub enum ContentBlock {
    Text(String),
    /// Embedded resource, with its text body when it has one
    Resource { uri: String, text: Option<String> },
    /// Binary payload (image, audio) the model cannot read
    Binary { mime_type: String },
    /// Anything else, kept as JSON
    Other(Value),
}

/// Raw result shapes a tool may produce
#[derive(Clone, Debug, PartialEq)]
pub enum ToolResultPayload {
    Text(String),
    Blocks(Vec<ContentBlock>),
    Structured(Value),
    Empty,
}

impl ToolResultPayload {
    /// Flatten to the text the model will see.
    pub fn into_text(self) -> String {
        match self {
            ToolResultPayload::Text(text) => text,
            ToolResultPayload::Blocks(blocks) => blocks
                .into_iter()
                .map(|block| match block {
                    ContentBlock::Text(text) => text,
                    ContentBlock::Resource { text: Some(text), .. } => text,
                    ContentBlock::Resource { uri, text: None } => format!("[resource: {}]", uri),
                    ContentBlock::Binary { mime_type } => format!("[binary content: {}]", mime_type),
                    ContentBlock::Other(value) => value.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            ToolResultPayload::Structured(value) => {
                let field = ["text", "message"]
                    .iter()
                    .find_map(|key| value.get(*key).and_then(Value::as_str).map(String::from));
                field.unwrap_or_else(|| {
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
                })
            }
            ToolResultPayload::Empty => String::new(),
        }
    }
}

impl From<String> for ToolResultPayload {
    fn from(text: String) -> Self {
        ToolResultPayload::Text(text)
    }
}

impl From<&str> for ToolResultPayload {
    fn from(text: &str) -> Self {
        ToolResultPayload::Text(text.to_string())
    }
}

/// What the model is told about a tool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool identifier (namespaced for external tools)
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Normalized parameter schema
    pub parameters: ParameterSchema,

    /// Provider strict mode
    pub strict: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: ParameterSchema) -> Self {
        let strict = parameters.is_strict();
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            strict,
        }
    }

    /// Same descriptor under `<source>__<name>`.
    pub fn namespaced(&self, source: &str) -> Self {
        Self {
            name: namespaced_name(source, &self.name),
            ..self.clone()
        }
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Description shown to the model
    fn description(&self) -> &str;

    /// Raw JSON schema of the arguments
    fn parameters(&self) -> Value;

    /// Execute the tool with already validated arguments
    async fn invoke(&self, arguments: Value) -> Result<ToolResultPayload>;
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    tool: Arc<dyn Tool>,
}

/// Registry for available tools
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
    normalizer: SchemaNormalizer,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::with_dialect(SchemaDialect::default())
    }

    pub fn with_dialect(dialect: SchemaDialect) -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            normalizer: SchemaNormalizer::new(dialect),
        }
    }

    /// Build a registry from external tool sources.
    ///
    /// Sources that fail discovery are skipped so the rest stay usable.
    pub async fn build(
        dialect: SchemaDialect,
        channel: &Arc<ExternalToolChannel>,
        sources: &[ExternalChannelConfig],
        filter: Option<&[String]>,
    ) -> Self {
        let mut registry = Self::with_dialect(dialect);
        registry.register_sources(channel, sources, filter).await;
        registry
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let parameters = self.normalizer.normalize(&tool.parameters());
        let descriptor = ToolDescriptor::new(tool.name(), tool.description(), parameters);
        self.insert(descriptor, tool)
    }

    fn insert(&mut self, descriptor: ToolDescriptor, tool: Arc<dyn Tool>) -> Result<()> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(AgentError::DuplicateTool(descriptor.name));
        }
        self.order.push(descriptor.name.clone());
        self.tools
            .insert(descriptor.name.clone(), RegisteredTool { descriptor, tool });
        Ok(())
    }

    /// Discover and register every enabled source, returning how many tools were added.
    pub async fn register_sources(
        &mut self,
        channel: &Arc<ExternalToolChannel>,
        sources: &[ExternalChannelConfig],
        filter: Option<&[String]>,
    ) -> usize {
        if let Some(names) = filter {
            for name in names {
                if !sources.iter().any(|s| s.enabled && &s.source == name) {
                    tracing::warn!(source = %name, "Requested tool source is not enabled");
                }
            }
        }

        let mut added = 0;
        for config in sources {
            if !config.enabled {
                tracing::debug!(source = %config.source, "Skipping disabled tool source");
                continue;
            }
            if filter.is_some_and(|names| !names.contains(&config.source)) {
                continue;
            }

            let discovered = match channel.discover(config).await {
                Ok(descriptors) => descriptors,
                Err(e) => {
                    tracing::error!(source = %config.source, error = %e, "Tool source discovery failed, skipping");
                    continue;
                }
            };

            if discovered.is_empty() {
                tracing::warn!(source = %config.source, "Tool source is enabled but exposes no operations");
                continue;
            }

            let allowed: Vec<ToolDescriptor> = discovered
                .into_iter()
                .filter(|d| config.allows(&d.name))
                .collect();

            // Stage first so a source never lands half-registered.
            let staged: Vec<(ToolDescriptor, Arc<dyn Tool>)> = allowed
                .iter()
                .map(|local| {
                    let descriptor = local.namespaced(&config.source);
                    let tool: Arc<dyn Tool> = Arc::new(ExternalTool::new(
                        channel.clone(),
                        &config.source,
                        local,
                        descriptor.name.clone(),
                    ));
                    (descriptor, tool)
                })
                .collect();

            let mut seen = std::collections::HashSet::new();
            if let Some((clash, _)) = staged
                .iter()
                .find(|(d, _)| self.tools.contains_key(&d.name) || !seen.insert(d.name.clone()))
            {
                tracing::error!(source = %config.source, tool = %clash.name, "Name collision, skipping source");
                continue;
            }

            let count = staged.len();
            for (descriptor, tool) in staged {
                tracing::debug!(source = %config.source, tool = %descriptor.name, "Registered external tool");
                if let Err(e) = self.insert(descriptor, tool) {
                    tracing::error!(source = %config.source, error = %e, "Failed to register tool");
                }
            }
            tracing::info!(source = %config.source, tools = count, "Tool source registered");
            added += count;
        }

        added
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.tool.clone())
    }

    /// Resolve a tool by name, failing with `UnknownTool`
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.get(name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))
    }

    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|r| &r.descriptor)
    }

    /// Validate and execute a tool call
    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolResultPayload> {
        let registered = self
            .tools
            .get(&call.name)
            .ok_or_else(|| AgentError::UnknownTool(call.name.clone()))?;

        let arguments = validate_arguments(&registered.descriptor, &call.arguments)?;
        registered.tool.invoke(Value::Object(arguments)).await
    }

    /// Descriptors in registration order
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|r| r.descriptor.clone())
            .collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Generate system prompt section describing available tools
    pub fn generate_prompt_section(&self) -> String {
        let mut prompt = String::from("## Available Tools\n\n");

        for descriptor in self.descriptors() {
            prompt.push_str(&format!("### {}\n", descriptor.name));
            prompt.push_str(&format!("{}\n", descriptor.description));

            let params = &descriptor.parameters;
            if !params.properties.is_empty() {
                prompt.push_str("**Parameters:**\n");
                for (name, spec) in &params.properties {
                    let kind = spec.get("type").and_then(Value::as_str).unwrap_or("any");
                    let required = if params.is_required(name) { " (required)" } else { "" };
                    let description = spec.get("description").and_then(Value::as_str).unwrap_or("");
                    prompt.push_str(&format!("- `{}` ({}){}: {}\n", name, kind, required, description));
                }
            }
            prompt.push('\n');
        }

        prompt
    }
}

/// Check arguments against a descriptor's schema.
fn validate_arguments(descriptor: &ToolDescriptor, arguments: &Value) -> Result<Map<String, Value>> {
    let object = match arguments {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(AgentError::schema_violation(
                &descriptor.name,
                format!("arguments must be an object, got {}", json_kind(other)),
            ));
        }
    };

    let schema = &descriptor.parameters;
    for name in &schema.required {
        if !object.contains_key(name) {
            return Err(AgentError::schema_violation(
                &descriptor.name,
                format!("missing required parameter '{}'", name),
            ));
        }
    }

    if schema.is_strict() {
        if let Some(unknown) = object.keys().find(|k| !schema.properties.contains_key(*k)) {
            return Err(AgentError::schema_violation(
                &descriptor.name,
                format!("unexpected parameter '{}'", unknown),
            ));
        }
    }

    Ok(object)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Built-in Tools
// ============================================================================

/// DateTime tool - returns current time
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn name(&self) -> &str {
        "datetime"
    }

    fn description(&self) -> &str {
        "Get the current date and time"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "description": "Output format: 'iso', 'human', or 'unix'",
                    "enum": ["iso", "human", "unix"],
                    "default": "human"
                }
            }
        })
    }

    async fn invoke(&self, arguments: Value) -> Result<ToolResultPayload> {
        let format = arguments
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("human");

        let now = chrono::Utc::now();

        let output = match format {
            "iso" => now.to_rfc3339(),
            "unix" => now.timestamp().to_string(),
            _ => now.format("%A, %B %d, %Y at %H:%M:%S UTC").to_string(),
        };

        Ok(ToolResultPayload::Text(output))
    }
}
