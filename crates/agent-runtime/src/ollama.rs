//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference over the native
//! `/api/chat` endpoint. The streamed body is newline-delimited JSON; tool
//! calls arrive whole inside `message.tool_calls`, with object arguments.

use agent_core::{
    error::Result,
    message::{ConversationState, Turn},
    provider::{GenerationOptions, LlmProvider, ProviderInfo},
    schema::SchemaDialect,
    stream::{decode_stream, DecoderState, EventStream, LineBuffer, StreamDecoder, StreamEvent},
    tool::ToolDescriptor,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::http;

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Default model
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            model: "llama3.1:8b".into(),
            timeout_secs: 120,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let host = std::env::var("OLLAMA_HOST")
            .map(|h| h.trim_end_matches('/').to_string())
            .unwrap_or(defaults.host);
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let model = std::env::var("OLLAMA_MODEL").unwrap_or(defaults.model);

        Self {
            host,
            port,
            model,
            ..defaults
        }
    }

    pub fn base_url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            config,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Result<Self> {
        Self::from_config(OllamaConfig::default())
    }

    /// Convert the conversation to Ollama chat messages
    fn convert_turns(conversation: &ConversationState) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &conversation.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for turn in conversation.turns() {
            match turn {
                Turn::User { content } => messages.push(json!({"role": "user", "content": content})),
                Turn::AssistantText { content } => {
                    messages.push(json!({"role": "assistant", "content": content}));
                }
                Turn::ToolCalls { calls } => {
                    let tool_calls: Vec<Value> = calls
                        .iter()
                        .map(|call| {
                            // Ollama only takes object arguments.
                            let arguments = match &call.arguments {
                                Value::Object(map) => Value::Object(map.clone()),
                                _ => Value::Object(Map::new()),
                            };
                            json!({"function": {"name": call.name, "arguments": arguments}})
                        })
                        .collect();
                    messages.push(json!({"role": "assistant", "content": "", "tool_calls": tool_calls}));
                }
                Turn::ToolResult(result) => messages.push(json!({
                    "role": "tool",
                    "content": result.content,
                    "tool_name": result.name,
                })),
            }
        }
        messages
    }

    fn convert_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters.to_value(),
                    }
                })
            })
            .collect()
    }

    fn build_request(conversation: &ConversationState, tools: &[ToolDescriptor], options: &GenerationOptions) -> Value {
        let mut body = json!({
            "model": options.model,
            "messages": Self::convert_turns(conversation),
            "stream": true,
            "options": {
                "temperature": options.temperature,
                "top_p": options.top_p,
                "num_predict": options.max_tokens,
            },
        });
        if !tools.is_empty() {
            body["tools"] = json!(Self::convert_tools(tools));
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "ollama".into(),
            model: self.config.model.clone(),
            supports_streaming: true,
            supports_tools: true,
        }
    }

    fn schema_dialect(&self) -> SchemaDialect {
        SchemaDialect::ollama()
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.config.base_url());
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn stream_turn(
        &self,
        conversation: &ConversationState,
        tools: &[ToolDescriptor],
        options: &GenerationOptions,
    ) -> Result<EventStream> {
        let body = Self::build_request(conversation, tools, options);
        let url = format!("{}/api/chat", self.config.base_url());
        tracing::debug!(model = %options.model, turns = conversation.len(), tools = tools.len(), "Streaming Ollama turn");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("ollama", &e))?;
        let response = http::ensure_success("ollama", response).await?;

        Ok(decode_stream(
            http::byte_stream("ollama", response),
            Box::new(ChatDecoder::for_turn(conversation.len())),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Decoder for `/api/chat` newline-delimited JSON
///
/// Ollama sends calls without ids, so ids are synthesized as
/// `call_{turn}_{n}`; `turn` must differ between model turns of one
/// conversation to keep ids unique across the transcript.
#[derive(Debug, Default)]
pub struct ChatDecoder {
    lines: LineBuffer,
    state: DecoderState,
    turn: usize,
    calls: usize,
}

impl ChatDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_turn(turn: usize) -> Self {
        Self {
            turn,
            ..Self::default()
        }
    }

    fn line(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        if line.is_empty() || self.state.is_done() {
            return Vec::new();
        }

        let chunk: ChatChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => return vec![self.state.fail(format!("invalid chat chunk: {}", e))],
        };
        if let Some(error) = chunk.error {
            return vec![self.state.fail(error)];
        }

        let mut events = Vec::new();
        if let Some(message) = chunk.message {
            events.extend(self.state.text(message.content));
            for call in message.tool_calls {
                self.calls += 1;
                let id = call
                    .id
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("call_{}_{}", self.turn, self.calls));
                let arguments = match call.function.arguments {
                    Value::Null => String::new(),
                    Value::String(raw) => raw,
                    other => other.to_string(),
                };
                events.push(self.state.start_call(id.clone(), call.function.name));
                events.extend(self.state.append(id.clone(), arguments));
                events.extend(self.state.complete(&id));
            }
        }
        if chunk.done {
            events.extend(self.state.turn_completed(chunk.done_reason));
        }
        events
    }
}

impl StreamDecoder for ChatDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            match line {
                Ok(line) => events.extend(self.line(&line)),
                Err(e) => events.push(self.state.fail(format!("invalid UTF-8 in stream: {}", e))),
            }
        }
        events
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.lines.take_remainder() {
            Some(Ok(rest)) => events.extend(self.line(&rest)),
            Some(Err(e)) => events.push(self.state.fail(format!("invalid UTF-8 in stream: {}", e))),
            None => {}
        }
        events.extend(self.state.end_of_input());
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::schema::ParameterSchema;
    use agent_core::tool::{ToolCall, ToolResult};

    fn decode_all(input: &str, chunk_size: usize) -> Vec<StreamEvent> {
        let mut decoder = ChatDecoder::new();
        let mut events = Vec::new();
        for chunk in input.as_bytes().chunks(chunk_size) {
            events.extend(decoder.feed(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_text_then_tool_calls() {
        let input = concat!(
            r#"{"message":{"role":"assistant","content":"Let me look."},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"fetch__fetch","arguments":{"url":"https://a"}}},{"function":{"name":"datetime","arguments":{}}}]},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop"}"#, "\n",
        );

        for size in [3, 50, 4096] {
            let events = decode_all(input, size);
            assert_eq!(
                events,
                vec![
                    StreamEvent::TextDelta("Let me look.".into()),
                    StreamEvent::ToolCallStarted { id: "call_0_1".into(), name: "fetch__fetch".into() },
                    StreamEvent::ToolCallArgumentChunk { id: "call_0_1".into(), chunk: r#"{"url":"https://a"}"#.into() },
                    StreamEvent::ToolCallCompleted { id: "call_0_1".into() },
                    StreamEvent::ToolCallStarted { id: "call_0_2".into(), name: "datetime".into() },
                    StreamEvent::ToolCallArgumentChunk { id: "call_0_2".into(), chunk: "{}".into() },
                    StreamEvent::ToolCallCompleted { id: "call_0_2".into() },
                    StreamEvent::TurnCompleted { stop_reason: Some("stop".into()) },
                ],
                "chunk size {}",
                size
            );
        }
    }

    #[test]
    fn test_synthesized_ids_differ_between_turns() {
        let line = concat!(
            r#"{"message":{"content":"","tool_calls":[{"function":{"name":"datetime","arguments":{}}}]},"done":true}"#,
            "\n"
        );
        let started = |turn| {
            let mut decoder = ChatDecoder::for_turn(turn);
            decoder.feed(line.as_bytes()).into_iter().find_map(|e| match e {
                StreamEvent::ToolCallStarted { id, .. } => Some(id),
                _ => None,
            })
        };
        let first = started(1).unwrap();
        let second = started(3).unwrap();
        assert_eq!(first, "call_1_1");
        assert_ne!(first, second);

        // ids supplied by the server are kept
        let mut decoder = ChatDecoder::for_turn(5);
        let events = decoder.feed(
            concat!(r#"{"message":{"content":"","tool_calls":[{"id":"abc","function":{"name":"datetime","arguments":{}}}]},"done":true}"#, "\n").as_bytes(),
        );
        assert_eq!(events[0], StreamEvent::ToolCallStarted { id: "abc".into(), name: "datetime".into() });
    }

    #[test]
    fn test_final_line_without_newline() {
        let input = r#"{"message":{"content":"hi"},"done":true}"#;
        assert_eq!(
            decode_all(input, 8),
            vec![StreamEvent::TextDelta("hi".into()), StreamEvent::TurnCompleted { stop_reason: None }]
        );
    }

    #[test]
    fn test_truncated_stream() {
        let input = "{\"message\":{\"content\":\"partial\"},\"done\":false}\n{\"message\":{\"content\":\"cut";
        let events = decode_all(input, 16);
        assert_eq!(events[0], StreamEvent::TextDelta("partial".into()));
        assert!(matches!(events.last(), Some(StreamEvent::DecodeError(_))));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn test_error_line() {
        let events = decode_all("{\"error\":\"model 'nope' not found\"}\n", 64);
        assert_eq!(events, vec![StreamEvent::DecodeError("model 'nope' not found".into())]);
    }

    #[test]
    fn test_request_renders_history() {
        let mut conversation = ConversationState::with_system_prompt("be brief");
        conversation.push_user("what time is it?");
        let call = ToolCall::new("call_1", "datetime", json!({"format": "iso"}));
        let result = ToolResult::success(&call, "2025-01-01T00:00:00Z");
        conversation.push_tool_exchange(vec![call], vec![result]);

        let tools = vec![ToolDescriptor::new("datetime", "Current time", ParameterSchema::empty())];
        let body = OllamaProvider::build_request(&conversation, &tools, &GenerationOptions::default());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0], json!({"role": "system", "content": "be brief"}));
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], json!({"format": "iso"}));
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_name"], "datetime");
        assert_eq!(body["tools"][0]["function"]["name"], "datetime");
        assert_eq!(body["options"]["num_predict"], 2048);
    }
}
