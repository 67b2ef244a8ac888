//! OpenAI Responses Provider
//!
//! Implementation of `LlmProvider` for the OpenAI Responses API
//! (`POST /v1/responses` with `stream: true`).
//!
//! Tool calls are `function_call` output items. Their arguments arrive as
//! `response.function_call_arguments.delta` events keyed by item id, while the
//! history refers to them by `call_id`; [`ResponsesDecoder`] maps one onto the
//! other.

use std::collections::{HashMap, HashSet};

use agent_core::{
    error::{AgentError, Result},
    message::{ConversationState, Turn},
    provider::{GenerationOptions, LlmProvider, ProviderInfo},
    schema::SchemaDialect,
    stream::{decode_stream, DecoderState, EventStream, LineBuffer, StreamDecoder, StreamEvent},
    tool::ToolDescriptor,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::http;

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// API key (sent as a bearer token)
    pub api_key: String,

    /// API base URL, without trailing slash
    pub base_url: String,

    /// Default model
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4.1-mini".into(),
            timeout_secs: 120,
        }
    }
}

impl OpenAiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default().trim().to_string(),
            base_url: std::env::var("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.model),
            ..defaults
        }
    }
}

/// OpenAI Responses provider
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    /// Create from configuration
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(AgentError::Config("OPENAI_API_KEY is not set".into()));
        }
        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            config,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OpenAiConfig::from_env())
    }

    /// Render the conversation as Responses `input` items
    fn convert_turns(conversation: &ConversationState) -> Vec<Value> {
        let mut input = Vec::new();
        for turn in conversation.turns() {
            match turn {
                Turn::User { content } => input.push(json!({"role": "user", "content": content})),
                Turn::AssistantText { content } => {
                    input.push(json!({"role": "assistant", "content": content}));
                }
                Turn::ToolCalls { calls } => {
                    for call in calls {
                        let arguments = match &call.arguments {
                            Value::String(raw) => raw.clone(),
                            other => other.to_string(),
                        };
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.name,
                            "arguments": arguments,
                        }));
                    }
                }
                Turn::ToolResult(result) => input.push(json!({
                    "type": "function_call_output",
                    "call_id": result.call_id,
                    "output": result.content,
                })),
            }
        }
        input
    }

    fn convert_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters.to_value(),
                    "strict": tool.strict,
                })
            })
            .collect()
    }

    fn build_request(conversation: &ConversationState, tools: &[ToolDescriptor], options: &GenerationOptions) -> Value {
        let mut body = json!({
            "model": options.model,
            "input": Self::convert_turns(conversation),
            "temperature": options.temperature,
            "top_p": options.top_p,
            "max_output_tokens": options.max_tokens,
            "stream": true,
        });
        if let Some(system) = &conversation.system_prompt {
            body["instructions"] = json!(system);
        }
        if !tools.is_empty() {
            body["tools"] = json!(Self::convert_tools(tools));
            body["tool_choice"] = json!("auto");
            body["parallel_tool_calls"] = json!(true);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "openai".into(),
            model: self.config.model.clone(),
            supports_streaming: true,
            supports_tools: true,
        }
    }

    fn schema_dialect(&self) -> SchemaDialect {
        SchemaDialect::openai()
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.config.base_url);
        match self.client.get(&url).bearer_auth(&self.config.api_key).send().await {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                tracing::warn!(status = %response.status(), "OpenAI health check failed");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!("OpenAI health check failed: {}", e);
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
        let url = format!("{}/responses", self.config.base_url);
        tracing::debug!(model = %options.model, turns = conversation.len(), tools = tools.len(), "Streaming OpenAI turn");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("openai", &e))?;
        let response = http::ensure_success("openai", response).await?;

        Ok(decode_stream(
            http::byte_stream("openai", response),
            Box::new(ResponsesDecoder::new()),
        ))
    }
}

/// Decoder for the Responses server-sent event stream
#[derive(Debug, Default)]
pub struct ResponsesDecoder {
    lines: LineBuffer,
    data: Vec<String>,
    state: DecoderState,
    /// output item id → call id
    items: HashMap<String, String>,
    /// calls whose arguments have arrived
    with_arguments: HashSet<String>,
}

impl ResponsesDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn line(&mut self, line: &str) -> Vec<StreamEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.trim_start().to_string());
        }
        Vec::new()
    }

    /// End of one SSE event block.
    fn dispatch(&mut self) -> Vec<StreamEvent> {
        if self.data.is_empty() || self.state.is_done() {
            self.data.clear();
            return Vec::new();
        }
        let payload = self.data.join("\n");
        self.data.clear();

        if payload == "[DONE]" {
            return self.state.turn_completed(None);
        }
        match serde_json::from_str::<Value>(&payload) {
            Ok(event) => self.handle(&event),
            Err(e) => vec![self.state.fail(format!("invalid event payload: {}", e))],
        }
    }

    fn handle(&mut self, event: &Value) -> Vec<StreamEvent> {
        let kind = event["type"].as_str().unwrap_or_default();
        match kind {
            "response.output_text.delta" => {
                let delta = event["delta"].as_str().unwrap_or_default().to_string();
                self.state.text(delta).into_iter().collect()
            }
            "response.output_item.added" => {
                let item = &event["item"];
                if item["type"] != "function_call" {
                    return Vec::new();
                }
                let item_id = item["id"].as_str().unwrap_or_default().to_string();
                let call_id = item["call_id"]
                    .as_str()
                    .filter(|id| !id.is_empty())
                    .unwrap_or(&item_id)
                    .to_string();
                if call_id.is_empty() {
                    return vec![self.state.fail("function call item has no id")];
                }
                let name = item["name"].as_str().unwrap_or_default().to_string();
                self.items.insert(item_id, call_id.clone());
                vec![self.state.start_call(call_id, name)]
            }
            "response.function_call_arguments.delta" => {
                let Some(call_id) = self.call_for(event) else {
                    return vec![self.state.fail("arguments for an unknown output item")];
                };
                let delta = event["delta"].as_str().unwrap_or_default().to_string();
                self.arguments(call_id, delta)
            }
            "response.function_call_arguments.done" => {
                let Some(call_id) = self.call_for(event) else {
                    return Vec::new();
                };
                if self.with_arguments.contains(&call_id) {
                    return Vec::new();
                }
                let arguments = event["arguments"].as_str().unwrap_or_default().to_string();
                self.arguments(call_id, arguments)
            }
            "response.output_item.done" => {
                let item = &event["item"];
                if item["type"] != "function_call" {
                    return Vec::new();
                }
                let item_id = item["id"].as_str().unwrap_or_default();
                let Some(call_id) = self.items.get(item_id).cloned() else {
                    return Vec::new();
                };
                let mut events = Vec::new();
                if !self.with_arguments.contains(&call_id) {
                    let arguments = item["arguments"].as_str().unwrap_or_default().to_string();
                    events.extend(self.arguments(call_id.clone(), arguments));
                }
                events.extend(self.state.complete(&call_id));
                events
            }
            "response.completed" => {
                let status = event["response"]["status"].as_str().unwrap_or("completed").to_string();
                self.state.turn_completed(Some(status))
            }
            "response.incomplete" => {
                let reason = event["response"]["incomplete_details"]["reason"]
                    .as_str()
                    .unwrap_or("incomplete")
                    .to_string();
                tracing::warn!(reason = %reason, "OpenAI response incomplete");
                self.state.turn_completed(Some(reason))
            }
            "response.failed" => {
                let message = event["response"]["error"]["message"]
                    .as_str()
                    .unwrap_or("response failed")
                    .to_string();
                vec![self.state.fail(message)]
            }
            "error" | "response.error" => {
                let message = event["message"]
                    .as_str()
                    .or_else(|| event["error"]["message"].as_str())
                    .map_or_else(|| event.to_string(), String::from);
                vec![self.state.fail(message)]
            }
            _ => Vec::new(),
        }
    }

    fn call_for(&self, event: &Value) -> Option<String> {
        event["item_id"]
            .as_str()
            .and_then(|item_id| self.items.get(item_id))
            .cloned()
    }

    fn arguments(&mut self, call_id: String, chunk: String) -> Vec<StreamEvent> {
        if !chunk.is_empty() {
            self.with_arguments.insert(call_id.clone());
        }
        self.state.append(call_id, chunk).into_iter().collect()
    }
}

impl StreamDecoder for ResponsesDecoder {
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
        if let Some(Ok(rest)) = self.lines.take_remainder() {
            events.extend(self.line(&rest));
        }
        events.extend(self.dispatch());
        events.extend(self.state.end_of_input());
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::tool::{ToolCall, ToolResult};
    use agent_core::schema::ParameterSchema;

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
            .collect()
    }

    fn decode_all(input: &str, chunk_size: usize) -> Vec<StreamEvent> {
        let mut decoder = ResponsesDecoder::new();
        let mut events = Vec::new();
        for chunk in input.as_bytes().chunks(chunk_size) {
            events.extend(decoder.feed(chunk));
        }
        events.extend(decoder.finish());
        events
    }

    fn function_call_stream() -> String {
        sse(&[
            json!({"type": "response.created", "response": {"status": "in_progress"}}),
            json!({"type": "response.output_text.delta", "item_id": "msg_1", "delta": "Checking"}),
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_A", "name": "fetch__fetch", "arguments": ""}}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "{\"url\":"}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "\"https://example.com\"}"}),
            json!({"type": "response.function_call_arguments.done", "item_id": "fc_1", "arguments": "{\"url\":\"https://example.com\"}"}),
            json!({"type": "response.output_item.done", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_A", "name": "fetch__fetch", "arguments": "{\"url\":\"https://example.com\"}"}}),
            json!({"type": "response.completed", "response": {"status": "completed"}}),
        ])
    }

    #[test]
    fn test_function_call_stream() {
        let expected = vec![
            StreamEvent::TextDelta("Checking".into()),
            StreamEvent::ToolCallStarted { id: "call_A".into(), name: "fetch__fetch".into() },
            StreamEvent::ToolCallArgumentChunk { id: "call_A".into(), chunk: "{\"url\":".into() },
            StreamEvent::ToolCallArgumentChunk { id: "call_A".into(), chunk: "\"https://example.com\"}".into() },
            StreamEvent::ToolCallCompleted { id: "call_A".into() },
            StreamEvent::TurnCompleted { stop_reason: Some("completed".into()) },
        ];

        // chunk boundaries must not matter
        for size in [1, 7, 64, 4096] {
            assert_eq!(decode_all(&function_call_stream(), size), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_arguments_only_on_done() {
        let input = sse(&[
            json!({"type": "response.output_item.added", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_A", "name": "datetime"}}),
            json!({"type": "response.output_item.done", "item": {"type": "function_call", "id": "fc_1", "call_id": "call_A", "arguments": "{}"}}),
            json!({"type": "response.completed", "response": {"status": "completed"}}),
        ]);
        let events = decode_all(&input, 32);
        assert_eq!(events[1], StreamEvent::ToolCallArgumentChunk { id: "call_A".into(), chunk: "{}".into() });
        assert_eq!(events[2], StreamEvent::ToolCallCompleted { id: "call_A".into() });
    }

    #[test]
    fn test_truncated_mid_arguments() {
        let full = function_call_stream();
        let (cut, _) = full
            .match_indices("event: response.function_call_arguments.delta")
            .nth(1)
            .unwrap();
        let events = decode_all(&full[..cut], 16);

        assert!(matches!(events.last(), Some(StreamEvent::DecodeError(msg)) if msg.contains("call_A")));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::ToolCallCompleted { .. })));
    }

    #[test]
    fn test_error_event_and_done_marker() {
        let input = sse(&[json!({"type": "error", "message": "rate limited"})]);
        assert_eq!(decode_all(&input, 64), vec![StreamEvent::DecodeError("rate limited".into())]);

        let input = "data: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\"}\n\ndata: [DONE]\n\n";
        assert_eq!(
            decode_all(input, 5),
            vec![StreamEvent::TextDelta("hi".into()), StreamEvent::TurnCompleted { stop_reason: None }]
        );
    }

    #[test]
    fn test_malformed_payload() {
        let events = decode_all("data: {not json\n\n", 4);
        assert!(matches!(events.as_slice(), [StreamEvent::DecodeError(_)]));
    }

    #[test]
    fn test_request_renders_history() {
        let mut conversation = ConversationState::with_system_prompt("be brief");
        conversation.push_user("fetch it");
        let call = ToolCall::new("call_A", "fetch__fetch", json!({"url": "https://example.com"}));
        let result = ToolResult::success(&call, "Example Domain");
        conversation.push_tool_exchange(vec![call], vec![result]);

        let tools = vec![ToolDescriptor::new("fetch__fetch", "Fetch a URL", ParameterSchema::empty())];
        let body = OpenAiProvider::build_request(&conversation, &tools, &GenerationOptions::with_model("gpt-4.1-mini"));

        assert_eq!(body["instructions"], "be brief");
        assert_eq!(body["stream"], true);
        let input = body["input"].as_array().unwrap();
        assert_eq!(input[0], json!({"role": "user", "content": "fetch it"}));
        assert_eq!(input[1]["type"], "function_call");
        assert_eq!(input[1]["call_id"], "call_A");
        assert_eq!(input[1]["arguments"], "{\"url\":\"https://example.com\"}");
        assert_eq!(input[2], json!({"type": "function_call_output", "call_id": "call_A", "output": "Example Domain"}));

        assert_eq!(body["tools"][0]["name"], "fetch__fetch");
        assert_eq!(body["tools"][0]["strict"], true);
        assert_eq!(body["tools"][0]["parameters"]["additionalProperties"], false);
    }

    #[test]
    fn test_missing_api_key() {
        assert!(matches!(
            OpenAiProvider::from_config(OpenAiConfig::default()),
            Err(AgentError::Config(_))
        ));
    }
}
