//! Conversation Engine
//!
//! Drives one exchange: stream a model turn, collect the tool calls it
//! requests, run them all concurrently, append the results and ask the model
//! again, until a turn arrives with no calls or the turn ceiling is reached.
//!
//! ```text
//! AwaitingUserInput → StreamingModel → DispatchingTools → StreamingModel → … → Terminal
//! ```
//!
//! Every call in a `ToolCalls` turn is answered by exactly one `ToolResult`
//! turn, in the order the calls were emitted, before the next model request.

use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{AgentError, Result};
use crate::message::{ConversationState, Turn};
use crate::provider::{GenerationOptions, LlmProvider};
use crate::stream::{EventStream, StreamEvent};
use crate::tool::{ToolCall, ToolRegistry, ToolResult};

/// Engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// System prompt template
    pub system_prompt: String,

    /// Maximum model requests per exchange
    pub max_turns: usize,

    /// Generation options
    pub generation: GenerationOptions,

    /// Whether to append tool descriptions to the system prompt
    pub inject_tool_descriptions: bool,

    /// Per-call limit for a single tool execution
    pub tool_timeout: Option<Duration>,

    /// Extra attempts for retryable tool errors
    pub tool_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_turns: 10,
            generation: GenerationOptions::default(),
            inject_tool_descriptions: false,
            tool_timeout: None,
            tool_retries: 0,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.

Use the provided tools whenever they help answer the request. You may call
several tools at once when the calls do not depend on each other.
After receiving tool results, synthesize them into a helpful response.
If you can answer directly without tools, do so.
Be concise and accurate.";

/// Where the engine is in an exchange, for tracing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnginePhase {
    AwaitingUserInput,
    StreamingModel,
    DispatchingTools,
    Terminal,
}

/// Progress reported to the host while an exchange runs
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeEvent {
    /// Assistant text delta
    Text { content: String },

    /// The model requested a tool
    ToolCall { id: String, name: String },

    /// A tool finished
    ToolResult { id: String, name: String, content: String, is_error: bool },

    /// The turn ceiling stopped the exchange
    Truncated { max_turns: usize },

    /// The exchange finished
    Done { text: String, turns: usize, truncated: bool },

    /// The exchange failed
    Failed { error: String, message: String },
}

/// Summary of a finished exchange
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeOutcome {
    /// Assistant text of the final model turn
    pub text: String,

    /// Model requests made
    pub turns: usize,

    /// Whether `max_turns` cut the exchange short
    pub truncated: bool,
}

/// A call as it is being streamed
#[derive(Debug)]
struct ToolCallIntent {
    id: String,
    name: String,
    raw_arguments: String,
    closed: bool,
}

impl ToolCallIntent {
    /// Parse the accumulated arguments; bad JSON answers the call with an error.
    fn finalize(self) -> (ToolCall, Option<AgentError>) {
        let raw = self.raw_arguments.trim();
        if raw.is_empty() {
            return (ToolCall::new(self.id, self.name, Value::Object(Map::new())), None);
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(arguments) => (ToolCall::new(self.id, self.name, arguments), None),
            Err(e) => {
                let error = AgentError::schema_violation(&self.name, format!("arguments are not valid JSON: {}", e));
                (ToolCall::new(self.id, self.name, Value::String(raw.to_string())), Some(error))
            }
        }
    }
}

/// What one model turn produced
#[derive(Debug, Default)]
struct TurnOutput {
    text: String,
    intents: Vec<ToolCallIntent>,
}

type EventSink<'a> = Option<&'a mpsc::UnboundedSender<ExchangeEvent>>;

fn emit(sink: EventSink<'_>, event: ExchangeEvent) {
    if let Some(tx) = sink {
        // A closed receiver only means nobody is listening any more.
        let _ = tx.send(event);
    }
}

/// The tool-orchestration engine
pub struct ConversationEngine {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    config: EngineConfig,
}

impl ConversationEngine {
    /// Create a new engine
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>, config: EngineConfig) -> Self {
        Self { provider, tools, config }
    }

    /// Create with default configuration
    pub fn with_defaults(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>) -> Self {
        Self::new(provider, tools, EngineConfig::default())
    }

    /// Build the full system prompt including tool descriptions
    fn build_system_prompt(&self) -> String {
        let mut prompt = self.config.system_prompt.clone();

        if self.config.inject_tool_descriptions && !self.tools.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&self.tools.generate_prompt_section());
        }

        prompt
    }

    /// Fresh conversation carrying this engine's system prompt
    pub fn new_conversation(&self) -> ConversationState {
        ConversationState::with_system_prompt(self.build_system_prompt())
    }

    /// Run one exchange on `conversation`, starting from `user_text`.
    ///
    /// On failure or cancellation the conversation keeps every fully answered
    /// turn and nothing from the turn in progress.
    pub async fn run(
        &self,
        conversation: &mut ConversationState,
        user_text: &str,
        sink: EventSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExchangeOutcome> {
        if conversation.system_prompt.is_none() {
            conversation.system_prompt = Some(self.build_system_prompt());
        }
        conversation.push_user(user_text);

        let descriptors = self.tools.descriptors();
        let max_turns = self.config.max_turns.max(1);
        tracing::debug!(
            conversation = %conversation.id,
            phase = ?EnginePhase::AwaitingUserInput,
            tools = descriptors.len(),
            "Exchange started"
        );

        for turn in 1..=max_turns {
            tracing::debug!(turn, phase = ?EnginePhase::StreamingModel, "Requesting model turn");
            let stream = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AgentError::Cancelled),
                stream = self.provider.stream_turn(conversation, &descriptors, &self.config.generation) => stream?,
            };
            let output = consume_turn(stream, sink, cancel).await?;

            if output.intents.is_empty() {
                if !output.text.is_empty() {
                    conversation.push(Turn::assistant(output.text.clone()));
                }
                tracing::debug!(turn, phase = ?EnginePhase::Terminal, "Exchange complete");
                emit(sink, ExchangeEvent::Done { text: output.text.clone(), turns: turn, truncated: false });
                return Ok(ExchangeOutcome { text: output.text, turns: turn, truncated: false });
            }

            tracing::debug!(turn, phase = ?EnginePhase::DispatchingTools, calls = output.intents.len(), "Dispatching tools");
            let (calls, presets): (Vec<ToolCall>, Vec<Option<AgentError>>) =
                output.intents.into_iter().map(ToolCallIntent::finalize).unzip();
            let results = self.dispatch_all(&calls, presets, turn, cancel).await?;

            for result in &results {
                emit(
                    sink,
                    ExchangeEvent::ToolResult {
                        id: result.call_id.clone(),
                        name: result.name.clone(),
                        content: result.content.clone(),
                        is_error: result.is_error,
                    },
                );
            }
            if !output.text.is_empty() {
                conversation.push(Turn::assistant(output.text.clone()));
            }
            conversation.push_tool_exchange(calls, results);

            if turn == max_turns {
                tracing::warn!(max_turns, "Turn ceiling reached, truncating exchange");
                emit(sink, ExchangeEvent::Truncated { max_turns });
                emit(sink, ExchangeEvent::Done { text: output.text.clone(), turns: turn, truncated: true });
                return Ok(ExchangeOutcome { text: output.text, turns: turn, truncated: true });
            }
        }

        Err(AgentError::Other("exchange ended without a terminal turn".into()))
    }

    /// Run every call of one turn concurrently and wait for all of them.
    ///
    /// Results come back in call order regardless of completion order.
    async fn dispatch_all(
        &self,
        calls: &[ToolCall],
        presets: Vec<Option<AgentError>>,
        turn: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolResult>> {
        let mut slots: Vec<Option<ToolResult>> = vec![None; calls.len()];
        let mut tasks = JoinSet::new();

        for (index, (call, preset)) in calls.iter().zip(presets).enumerate() {
            if let Some(error) = preset {
                tracing::warn!(tool = %call.name, call_id = %call.id, turn, error = %error, "Rejected tool call");
                slots[index] = Some(ToolResult::failure(call, &error));
                continue;
            }

            let registry = self.tools.clone();
            let call = call.clone();
            let token = cancel.child_token();
            let timeout = self.config.tool_timeout;
            let retries = self.config.tool_retries;
            tasks.spawn(async move {
                let run = execute_call(&registry, &call, timeout, retries, &token);
                let result = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(tool = %call.name, call_id = %call.id, "Tool task panicked");
                        ToolResult::failure(&call, &AgentError::Other("tool panicked".into()))
                    }
                };
                (index, result)
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tasks.abort_all();
                    // Wait until every in-flight call has dropped its connection.
                    while tasks.join_next().await.is_some() {}
                    return Err(AgentError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok((index, result))) => slots[index] = Some(result),
                Some(Err(e)) => tracing::error!(error = %e, "Tool task did not complete"),
            }
        }

        Ok(slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| ToolResult::failure(call, &AgentError::Other("tool task did not complete".into())))
            })
            .collect())
    }

    /// Start an exchange on a fresh conversation.
    pub fn run_exchange(self: &Arc<Self>, user_text: impl Into<String>) -> Exchange {
        self.run_exchange_in(self.new_conversation(), user_text)
    }

    /// Start an exchange on an existing conversation.
    ///
    /// The returned [`Exchange`] streams progress; dropping it cancels the
    /// exchange.
    pub fn run_exchange_in(self: &Arc<Self>, conversation: ConversationState, user_text: impl Into<String>) -> Exchange {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let engine = Arc::clone(self);
        let token = cancel.clone();
        let user_text = user_text.into();

        let task = tokio::spawn(async move {
            let mut conversation = conversation;
            if let Err(e) = engine.run(&mut conversation, &user_text, Some(&tx), &token).await {
                tracing::warn!(conversation = %conversation.id, error = %e, "Exchange failed");
                let _ = tx.send(ExchangeEvent::Failed { error: e.to_string(), message: e.user_message() });
            }
            conversation
        });

        Exchange {
            events: UnboundedReceiverStream::new(rx),
            guard: Some(cancel.clone().drop_guard()),
            cancel,
            task,
        }
    }

    /// Ask a single question and collect the final text.
    pub async fn ask(&self, question: &str) -> Result<String> {
        let mut conversation = self.new_conversation();
        let outcome = self
            .run(&mut conversation, question, None, &CancellationToken::new())
            .await?;
        Ok(outcome.text)
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
}

/// Consume one model turn, forwarding text as it arrives.
async fn consume_turn(mut stream: EventStream, sink: EventSink<'_>, cancel: &CancellationToken) -> Result<TurnOutput> {
    let mut output = TurnOutput::default();

    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AgentError::Cancelled),
            event = stream.next() => event,
        };

        match event {
            None => return Err(AgentError::Decode("stream ended before the turn completed".into())),
            Some(StreamEvent::TextDelta(delta)) => {
                output.text.push_str(&delta);
                emit(sink, ExchangeEvent::Text { content: delta });
            }
            Some(StreamEvent::ToolCallStarted { id, name }) => {
                emit(sink, ExchangeEvent::ToolCall { id: id.clone(), name: name.clone() });
                output.intents.push(ToolCallIntent {
                    id,
                    name,
                    raw_arguments: String::new(),
                    closed: false,
                });
            }
            Some(StreamEvent::ToolCallArgumentChunk { id, chunk }) => {
                let intent = output
                    .intents
                    .iter_mut()
                    .find(|i| i.id == id && !i.closed)
                    .ok_or_else(|| AgentError::Decode(format!("arguments for unknown tool call '{}'", id)))?;
                intent.raw_arguments.push_str(&chunk);
            }
            Some(StreamEvent::ToolCallCompleted { id }) => {
                if let Some(intent) = output.intents.iter_mut().find(|i| i.id == id) {
                    intent.closed = true;
                }
            }
            Some(StreamEvent::TurnCompleted { stop_reason }) => {
                tracing::debug!(stop_reason = ?stop_reason, calls = output.intents.len(), "Model turn completed");
                return Ok(output);
            }
            Some(StreamEvent::DecodeError(message)) => return Err(AgentError::Decode(message)),
        }
    }
}

/// Execute one call with the configured timeout and retry policy.
async fn execute_call(
    registry: &ToolRegistry,
    call: &ToolCall,
    timeout: Option<Duration>,
    retries: u32,
    cancel: &CancellationToken,
) -> ToolResult {
    let mut attempt = 0;
    loop {
        let dispatch = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, registry.dispatch(call))
                    .await
                    .unwrap_or_else(|_| Err(AgentError::ToolTimeout(call.name.clone(), limit.as_secs()))),
                None => registry.dispatch(call).await,
            }
        };
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AgentError::Cancelled),
            outcome = dispatch => outcome,
        };

        match outcome {
            Ok(payload) => {
                tracing::debug!(tool = %call.name, call_id = %call.id, "Tool succeeded");
                return ToolResult::success(call, payload.into_text());
            }
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                tracing::warn!(tool = %call.name, call_id = %call.id, attempt, error = %e, "Retrying tool call");
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool failed");
                return ToolResult::failure(call, &e);
            }
        }
    }
}

/// A running exchange.
///
/// Yields [`ExchangeEvent`]s until `Done` or `Failed`. Dropping it cancels
/// the exchange and any tool calls still in flight.
pub struct Exchange {
    events: UnboundedReceiverStream<ExchangeEvent>,
    cancel: CancellationToken,
    guard: Option<DropGuard>,
    task: JoinHandle<ConversationState>,
}

impl Exchange {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the exchange to finish and take back the conversation.
    pub async fn into_conversation(mut self) -> Result<ConversationState> {
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        (&mut self.task)
            .await
            .map_err(|e| AgentError::Other(format!("exchange task failed: {}", e)))
    }
}

impl Stream for Exchange {
    type Item = ExchangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// Builder for engine configuration
pub struct EngineBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Option<Arc<ToolRegistry>>,
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: None,
            config: EngineConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub fn max_turns(mut self, max: usize) -> Self {
        self.config.max_turns = max;
        self
    }

    pub fn inject_tool_descriptions(mut self, inject: bool) -> Self {
        self.config.inject_tool_descriptions = inject;
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.config.tool_timeout = Some(timeout);
        self
    }

    pub fn tool_retries(mut self, retries: u32) -> Self {
        self.config.tool_retries = retries;
        self
    }

    pub fn build(self) -> Result<ConversationEngine> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_turns == 0 {
            return Err(AgentError::Config("max_turns must be at least 1".into()));
        }
        let tools = self.tools.unwrap_or_default();

        Ok(ConversationEngine::new(provider, tools, self.config))
    }
}
