//! In-memory fakes shared by the unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{ChannelConnection, ChannelConnector, LaunchSpec, RemoteOperation};
use crate::error::{AgentError, Result};
use crate::message::ConversationState;
use crate::provider::{GenerationOptions, LlmProvider, ProviderInfo};
use crate::schema::SchemaDialect;
use crate::stream::{EventStream, StreamEvent};
use crate::tool::{ToolDescriptor, ToolResultPayload};

/// A scripted tool source
#[derive(Clone, Debug)]
pub struct FakeSource {
    name: String,
    operations: Vec<RemoteOperation>,
    failing: HashSet<String>,
    missing: HashSet<String>,
    delay: Option<Duration>,
}

impl FakeSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            operations: Vec::new(),
            failing: HashSet::new(),
            missing: HashSet::new(),
            delay: None,
        }
    }

    pub fn operation(mut self, name: &str, schema: Value) -> Self {
        self.operations.push(RemoteOperation {
            name: name.to_string(),
            description: format!("{} on {}", name, self.name),
            input_schema: schema,
        });
        self
    }

    /// Calls to `operation` drop the connection.
    pub fn failing(mut self, operation: &str) -> Self {
        self.failing.insert(operation.to_string());
        self
    }

    /// Calls to `operation` report it as gone.
    pub fn missing(mut self, operation: &str) -> Self {
        self.missing.insert(operation.to_string());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Counters {
    launches: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicUsize,
}

/// Connector over [`FakeSource`]s that counts connection lifecycles
#[derive(Default)]
pub struct FakeConnector {
    sources: HashMap<String, FakeSource>,
    counters: Arc<Counters>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: FakeSource) -> Self {
        self.sources.insert(source.name.clone(), source);
        self
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn launch(&self, source: &str, _spec: &LaunchSpec) -> Result<Box<dyn ChannelConnection>> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        let Some(fake) = self.sources.get(source) else {
            return Err(AgentError::channel_unavailable(source, "no such process"));
        };
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            source: fake.clone(),
            counters: self.counters.clone(),
        }))
    }
}

struct FakeConnection {
    source: FakeSource,
    counters: Arc<Counters>,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelConnection for FakeConnection {
    async fn list_operations(&mut self) -> Result<Vec<RemoteOperation>> {
        Ok(self.source.operations.clone())
    }

    async fn call_operation(&mut self, operation: &str, _arguments: Map<String, Value>) -> Result<ToolResultPayload> {
        if let Some(delay) = self.source.delay {
            tokio::time::sleep(delay).await;
        }
        if self.source.failing.contains(operation) {
            return Err(AgentError::channel_io(&self.source.name, "connection reset by peer"));
        }
        if self.source.missing.contains(operation) {
            return Err(AgentError::OperationNotFound {
                source_name: self.source.name.clone(),
                operation: operation.to_string(),
            });
        }
        Ok(ToolResultPayload::Text(format!("{}:{} ok", self.source.name, operation)))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Provider that replays one event script per model request
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    repeat: Option<Vec<StreamEvent>>,
    seen: Mutex<Vec<ConversationState>>,
    offered_tools: Mutex<Vec<Vec<String>>>,
    pending_forever: bool,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
            offered_tools: Mutex::new(Vec::new()),
            pending_forever: false,
        }
    }

    /// Answer every request with the same script.
    pub fn repeating(script: Vec<StreamEvent>) -> Self {
        Self {
            repeat: Some(script),
            ..Self::new(Vec::new())
        }
    }

    /// Emit `script` and then never finish the turn.
    pub fn stalling(script: Vec<StreamEvent>) -> Self {
        Self {
            pending_forever: true,
            ..Self::new(vec![script])
        }
    }

    pub fn requests(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Conversation as it looked at the `index`th request
    pub fn request(&self, index: usize) -> ConversationState {
        self.seen.lock().unwrap()[index].clone()
    }

    pub fn offered_tools(&self, index: usize) -> Vec<String> {
        self.offered_tools.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "scripted".into(),
            model: "test".into(),
            supports_streaming: true,
            supports_tools: true,
        }
    }

    fn schema_dialect(&self) -> SchemaDialect {
        SchemaDialect::openai()
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn stream_turn(
        &self,
        conversation: &ConversationState,
        tools: &[ToolDescriptor],
        _options: &GenerationOptions,
    ) -> Result<EventStream> {
        self.seen.lock().unwrap().push(conversation.clone());
        self.offered_tools
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .ok_or_else(|| AgentError::Provider("script exhausted".into()))?;

        let events = futures::stream::iter(script);
        if self.pending_forever {
            Ok(Box::pin(events.chain(futures::stream::pending())))
        } else {
            Ok(Box::pin(events))
        }
    }
}

/// Text-only turn
pub fn text_turn(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(text.to_string()),
        StreamEvent::TurnCompleted { stop_reason: Some("stop".into()) },
    ]
}

/// Turn requesting the given `(id, name, arguments)` calls
pub fn tool_turn(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for (id, name, arguments) in calls {
        events.push(StreamEvent::ToolCallStarted { id: (*id).into(), name: (*name).into() });
        events.push(StreamEvent::ToolCallArgumentChunk { id: (*id).into(), chunk: (*arguments).into() });
        events.push(StreamEvent::ToolCallCompleted { id: (*id).into() });
    }
    events.push(StreamEvent::TurnCompleted { stop_reason: Some("tool_calls".into()) });
    events
}
