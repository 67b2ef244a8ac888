//! External Tool Channels
//!
//! Tools served by another process (an MCP server launched as a subprocess or
//! reached over HTTP) are used through short-lived connections:
//!
//! - **discovery** opens one connection, lists the operations, closes it and
//!   caches the result per source;
//! - **invocation** opens a brand-new connection for every call and closes it
//!   when the call finishes.
//!
//! A connection never outlives the task that opened it, so concurrent calls
//! running on independent tasks never share one. The transport itself sits
//! behind [`ChannelConnector`] / [`ChannelConnection`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::{AgentError, Result};
use crate::schema::{SchemaDialect, SchemaNormalizer};
use crate::tool::{Tool, ToolDescriptor, ToolResultPayload};

/// How to reach a tool source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LaunchSpec {
    /// Spawn a subprocess speaking over stdio
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Connect to an HTTP endpoint
    Url { url: String },
}

impl std::fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchSpec::Command { command, args, .. } => {
                write!(f, "{}", command)?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            LaunchSpec::Url { url } => write!(f, "{}", url),
        }
    }
}

/// Configuration of one external tool source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalChannelConfig {
    /// Source name, used as the namespace prefix
    #[serde(alias = "name")]
    pub source: String,

    /// Whether the source should be registered
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Launch command or endpoint
    #[serde(flatten)]
    pub launch: LaunchSpec,

    /// Operation whitelist (`None` = all operations)
    #[serde(default, alias = "allowed_tools")]
    pub allowed_operations: Option<BTreeSet<String>>,
}

fn default_enabled() -> bool {
    true
}

impl ExternalChannelConfig {
    pub fn command(source: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            source: source.into(),
            enabled: true,
            launch: LaunchSpec::Command {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            allowed_operations: None,
        }
    }

    pub fn url(source: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            enabled: true,
            launch: LaunchSpec::Url { url: url.into() },
            allowed_operations: None,
        }
    }

    pub fn with_allowed_operations<I, S>(mut self, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_operations = Some(operations.into_iter().map(Into::into).collect());
        self
    }

    /// Whether the whitelist lets `operation` through
    pub fn allows(&self, operation: &str) -> bool {
        self.allowed_operations
            .as_ref()
            .is_none_or(|allowed| allowed.contains(operation))
    }
}

/// An operation as listed by a tool source, before normalization
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteOperation {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Opens connections to tool sources
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Launch or connect. Failures should be `ChannelUnavailable`.
    async fn launch(&self, source: &str, spec: &LaunchSpec) -> Result<Box<dyn ChannelConnection>>;
}

/// One live connection to a tool source
#[async_trait]
pub trait ChannelConnection: Send {
    async fn list_operations(&mut self) -> Result<Vec<RemoteOperation>>;

    async fn call_operation(
        &mut self,
        operation: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolResultPayload>;

    /// Tear the connection down (terminates a spawned process)
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Per-source cache of discovered operations.
///
/// Reads are shared; each source has its own discovery lock so two tasks never
/// discover the same source at once.
#[derive(Default)]
pub struct DiscoveredOperationCache {
    entries: RwLock<HashMap<String, Arc<[ToolDescriptor]>>>,
    discovery_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DiscoveredOperationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, source: &str) -> Option<Arc<[ToolDescriptor]>> {
        self.entries.read().await.get(source).cloned()
    }

    pub async fn contains(&self, source: &str, operation: &str) -> bool {
        self.entries
            .read()
            .await
            .get(source)
            .is_some_and(|ops| ops.iter().any(|d| d.name == operation))
    }

    pub async fn store(&self, source: &str, descriptors: Vec<ToolDescriptor>) {
        self.entries
            .write()
            .await
            .insert(source.to_string(), descriptors.into());
    }

    pub async fn invalidate(&self, source: &str) -> bool {
        self.entries.write().await.remove(source).is_some()
    }

    async fn discovery_lock(&self, source: &str) -> Arc<Mutex<()>> {
        self.discovery_locks
            .lock()
            .await
            .entry(source.to_string())
            .or_default()
            .clone()
    }
}

/// Manages discovery and per-call connections for external tool sources
pub struct ExternalToolChannel {
    connector: Arc<dyn ChannelConnector>,
    normalizer: SchemaNormalizer,
    configs: RwLock<HashMap<String, ExternalChannelConfig>>,
    cache: DiscoveredOperationCache,
}

impl ExternalToolChannel {
    pub fn new(connector: Arc<dyn ChannelConnector>, dialect: SchemaDialect) -> Self {
        Self {
            connector,
            normalizer: SchemaNormalizer::new(dialect),
            configs: RwLock::new(HashMap::new()),
            cache: DiscoveredOperationCache::new(),
        }
    }

    /// Remember a source's configuration without contacting it
    pub async fn register(&self, config: ExternalChannelConfig) {
        self.configs
            .write()
            .await
            .insert(config.source.clone(), config);
    }

    /// Open one connection, list operations, close it and cache the result.
    ///
    /// Repeated calls overwrite the cached entry.
    pub async fn discover(&self, config: &ExternalChannelConfig) -> Result<Vec<ToolDescriptor>> {
        self.register(config.clone()).await;

        let lock = self.cache.discovery_lock(&config.source).await;
        let _guard = lock.lock().await;
        self.discover_locked(config).await
    }

    async fn discover_locked(&self, config: &ExternalChannelConfig) -> Result<Vec<ToolDescriptor>> {
        tracing::info!(source = %config.source, launch = %config.launch, "Discovering tool source");

        let mut connection = self.connector.launch(&config.source, &config.launch).await?;
        let listed = connection.list_operations().await;
        if let Err(e) = connection.close().await {
            tracing::warn!(source = %config.source, error = %e, "Error closing discovery connection");
        }
        let operations = listed?;

        let descriptors: Vec<ToolDescriptor> = operations
            .into_iter()
            .map(|op| ToolDescriptor::new(op.name, op.description, self.normalizer.normalize(&op.input_schema)))
            .collect();

        tracing::info!(source = %config.source, operations = descriptors.len(), "Discovered operations");
        self.cache.store(&config.source, descriptors.clone()).await;
        Ok(descriptors)
    }

    /// Rediscover `source` unless someone else already found `operation` while we waited.
    async fn rediscover_for(&self, source: &str, operation: &str) -> Result<()> {
        let config = self.config(source).await?;
        let lock = self.cache.discovery_lock(source).await;
        let _guard = lock.lock().await;
        if self.cache.contains(source, operation).await {
            return Ok(());
        }
        self.discover_locked(&config).await.map(|_| ())
    }

    async fn config(&self, source: &str) -> Result<ExternalChannelConfig> {
        self.configs
            .read()
            .await
            .get(source)
            .cloned()
            .ok_or_else(|| AgentError::channel_unavailable(source, "tool source is not registered"))
    }

    /// Cached descriptors for a source (local operation names)
    pub async fn cached(&self, source: &str) -> Option<Arc<[ToolDescriptor]>> {
        self.cache.get(source).await
    }

    /// Drop the cached operations of a source; the next call rediscovers
    pub async fn invalidate(&self, source: &str) -> bool {
        self.cache.invalidate(source).await
    }

    /// Call one operation over a fresh connection.
    pub async fn invoke(&self, source: &str, operation: &str, arguments: Value) -> Result<ToolResultPayload> {
        if !self.cache.contains(source, operation).await {
            tracing::debug!(source, operation, "Operation not cached, rediscovering");
            self.rediscover_for(source, operation).await?;
            if !self.cache.contains(source, operation).await {
                return Err(AgentError::OperationNotFound {
                    source_name: source.to_string(),
                    operation: operation.to_string(),
                });
            }
        }

        let arguments = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(AgentError::schema_violation(
                    operation,
                    "arguments must be an object",
                ));
            }
        };

        let config = self.config(source).await?;
        let mut connection = self.connector.launch(source, &config.launch).await?;
        tracing::debug!(source, operation, "Calling operation");

        let result = connection.call_operation(operation, arguments).await;
        if let Err(e) = connection.close().await {
            tracing::warn!(source, error = %e, "Error closing call connection");
        }

        match &result {
            Ok(_) => tracing::debug!(source, operation, "Operation completed"),
            Err(e) => tracing::warn!(source, operation, error = %e, "Operation failed"),
        }
        result
    }
}

/// A registry entry backed by an external channel
pub struct ExternalTool {
    channel: Arc<ExternalToolChannel>,
    source: String,
    operation: String,
    name: String,
    description: String,
    parameters: Value,
}

impl ExternalTool {
    pub fn new(
        channel: Arc<ExternalToolChannel>,
        source: &str,
        local: &ToolDescriptor,
        name: String,
    ) -> Self {
        Self {
            channel,
            source: source.to_string(),
            operation: local.name.clone(),
            name,
            description: local.description.clone(),
            parameters: local.parameters.to_value(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

#[async_trait]
impl Tool for ExternalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn invoke(&self, arguments: Value) -> Result<ToolResultPayload> {
        self.channel
            .invoke(&self.source, &self.operation, arguments)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeSource};
    use crate::tool::{ToolCall, ToolRegistry};
    use serde_json::json;

    fn channel_with(connector: &Arc<FakeConnector>) -> Arc<ExternalToolChannel> {
        Arc::new(ExternalToolChannel::new(connector.clone(), SchemaDialect::openai()))
    }

    #[test]
    fn test_config_deserializes_both_launch_kinds() {
        let command: ExternalChannelConfig = serde_json::from_value(json!({
            "name": "fetch",
            "command": "uvx",
            "args": ["mcp-server-fetch"],
            "allowed_tools": ["fetch"]
        }))
        .unwrap();
        assert!(command.enabled);
        assert!(matches!(command.launch, LaunchSpec::Command { ref command, .. } if command == "uvx"));
        assert!(command.allows("fetch"));
        assert!(!command.allows("other"));

        let url: ExternalChannelConfig = serde_json::from_value(json!({
            "source": "lights",
            "url": "http://localhost:8123/mcp",
            "enabled": false
        }))
        .unwrap();
        assert!(!url.enabled);
        assert_eq!(url.launch.to_string(), "http://localhost:8123/mcp");
        assert!(url.allows("anything"));
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let connector = Arc::new(FakeConnector::new().with_source(
            FakeSource::new("fetch").operation("fetch", json!({"properties": {"url": {"type": "string"}}})),
        ));
        let channel = channel_with(&connector);
        let config = ExternalChannelConfig::command("fetch", "uvx", vec!["mcp-server-fetch".into()]);

        let first = channel.discover(&config).await.unwrap();
        let cached_first = channel.cached("fetch").await.unwrap().to_vec();
        let second = channel.discover(&config).await.unwrap();
        let cached_second = channel.cached("fetch").await.unwrap().to_vec();

        assert_eq!(first, second);
        assert_eq!(cached_first, cached_second);
        assert_eq!(connector.launches(), 2);
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_each_invoke_opens_and_closes_a_connection() {
        let connector = Arc::new(FakeConnector::new().with_source(
            FakeSource::new("fetch").operation("fetch", json!({"properties": {"url": {"type": "string"}}})),
        ));
        let channel = channel_with(&connector);
        let config = ExternalChannelConfig::command("fetch", "uvx", vec![]);
        channel.discover(&config).await.unwrap();

        for _ in 0..3 {
            let payload = channel
                .invoke("fetch", "fetch", json!({"url": "https://example.com"}))
                .await
                .unwrap();
            assert_eq!(payload.into_text(), "fetch:fetch ok");
        }

        assert_eq!(connector.launches(), 4);
        assert_eq!(connector.closes(), 4);
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_rediscovers_once_then_fails() {
        let connector = Arc::new(FakeConnector::new().with_source(
            FakeSource::new("lights").operation("turn_on", json!({})),
        ));
        let channel = channel_with(&connector);
        channel
            .discover(&ExternalChannelConfig::command("lights", "lightsd", vec![]))
            .await
            .unwrap();

        let err = channel
            .invoke("lights", "turn_off", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::OperationNotFound { ref operation, .. } if operation == "turn_off"));
        // initial discovery + one rediscovery, no call connection
        assert_eq!(connector.launches(), 2);
    }

    #[tokio::test]
    async fn test_invalidated_cache_is_repopulated() {
        let connector = Arc::new(FakeConnector::new().with_source(
            FakeSource::new("fetch").operation("fetch", json!({})),
        ));
        let channel = channel_with(&connector);
        channel
            .discover(&ExternalChannelConfig::command("fetch", "uvx", vec![]))
            .await
            .unwrap();

        assert!(channel.invalidate("fetch").await);
        assert!(channel.cached("fetch").await.is_none());

        channel.invoke("fetch", "fetch", json!({})).await.unwrap();
        assert!(channel.cached("fetch").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_rediscover_once() {
        let connector = Arc::new(FakeConnector::new().with_source(
            FakeSource::new("fetch").operation("fetch", json!({})),
        ));
        let channel = channel_with(&connector);
        channel
            .discover(&ExternalChannelConfig::command("fetch", "uvx", vec![]))
            .await
            .unwrap();
        channel.invalidate("fetch").await;
        let before = connector.launches();

        let calls = 8;
        let handles: Vec<_> = (0..calls)
            .map(|_| {
                let channel = channel.clone();
                tokio::spawn(async move { channel.invoke("fetch", "fetch", json!({})).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // one rediscovery plus one connection per call
        assert_eq!(connector.launches() - before, calls + 1);
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_channel_unavailable() {
        let connector = Arc::new(FakeConnector::new());
        let channel = channel_with(&connector);
        let err = channel
            .discover(&ExternalChannelConfig::command("ghost", "missing-binary", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ChannelUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_mid_call_drop_is_channel_io_and_connection_closed() {
        let connector = Arc::new(FakeConnector::new().with_source(
            FakeSource::new("flaky").operation("read", json!({})).failing("read"),
        ));
        let channel = channel_with(&connector);
        channel
            .discover(&ExternalChannelConfig::command("flaky", "flaky", vec![]))
            .await
            .unwrap();

        let err = channel.invoke("flaky", "read", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::ChannelIo { .. }));
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_registry_namespaces_identical_operations() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_source(FakeSource::new("alpha").operation("fetch", json!({})))
                .with_source(FakeSource::new("beta").operation("fetch", json!({}))),
        );
        let channel = channel_with(&connector);
        let sources = vec![
            ExternalChannelConfig::command("alpha", "alpha", vec![]),
            ExternalChannelConfig::command("beta", "beta", vec![]),
        ];

        let registry = ToolRegistry::build(SchemaDialect::openai(), &channel, &sources, None).await;
        assert_eq!(registry.names(), vec!["alpha__fetch", "beta__fetch"]);

        let a = registry
            .dispatch(&ToolCall::new("1", "alpha__fetch", json!({})))
            .await
            .unwrap();
        let b = registry
            .dispatch(&ToolCall::new("2", "beta__fetch", json!({})))
            .await
            .unwrap();
        assert_eq!(a.into_text(), "alpha:fetch ok");
        assert_eq!(b.into_text(), "beta:fetch ok");
    }

    #[tokio::test]
    async fn test_registry_applies_whitelist_filter_and_skips_failures() {
        let connector = Arc::new(
            FakeConnector::new()
                .with_source(
                    FakeSource::new("lights")
                        .operation("turn_on", json!({}))
                        .operation("factory_reset", json!({})),
                )
                .with_source(FakeSource::new("weather").operation("forecast", json!({})))
                .with_source(FakeSource::new("empty")),
        );
        let channel = channel_with(&connector);
        let mut disabled = ExternalChannelConfig::command("weather", "weather", vec![]);
        disabled.enabled = false;
        let sources = vec![
            ExternalChannelConfig::command("lights", "lights", vec![]).with_allowed_operations(["turn_on"]),
            disabled,
            ExternalChannelConfig::command("broken", "broken", vec![]),
            ExternalChannelConfig::command("empty", "empty", vec![]),
        ];

        let registry = ToolRegistry::build(SchemaDialect::openai(), &channel, &sources, None).await;
        assert_eq!(registry.names(), vec!["lights__turn_on"]);

        let filtered = ToolRegistry::build(
            SchemaDialect::openai(),
            &channel,
            &sources,
            Some(&["empty".to_string()][..]),
        )
        .await;
        assert!(filtered.is_empty());
    }
}
