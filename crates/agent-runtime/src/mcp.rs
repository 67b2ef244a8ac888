//! MCP Tool Sources
//!
//! [`RmcpConnector`] reaches Model Context Protocol servers through `rmcp`,
//! either by spawning them as child processes (stdio) or over streamable
//! HTTP. Each [`ChannelConnection`] owns one running client service; closing
//! it cancels the service, which also terminates a spawned process.

use agent_core::{
    channel::{ChannelConnection, ChannelConnector, LaunchSpec, RemoteOperation},
    error::{AgentError, Result},
    tool::{ContentBlock, ToolResultPayload},
};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult, RawContent, ResourceContents};
use rmcp::service::{RoleClient, RunningService, ServiceExt};
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use serde_json::{Map, Value};
use tokio::process::Command;

/// Connector for MCP servers
#[derive(Clone, Debug, Default)]
pub struct RmcpConnector;

impl RmcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelConnector for RmcpConnector {
    async fn launch(&self, source: &str, spec: &LaunchSpec) -> Result<Box<dyn ChannelConnection>> {
        let service = match spec {
            LaunchSpec::Command { command, args, env } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                for (k, v) in env {
                    cmd.env(k, v);
                }

                let transport = TokioChildProcess::new(cmd)
                    .map_err(|e| AgentError::channel_unavailable(source, format!("failed to spawn '{}': {}", command, e)))?;
                ().serve(transport)
                    .await
                    .map_err(|e| AgentError::channel_unavailable(source, format!("MCP handshake failed: {}", e)))?
            }
            LaunchSpec::Url { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.clone());
                ().serve(transport)
                    .await
                    .map_err(|e| AgentError::channel_unavailable(source, format!("MCP handshake with {} failed: {}", url, e)))?
            }
        };

        tracing::debug!(source, launch = %spec, "MCP connection opened");
        Ok(Box::new(RmcpConnection {
            source: source.to_string(),
            service,
        }))
    }
}

struct RmcpConnection {
    source: String,
    service: RunningService<RoleClient, ()>,
}

#[async_trait]
impl ChannelConnection for RmcpConnection {
    async fn list_operations(&mut self) -> Result<Vec<RemoteOperation>> {
        let tools = self
            .service
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| AgentError::channel_io(&self.source, format!("list_tools failed: {}", e)))?;

        Ok(tools
            .into_iter()
            .map(|tool| RemoteOperation {
                name: tool.name.to_string(),
                description: tool.description.as_ref().map(|d| d.to_string()).unwrap_or_default(),
                input_schema: Value::Object((*tool.input_schema).clone()),
            })
            .collect())
    }

    async fn call_operation(&mut self, operation: &str, arguments: Map<String, Value>) -> Result<ToolResultPayload> {
        let params = CallToolRequestParams {
            meta: None,
            name: operation.to_string().into(),
            arguments: Some(arguments),
            task: None,
        };

        let result = self
            .service
            .peer()
            .call_tool(params)
            .await
            .map_err(|e| AgentError::channel_io(&self.source, format!("call to '{}' failed: {}", operation, e)))?;

        if result.is_error.unwrap_or(false) {
            let reason = convert_result(result).into_text();
            return Err(AgentError::ToolFailed {
                tool: format!("{}/{}", self.source, operation),
                reason,
            });
        }
        Ok(convert_result(result))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let RmcpConnection { source, service } = *self;
        service
            .cancel()
            .await
            .map(|reason| tracing::debug!(source = %source, reason = ?reason, "MCP connection closed"))
            .map_err(|e| AgentError::channel_io(&source, format!("shutdown failed: {}", e)))
    }
}

/// Convert an MCP call result into a payload.
fn convert_result(result: CallToolResult) -> ToolResultPayload {
    if result.content.is_empty() {
        return result
            .structured_content
            .map_or(ToolResultPayload::Empty, ToolResultPayload::Structured);
    }

    let blocks = result
        .content
        .into_iter()
        .map(|content| match content.raw {
            RawContent::Text(text) => ContentBlock::Text(text.text),
            RawContent::Image(image) => ContentBlock::Binary { mime_type: image.mime_type.clone() },
            RawContent::Audio(audio) => ContentBlock::Binary { mime_type: audio.mime_type.clone() },
            RawContent::Resource(embedded) => match embedded.resource {
                ResourceContents::TextResourceContents { uri, text, .. } => ContentBlock::Resource { uri, text: Some(text) },
                ResourceContents::BlobResourceContents { uri, .. } => ContentBlock::Resource { uri, text: None },
            },
            other => ContentBlock::Other(serde_json::to_value(&other).unwrap_or(Value::Null)),
        })
        .collect();
    ToolResultPayload::Blocks(blocks)
}
