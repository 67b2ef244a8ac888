//! rust-agent HTTP Server
//!
//! Axum-based server exposing the conversation engine over REST and
//! WebSocket. Tools come from the built-in registry plus whatever MCP
//! sources are configured and reachable at startup.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{routing::{get, post}, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{tool::DateTimeTool, EngineBuilder, ExternalToolChannel, LlmProvider, ToolRegistry};
use agent_runtime::{OllamaConfig, OllamaProvider, OpenAiConfig, OpenAiProvider, RmcpConnector};

use crate::config::{ProviderKind, ServerConfig};
use crate::handlers::{chat_handler, chat_stream_handler, health_check, list_tools};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env()?;

    // Initialize LLM provider
    let provider = build_provider(&config)?;
    let info = provider.info();
    match provider.health_check().await {
        Ok(true) => tracing::info!(provider = %info.name, model = %info.model, "✓ Connected to model provider"),
        Ok(false) | Err(_) => {
            tracing::warn!(provider = %info.name, "⚠ Model provider not available - exchanges will fail");
            if config.provider == ProviderKind::Ollama {
                tracing::warn!("  Make sure Ollama is running: ollama serve");
            }
        }
    }

    // Initialize tools
    let dialect = provider.schema_dialect();
    let mut tools = ToolRegistry::with_dialect(dialect);
    tools.register(DateTimeTool)?;

    let channel = Arc::new(ExternalToolChannel::new(Arc::new(RmcpConnector::new()), dialect));
    let external = tools
        .register_sources(&channel, &config.sources, config.source_filter.as_deref())
        .await;

    tracing::info!("Registered {} tools ({} external):", tools.len(), external);
    for name in tools.names() {
        tracing::info!("  • {}", name);
    }

    let mut builder = EngineBuilder::new()
        .provider(provider)
        .tools(Arc::new(tools))
        .model(config.model.clone().unwrap_or(info.model))
        .max_turns(config.max_turns)
        .tool_retries(config.tool_retries);
    if let Some(timeout) = config.tool_timeout {
        builder = builder.tool_timeout(timeout);
    }
    let engine = Arc::new(builder.build()?);

    let app = router(AppState::new(engine));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 rust-agent server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health          - Health check");
    tracing::info!("  GET  /api/tools       - List registered tools");
    tracing::info!("  POST /api/chat        - Run one exchange");
    tracing::info!("  GET  /api/chat/stream - WebSocket streaming");
    tracing::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_provider(config: &ServerConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider {
        ProviderKind::Ollama => {
            let mut ollama = OllamaConfig::from_env();
            if let Some(model) = &config.model {
                ollama.model.clone_from(model);
            }
            Arc::new(OllamaProvider::from_config(ollama)?)
        }
        ProviderKind::OpenAi => {
            let mut openai = OpenAiConfig::from_env();
            if let Some(model) = &config.model {
                openai.model.clone_from(model);
            }
            Arc::new(OpenAiProvider::from_config(openai)?)
        }
    };
    Ok(provider)
}

pub(crate) fn router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/tools", get(list_tools))
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
