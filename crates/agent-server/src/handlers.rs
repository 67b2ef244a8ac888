//! HTTP/WebSocket Handlers

use axum::{
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    http::StatusCode,
    response::Response,
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use agent_core::{ExchangeEvent, ToolDescriptor};

use crate::state::{AppState, CheckoutError};

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub model: String,
    pub provider_connected: bool,
    pub tools: usize,
}

#[derive(Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Continue a conversation returned by an earlier request
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub is_error: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub conversation_id: String,
    pub model: String,
    pub turns: usize,
    pub truncated: bool,
    pub tool_calls: Vec<ToolCallRecord>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

impl From<CheckoutError> for ApiError {
    fn from(e: CheckoutError) -> Self {
        match e {
            CheckoutError::NotFound(id) => {
                api_error(StatusCode::NOT_FOUND, format!("unknown conversation '{}'", id), "CONVERSATION_NOT_FOUND")
            }
            CheckoutError::Busy(id) => api_error(
                StatusCode::CONFLICT,
                format!("conversation '{}' has an exchange in progress", id),
                "CONVERSATION_BUSY",
            ),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider = state.engine.provider();
    let info = provider.info();
    let provider_connected = provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        provider: info.name,
        model: info.model,
        provider_connected,
        tools: state.engine.tools().len(),
    })
}

/// Registered tools as offered to the model
pub async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.engine.tools().descriptors(),
    })
}

/// Run one exchange and return the collected result
pub async fn chat_handler(
    State(state): State<AppState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message must not be empty", "EMPTY_MESSAGE"));
    }

    let conversation = state.checkout(payload.conversation_id.as_deref()).await?;
    let conversation_id = conversation.id.to_string();
    let mut exchange = state.engine.run_exchange_in(conversation, payload.message);

    let mut tool_calls = Vec::new();
    let mut outcome = None;
    let mut failure = None;
    while let Some(event) = exchange.next().await {
        match event {
            ExchangeEvent::ToolResult { id, name, is_error, .. } => {
                tool_calls.push(ToolCallRecord { id, name, is_error });
            }
            ExchangeEvent::Done { text, turns, truncated } => outcome = Some((text, turns, truncated)),
            ExchangeEvent::Failed { error, message } => failure = Some((error, message)),
            _ => {}
        }
    }

    // Fully answered turns survive a failed exchange.
    match exchange.into_conversation().await {
        Ok(conversation) => state.store(conversation).await,
        Err(e) => {
            tracing::error!(conversation = %conversation_id, error = %e, "Lost conversation state");
            state.forget(&conversation_id).await;
        }
    }

    if let Some((error, message)) = failure {
        tracing::error!(conversation = %conversation_id, error = %error, "Exchange failed");
        return Err(api_error(StatusCode::BAD_GATEWAY, message, "EXCHANGE_FAILED"));
    }
    let Some((message, turns, truncated)) = outcome else {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "exchange ended without a result",
            "EXCHANGE_INCOMPLETE",
        ));
    };

    Ok(Json(ChatResponse {
        message,
        conversation_id,
        model: state.engine.config().generation.model.clone(),
        turns,
        truncated,
        tool_calls,
    }))
}

/// WebSocket streaming endpoint
pub async fn chat_stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

/// One exchange per text frame; every [`ExchangeEvent`] goes out as a JSON text frame.
async fn handle_stream(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket receive error");
                break;
            }
        };

        // Plain text is accepted as a message on a fresh conversation.
        let request = serde_json::from_str::<ChatRequest>(&text).unwrap_or_else(|_| ChatRequest {
            message: text.to_string(),
            conversation_id: None,
        });
        if request.message.trim().is_empty() {
            let error = serde_json::json!({ "type": "failed", "error": "empty message", "message": "Message must not be empty." });
            if sender.send(Message::Text(error.to_string().into())).await.is_err() {
                break;
            }
            continue;
        }

        let conversation = match state.checkout(request.conversation_id.as_deref()).await {
            Ok(conversation) => conversation,
            Err(e) => {
                let (_, Json(body)) = ApiError::from(e);
                let error = serde_json::json!({ "type": "failed", "error": body.code, "message": body.error });
                if sender.send(Message::Text(error.to_string().into())).await.is_err() {
                    break;
                }
                continue;
            }
        };
        let conversation_id = conversation.id;
        let mut exchange = state.engine.run_exchange_in(conversation, request.message);
        tracing::debug!(conversation = %conversation_id, "Streaming exchange started");

        let mut client_gone = false;
        while let Some(event) = exchange.next().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode exchange event");
                    continue;
                }
            };
            if sender.send(Message::Text(payload.into())).await.is_err() {
                exchange.cancel();
                client_gone = true;
                break;
            }
        }

        match exchange.into_conversation().await {
            Ok(conversation) => state.store(conversation).await,
            Err(e) => {
                tracing::error!(conversation = %conversation_id, error = %e, "Lost conversation state");
                state.forget(&conversation_id.to_string()).await;
            }
        }

        if client_gone {
            tracing::debug!(conversation = %conversation_id, "Client disconnected, exchange cancelled");
            break;
        }
        let ack = serde_json::json!({ "type": "conversation", "conversation_id": conversation_id.to_string() });
        if sender.send(Message::Text(ack.to_string().into())).await.is_err() {
            break;
        }
    }
}
