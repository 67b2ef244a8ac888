//! Shared HTTP plumbing for streaming providers.

use agent_core::{
    error::{AgentError, Result},
    stream::RawEventStream,
};
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

/// Build the client used for model requests.
pub(crate) fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| AgentError::Config(format!("HTTP client: {}", e)))
}

/// Map a failed send to the provider error taxonomy.
pub(crate) fn send_error(provider: &str, error: &reqwest::Error) -> AgentError {
    if error.is_connect() || error.is_timeout() {
        AgentError::ProviderUnavailable(format!("{}: {}", provider, error))
    } else {
        AgentError::Provider(format!("{}: {}", provider, error))
    }
}

/// Fail on non-2xx responses, keeping the body for the error message.
pub(crate) async fn ensure_success(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(provider, status = %status, body = %body, "Model request rejected");
    let message = format!("{} returned {}: {}", provider, status, body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(AgentError::ProviderUnavailable(message))
    } else {
        Err(AgentError::Provider(message))
    }
}

/// Body of a streaming response as raw chunks.
pub(crate) fn byte_stream(provider: &'static str, response: Response) -> RawEventStream {
    Box::pin(
        response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| AgentError::Provider(format!("{}: {}", provider, e)))),
    )
}
