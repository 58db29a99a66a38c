use crate::channel::{ChannelResponse, ChannelServer};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The remote side has no handler for the method
    #[error("No handler for method: {0}")]
    NoHandler(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Transport failure: {0}")]
    Connection(String),

    #[error("Invalid response: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether trying the same call again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::NoHandler(_))
    }
}

impl ChannelResponse {
    pub fn into_result(self, method: &str) -> Result<Value, TransportError> {
        match self {
            ChannelResponse::Success { result } => Ok(result),
            ChannelResponse::Failure {
                channel_error: true,
                ..
            } => Err(TransportError::NoHandler(method.to_string())),
            ChannelResponse::Failure { error, .. } => Err(TransportError::Handler(error)),
        }
    }
}

/// Carries channel calls across some process boundary.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, method: &str, args: Value) -> Result<Value, TransportError>;
}

/// Dispatches straight into a channel in the same process.
pub struct InProcessTransport {
    channel: Arc<ChannelServer>,
}

impl InProcessTransport {
    pub fn new(channel: Arc<ChannelServer>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn call(&self, method: &str, args: Value) -> Result<Value, TransportError> {
        self.channel.dispatch(method, args).await.into_result(method)
    }
}

/// Calls a channel exposed by the flowserver binary at
/// `POST {base_url}/api/channel/{method}`.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn endpoint(&self, method: &str) -> String {
        format!("{}/api/channel/{}", self.base_url, method)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: &str, args: Value) -> Result<Value, TransportError> {
        let url = self.endpoint(method);
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(&args)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let status = response.status();
        let body: ChannelResponse = response.json().await.map_err(|e| {
            TransportError::Protocol(format!("HTTP {} with unreadable body: {}", status, e))
        })?;
        body.into_result(method)
    }
}
