use crate::types::{ChatRequest, ChatResponse, ModelInfo};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Authentication,

    #[error("Model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

impl ModelError {
    /// Whether another attempt at the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            ModelError::ServiceUnavailable { .. } | ModelError::Timeout | ModelError::RateLimit => {
                true
            }
            ModelError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Map an HTTP status returned by a model endpoint.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ModelError::Authentication,
            404 => ModelError::ModelNotFound { model: body },
            408 => ModelError::Timeout,
            429 => ModelError::RateLimit,
            502..=504 => ModelError::ServiceUnavailable { message: body },
            _ => ModelError::Api {
                status,
                message: body,
            },
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, service: &str) -> Self {
        if err.is_timeout() {
            ModelError::Timeout
        } else if err.is_connect() {
            ModelError::ServiceUnavailable {
                message: format!("Cannot connect to {} service", service),
            }
        } else {
            ModelError::Network(err)
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse>;

    async fn list_models(&self) -> ModelResult<Vec<ModelInfo>>;

    async fn health_check(&self) -> ModelResult<()>;

    fn provider_name(&self) -> &'static str;
}
