use crate::config::OllamaConfig;
use crate::provider::{ModelError, ModelProvider, ModelResult};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, ModelInfo, ResponseFormat, Usage,
};
use async_trait::async_trait;
use ollama_rs::Ollama;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[derive(Serialize)]
struct OllamaApiRequest {
    model: String,
    messages: Vec<OllamaApiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaApiOptions>,
}

#[derive(Serialize)]
struct OllamaApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OllamaApiOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaApiResponse {
    message: OllamaApiResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaApiResponseMessage {
    content: String,
}

/// Judge backend for a local Ollama server.
///
/// Chat goes straight to `/api/chat` so JSON mode and sampling options can be
/// passed through; model listing uses the `ollama-rs` client.
pub struct OllamaProvider {
    client: Ollama,
    http_client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> ModelResult<Self> {
        config
            .validate()
            .map_err(|msg| ModelError::InvalidConfig { message: msg })?;

        let host = config.base_url.trim_end_matches('/').to_string();
        let (scheme_host, port) = split_port(&host);
        let client = Ollama::new(scheme_host, port);

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::Unknown {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            http_client,
            base_url: host,
        })
    }

    pub fn with_default_config() -> ModelResult<Self> {
        Self::new(OllamaConfig::default())
    }

    fn build_request_body(request: &ChatRequest) -> OllamaApiRequest {
        let messages = request
            .messages
            .iter()
            .map(|m| OllamaApiMessage {
                role: m.role.as_str(),
                content: m.content.clone(),
            })
            .collect();

        let options = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(OllamaApiOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            })
        } else {
            None
        };

        OllamaApiRequest {
            model: request.model.clone(),
            messages,
            stream: false,
            format: match request.response_format {
                ResponseFormat::JsonObject => Some("json"),
                ResponseFormat::Text => None,
            },
            options,
        }
    }

    fn parse_response(response: OllamaApiResponse) -> ChatResponse {
        let prompt_tokens = response.prompt_eval_count.unwrap_or(0) as u32;
        let completion_tokens = response.eval_count.unwrap_or(0) as u32;

        ChatResponse {
            choices: vec![Choice {
                message: ChatMessage::assistant(response.message.content),
                finish_reason: Some(
                    response
                        .done_reason
                        .as_deref()
                        .map(FinishReason::from_wire)
                        .unwrap_or(FinishReason::Stop),
                ),
            }],
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        }
    }

    fn handle_ollama_error(err: ollama_rs::error::OllamaError) -> ModelError {
        match err {
            ollama_rs::error::OllamaError::ReqwestError(e) => {
                if e.is_timeout() {
                    ModelError::Timeout
                } else if e.is_connect() {
                    ModelError::ServiceUnavailable {
                        message: "Cannot connect to Ollama service".to_string(),
                    }
                } else {
                    ModelError::Unknown {
                        message: format!("Network error: {}", e),
                    }
                }
            }
            ollama_rs::error::OllamaError::JsonError(e) => ModelError::Serialization(e),
            _ => ModelError::Unknown {
                message: format!("Ollama error: {}", err),
            },
        }
    }
}

/// `Ollama::new` takes host and port separately.
fn split_port(url: &str) -> (String, u16) {
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    if let Some(idx) = url[after_scheme..].rfind(':') {
        let idx = after_scheme + idx;
        if let Ok(port) = url[idx + 1..].parse::<u16>() {
            return (url[..idx].to_string(), port);
        }
    }
    (url.to_string(), 11434)
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse> {
        debug!("Starting chat request with model: {}", request.model);

        let body = Self::build_request_body(&request);
        let url = format!("{}/api/chat", self.base_url);

        let http_response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, "Ollama"))?;

        let status = http_response.status();
        if !status.is_success() {
            let error_text = http_response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), error_text));
        }

        let api_response: OllamaApiResponse = http_response
            .json()
            .await
            .map_err(|e| ModelError::from_reqwest(e, "Ollama"))?;

        debug!("Chat request completed");

        Ok(Self::parse_response(api_response))
    }

    async fn list_models(&self) -> ModelResult<Vec<ModelInfo>> {
        debug!("Listing available models");

        let models = self
            .client
            .list_local_models()
            .await
            .map_err(Self::handle_ollama_error)?;

        let model_infos: Vec<ModelInfo> = models
            .into_iter()
            .map(|model| ModelInfo {
                name: model.name,
                size: Some(model.size),
                modified_at: Some(model.modified_at),
            })
            .collect();

        info!("Retrieved {} models", model_infos.len());
        Ok(model_infos)
    }

    async fn health_check(&self) -> ModelResult<()> {
        debug!("Performing health check");

        match self.list_models().await {
            Ok(_) => {
                info!("Health check passed");
                Ok(())
            }
            Err(e) => {
                error!("Health check failed: {}", e);
                Err(e)
            }
        }
    }

    fn provider_name(&self) -> &'static str {
        "ollama"
    }
}
