use crate::config::OpenAiConfig;
use crate::provider::{ModelError, ModelProvider, ModelResult};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, ModelInfo, ResponseFormat, Usage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// OpenAI-compatible chat completion request
#[derive(Debug, Clone, Serialize)]
struct CompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct CompletionResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelData>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModelData {
    id: String,
}

/// Judge backend for OpenAI-compatible endpoints, including Azure OpenAI deployments.
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> ModelResult<Self> {
        config
            .validate()
            .map_err(|msg| ModelError::InvalidConfig { message: msg })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::Unknown {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn completions_url(&self, model: &str) -> String {
        match &self.config.api_version {
            Some(version) => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.base_url(),
                model,
                version
            ),
            None => format!("{}/v1/chat/completions", self.base_url()),
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.is_azure() {
            builder.header("api-key", &self.config.api_key)
        } else {
            builder.bearer_auth(&self.config.api_key)
        }
    }

    fn build_request_body(&self, request: &ChatRequest) -> CompletionRequest {
        CompletionRequest {
            // Azure routes by deployment in the URL
            model: (!self.config.is_azure()).then(|| request.model.clone()),
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str().to_string(),
                    content: Some(m.content.clone()),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: match request.response_format {
                ResponseFormat::JsonObject => Some(WireResponseFormat {
                    format_type: "json_object",
                }),
                ResponseFormat::Text => None,
            },
        }
    }

    async fn error_from_response(response: reqwest::Response) -> ModelError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ModelError::from_status(status, body)
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse> {
        debug!("Starting chat request with model: {}", request.model);

        let body = self.build_request_body(&request);
        let url = self.completions_url(&request.model);

        let response = self
            .authorize(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, "judge model"))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::from_reqwest(e, "judge model"))?;

        let choices = completion
            .choices
            .into_iter()
            .map(|choice| Choice {
                message: ChatMessage::assistant(choice.message.content.unwrap_or_default()),
                finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_wire),
            })
            .collect();

        let usage = completion.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        debug!("Chat request completed");

        Ok(ChatResponse { choices, usage })
    }

    async fn list_models(&self) -> ModelResult<Vec<ModelInfo>> {
        if self.config.is_azure() {
            // Deployments are not listable with a data-plane key
            return Ok(vec![]);
        }

        let url = format!("{}/v1/models", self.base_url());
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, "judge model"))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| ModelError::from_reqwest(e, "judge model"))?;

        let model_infos: Vec<ModelInfo> = models
            .data
            .into_iter()
            .map(|model| ModelInfo {
                name: model.id,
                size: None,
                modified_at: None,
            })
            .collect();

        info!("Retrieved {} models", model_infos.len());
        Ok(model_infos)
    }

    async fn health_check(&self) -> ModelResult<()> {
        debug!("Performing health check");

        // A one-token completion exercises auth, routing and the deployment.
        let probe = ChatRequest::new(
            self.config.default_model.clone(),
            vec![ChatMessage::user("ping")],
        )
        .with_max_tokens(1);

        match self.chat(probe).await {
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
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn standard(url: &str) -> OpenAiProvider {
        OpenAiProvider::new(
            OpenAiConfig::new()
                .with_base_url(url)
                .with_api_key("sk-test")
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = OpenAiProvider::new(OpenAiConfig::default());
        assert!(matches!(result, Err(ModelError::InvalidConfig { .. })));
    }

    #[test]
    fn test_azure_url_and_body() {
        let provider = OpenAiProvider::new(OpenAiConfig::azure(
            "https://res.openai.azure.com/",
            "key",
            "2024-10-21",
        ))
        .unwrap();

        assert_eq!(
            provider.completions_url("gpt-4o"),
            "https://res.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-10-21"
        );

        let body = provider.build_request_body(
            &ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")]).with_json_output(),
        );
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("model").is_none());
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[tokio::test]
    async fn test_chat_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"{\"score\":0.9}"},"finish_reason":"stop"}],
                    "usage":{"prompt_tokens":12,"completion_tokens":4,"total_tokens":16}}"#,
            )
            .create_async()
            .await;

        let provider = standard(&server.url());
        let response = provider
            .chat(ChatRequest::new("judge", vec![ChatMessage::user("grade")]))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.first_content(), Some("{\"score\":0.9}"));
        assert_eq!(response.usage.unwrap().total_tokens, 16);
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn test_chat_maps_http_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let provider = standard(&server.url());
        let err = provider
            .chat(ChatRequest::new("judge", vec![ChatMessage::user("grade")]))
            .await
            .unwrap_err();

        assert!(matches!(err, ModelError::RateLimit));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_list_models() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/models")
            .with_status(200)
            .with_body(r#"{"data":[{"id":"gpt-4o"},{"id":"gpt-4o-mini"}]}"#)
            .create_async()
            .await;

        let models = standard(&server.url()).list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[1].name, "gpt-4o-mini");
    }
}
