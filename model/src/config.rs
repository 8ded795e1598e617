use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection settings for an OpenAI-compatible chat-completions endpoint.
///
/// When `api_version` is set the endpoint is treated as an Azure OpenAI
/// resource: requests go to `/openai/deployments/{model}/chat/completions`
/// and authenticate with the `api-key` header. Otherwise the standard
/// `/v1/chat/completions` path with bearer authentication is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_version: Option<String>,
    /// Model (or Azure deployment) probed by health checks
    pub default_model: String,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: String::new(),
            api_version: None,
            default_model: "gpt-4o".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl OpenAiConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Azure OpenAI resource, e.g. `https://my-resource.openai.azure.com`.
    pub fn azure(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            base_url: endpoint.into(),
            api_key: api_key.into(),
            api_version: Some(api_version.into()),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_azure(&self) -> bool {
        self.api_version.is_some()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err("Base URL must start with http:// or https://".to_string());
        }

        if self.api_key.is_empty() {
            return Err("API key cannot be empty".to_string());
        }

        if let Some(version) = &self.api_version {
            if version.is_empty() {
                return Err("API version cannot be empty when set".to_string());
            }
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl OllamaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err("Base URL must start with http:// or https://".to_string());
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}
