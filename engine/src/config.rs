//! Engine configuration.
//!
//! Loaded from a TOML file, then overlaid with environment variables so
//! secrets never need to live in the file:
//!
//! | Variable | Setting |
//! |---|---|
//! | `AZURE_AD_TENANT_ID` | `identity.tenant_id` |
//! | `AZURE_AD_CLIENT_ID` | `identity.client_id` |
//! | `AZURE_AD_CLIENT_SECRET` | `identity.client_secret` |
//! | `AGENT_SCOPE` | `identity.scope` |
//! | `AGENT_ENDPOINT` | `agent.endpoint` |
//! | `AZURE_OPENAI_ENDPOINT` | `judge.endpoint` |
//! | `AZURE_OPENAI_API_KEY` | `judge.api_key` |
//! | `AZURE_OPENAI_DEPLOYMENT_NAME` | `judge.model` |
//! | `AZURE_OPENAI_API_VERSION` | `judge.api_version` |
//! | `JUDGE_BACKEND` | `judge.backend` (`openai` or `ollama`) |

use crate::agent::AgentSettings;
use crate::error::{ConfigError, EngineResult};
use crate::metrics::{Metric, Thresholds};
use crate::orchestrator::RunConfig;
use model::{JudgeConfig, OllamaConfig, OpenAiConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    pub agent: AgentEndpointConfig,
    pub judge: JudgeModelConfig,
    pub run: RunSettings,
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> EngineResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Overlay settings from environment variables.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        if let Some(v) = var("AZURE_AD_TENANT_ID") {
            self.identity.tenant_id = v;
        }
        if let Some(v) = var("AZURE_AD_CLIENT_ID") {
            self.identity.client_id = v;
        }
        if let Some(v) = var("AZURE_AD_CLIENT_SECRET") {
            self.identity.client_secret = v;
        }
        if let Some(v) = var("AGENT_SCOPE") {
            self.identity.scope = v;
        }
        if let Some(v) = var("AGENT_ENDPOINT") {
            self.agent.endpoint = v;
        }
        if let Some(v) = var("AZURE_OPENAI_ENDPOINT") {
            self.judge.endpoint = v;
        }
        if let Some(v) = var("AZURE_OPENAI_API_KEY") {
            self.judge.api_key = v;
        }
        if let Some(v) = var("AZURE_OPENAI_DEPLOYMENT_NAME") {
            self.judge.model = v;
        }
        if let Some(v) = var("AZURE_OPENAI_API_VERSION") {
            self.judge.api_version = Some(v);
        }
        if let Some(v) = var("JUDGE_BACKEND") {
            self.judge.backend = v.parse()?;
        }

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity.validate()?;
        self.agent.validate()?;
        self.judge.validate()?;
        self.run.validate()
    }
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.into(),
    }
}

fn require(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn require_url(field: &str, value: &str) -> Result<(), ConfigError> {
    require(field, value)?;
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(invalid(field, "must start with http:// or https://"));
    }
    Ok(())
}

fn check_retry(field: &str, retry: &RetryPolicy) -> Result<(), ConfigError> {
    retry.validate().map_err(|message| invalid(field, message))
}

/// Identity provider (client-credentials) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub authority: String,
    pub tenant_id: String,
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: String,
    pub scope: String,
    /// Stop reusing a cached token this many seconds before it expires
    pub token_skew_secs: u64,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            authority: "https://login.microsoftonline.com".to_string(),
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: "https://api.powerplatform.com/.default".to_string(),
            token_skew_secs: 60,
            timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl IdentityConfig {
    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority.trim_end_matches('/'),
            self.tenant_id
        )
    }

    pub fn token_skew(&self) -> Duration {
        Duration::from_secs(self.token_skew_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_url("identity.authority", &self.authority)?;
        require("identity.tenant_id", &self.tenant_id)?;
        require("identity.client_id", &self.client_id)?;
        require("identity.client_secret", &self.client_secret)?;
        require("identity.scope", &self.scope)?;
        if self.token_skew_secs < crate::auth::MIN_EXPIRY_SKEW.as_secs() {
            return Err(invalid(
                "identity.token_skew_secs",
                format!("must be at least {}", crate::auth::MIN_EXPIRY_SKEW.as_secs()),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("identity.timeout_secs", "must be greater than 0"));
        }
        check_retry("identity.retry", &self.retry)
    }
}

/// Agent runtime endpoint and conversation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentEndpointConfig {
    pub endpoint: String,
    pub turn_timeout_secs: u64,
    pub retry: RetryPolicy,
    /// Exchange cap for autonomous conversations
    pub max_autonomous_turns: u32,
    pub continuation_prompt: String,
    /// Case-insensitive phrases that mark an autonomous task as done
    pub completion_markers: Vec<String>,
}

impl Default for AgentEndpointConfig {
    fn default() -> Self {
        let settings = AgentSettings::default();
        Self {
            endpoint: String::new(),
            turn_timeout_secs: settings.turn_timeout.as_secs(),
            retry: settings.retry,
            max_autonomous_turns: settings.max_autonomous_turns,
            continuation_prompt: settings.continuation_prompt,
            completion_markers: settings.completion_markers,
        }
    }
}

impl AgentEndpointConfig {
    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            turn_timeout: Duration::from_secs(self.turn_timeout_secs),
            retry: self.retry.clone(),
            max_autonomous_turns: self.max_autonomous_turns,
            continuation_prompt: self.continuation_prompt.clone(),
            completion_markers: self.completion_markers.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_url("agent.endpoint", &self.endpoint)?;
        if self.turn_timeout_secs == 0 {
            return Err(invalid("agent.turn_timeout_secs", "must be greater than 0"));
        }
        if self.max_autonomous_turns == 0 {
            return Err(invalid("agent.max_autonomous_turns", "must be at least 1"));
        }
        require("agent.continuation_prompt", &self.continuation_prompt)?;
        check_retry("agent.retry", &self.retry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeBackend {
    #[default]
    OpenAi,
    Ollama,
}

impl std::str::FromStr for JudgeBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "azure" | "azure_openai" => Ok(JudgeBackend::OpenAi),
            "ollama" => Ok(JudgeBackend::Ollama),
            other => Err(invalid(
                "judge.backend",
                format!("unknown backend '{}', expected openai or ollama", other),
            )),
        }
    }
}

/// Judge model backend and call behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeModelConfig {
    pub backend: JudgeBackend,
    /// Azure OpenAI resource or OpenAI-compatible base URL
    pub endpoint: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Model name, or Azure deployment name
    pub model: String,
    /// Set for Azure OpenAI deployments
    pub api_version: Option<String>,
    pub ollama_url: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub retry: RetryPolicy,
    pub verbose_logging: bool,
}

impl Default for JudgeModelConfig {
    fn default() -> Self {
        Self {
            backend: JudgeBackend::OpenAi,
            endpoint: String::new(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            api_version: Some("2024-10-21".to_string()),
            ollama_url: OllamaConfig::default().base_url,
            timeout_secs: 60,
            temperature: 0.0,
            retry: RetryPolicy::default(),
            verbose_logging: false,
        }
    }
}

impl JudgeModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn openai(&self) -> OpenAiConfig {
        let config = OpenAiConfig::new()
            .with_base_url(self.endpoint.clone())
            .with_api_key(self.api_key.clone())
            .with_default_model(self.model.clone())
            .with_timeout(self.timeout());
        OpenAiConfig {
            api_version: self.api_version.clone(),
            ..config
        }
    }

    pub fn ollama(&self) -> OllamaConfig {
        OllamaConfig::new()
            .with_base_url(self.ollama_url.clone())
            .with_timeout(self.timeout())
    }

    pub fn judge_config(&self) -> JudgeConfig {
        let mut config = JudgeConfig::default()
            .with_model(self.model.clone())
            .with_timeout(self.timeout())
            .with_retry(self.retry.clone());
        config.temperature = self.temperature;
        if self.verbose_logging {
            config = config.with_verbose_logging();
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require("judge.model", &self.model)?;
        match self.backend {
            JudgeBackend::OpenAi => {
                require_url("judge.endpoint", &self.endpoint)?;
                require("judge.api_key", &self.api_key)?;
            }
            JudgeBackend::Ollama => require_url("judge.ollama_url", &self.ollama_url)?,
        }
        if self.timeout_secs == 0 {
            return Err(invalid("judge.timeout_secs", "must be greater than 0"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid("judge.temperature", "must be between 0.0 and 2.0"));
        }
        check_retry("judge.retry", &self.retry)
    }
}

/// Run defaults, overridable per invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Items processed concurrently
    pub concurrency: usize,
    /// Default pass threshold for every metric
    pub threshold: f64,
    /// Per-metric threshold overrides
    pub thresholds: BTreeMap<Metric, f64>,
    /// Metrics to score; empty means all
    pub metrics: Vec<Metric>,
    /// Delay between starting consecutive items
    pub dispatch_interval_ms: u64,
    /// Where `JsonFileRunStore` writes run snapshots
    pub output_dir: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            threshold: 0.5,
            thresholds: BTreeMap::new(),
            metrics: Vec::new(),
            dispatch_interval_ms: 0,
            output_dir: PathBuf::from("runs"),
        }
    }
}

impl RunSettings {
    pub fn run_config(&self) -> RunConfig {
        let mut thresholds = Thresholds::new(self.threshold);
        for (metric, value) in &self.thresholds {
            thresholds = thresholds.with_override(*metric, *value);
        }

        let mut config = RunConfig::default()
            .with_concurrency(self.concurrency)
            .with_thresholds(thresholds)
            .with_dispatch_interval(Duration::from_millis(self.dispatch_interval_ms));
        if !self.metrics.is_empty() {
            config = config.with_metrics(self.metrics.iter().copied());
        }
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run_config().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: &[&str] = &[
        "AZURE_AD_TENANT_ID",
        "AZURE_AD_CLIENT_ID",
        "AZURE_AD_CLIENT_SECRET",
        "AGENT_SCOPE",
        "AGENT_ENDPOINT",
        "AZURE_OPENAI_ENDPOINT",
        "AZURE_OPENAI_API_KEY",
        "AZURE_OPENAI_DEPLOYMENT_NAME",
        "AZURE_OPENAI_API_VERSION",
        "JUDGE_BACKEND",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.run.concurrency, 5);
        assert_eq!(config.run.threshold, 0.5);
        assert_eq!(config.identity.token_skew_secs, 60);
        assert_eq!(config.agent.max_autonomous_turns, 10);
        assert_eq!(config.agent.turn_timeout_secs, 60);
        assert_eq!(config.judge.timeout_secs, 60);
        assert_eq!(config.judge.model, "gpt-4o");
        assert_eq!(config.judge.retry.max_attempts, 3);
        // no endpoint or credentials yet
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml(
            r#"
            [identity]
            tenant_id = "t"
            client_id = "c"
            client_secret = "s"
            token_skew_secs = 45

            [agent]
            endpoint = "https://agent.example.com/api"
            max_autonomous_turns = 4
            completion_markers = ["ALL DONE"]

            [judge]
            backend = "ollama"
            model = "llama3.1:8b"

            [judge.retry]
            max_attempts = 5

            [run]
            concurrency = 2
            metrics = ["toxicity", "bias"]

            [run.thresholds]
            toxicity = 0.9
            "#,
        )
        .unwrap();

        assert_eq!(config.identity.token_skew_secs, 45);
        assert_eq!(config.agent.max_autonomous_turns, 4);
        assert_eq!(config.judge.backend, JudgeBackend::Ollama);
        assert_eq!(config.judge.retry.max_attempts, 5);
        assert_eq!(config.judge.retry.base_delay_ms, 250);
        assert_eq!(config.run.metrics, vec![Metric::Toxicity, Metric::Bias]);
        assert_eq!(config.run.thresholds[&Metric::Toxicity], 0.9);
        assert!(config.validate().is_ok());

        let run = config.run.run_config();
        assert_eq!(run.concurrency, 2);
        assert_eq!(run.thresholds.for_metric(Metric::Toxicity), 0.9);
        assert_eq!(run.thresholds.for_metric(Metric::Bias), 0.5);
    }

    #[test]
    fn test_validation_errors_name_the_field() {
        let mut config = EngineConfig::from_toml(
            r#"
            [identity]
            tenant_id = "t"
            client_id = "c"
            client_secret = "s"
            token_skew_secs = 5
            "#,
        )
        .unwrap();

        match config.identity.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "identity.token_skew_secs"),
            other => panic!("unexpected: {:?}", other),
        }

        config.identity.token_skew_secs = 60;
        assert!(config.identity.validate().is_ok());
        assert_eq!(
            config.agent.validate(),
            Err(ConfigError::Missing {
                field: "agent.endpoint".to_string()
            })
        );
    }

    #[test]
    fn test_secrets_not_serialized() {
        let mut config = EngineConfig::default();
        config.identity.client_secret = "hunter2".to_string();
        config.judge.api_key = "sk-secret".to_string();
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("sk-secret"));
    }

    #[test]
    #[serial]
    fn test_apply_env_overlays() {
        clear_env();
        std::env::set_var("AZURE_AD_TENANT_ID", "tenant-from-env");
        std::env::set_var("AGENT_ENDPOINT", "https://agent.from.env");
        std::env::set_var("AZURE_OPENAI_DEPLOYMENT_NAME", "gpt-4o-mini");
        std::env::set_var("JUDGE_BACKEND", "ollama");

        let config = EngineConfig::default().apply_env().unwrap();
        clear_env();

        assert_eq!(config.identity.tenant_id, "tenant-from-env");
        assert_eq!(config.agent.endpoint, "https://agent.from.env");
        assert_eq!(config.judge.model, "gpt-4o-mini");
        assert_eq!(config.judge.backend, JudgeBackend::Ollama);
        assert_eq!(config.identity.scope, "https://api.powerplatform.com/.default");
    }

    #[test]
    #[serial]
    fn test_apply_env_rejects_unknown_backend() {
        clear_env();
        std::env::set_var("JUDGE_BACKEND", "palm");
        let result = EngineConfig::default().apply_env();
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_judge_configs() {
        let judge = JudgeModelConfig {
            endpoint: "https://res.openai.azure.com".to_string(),
            api_key: "k".to_string(),
            ..JudgeModelConfig::default()
        };
        let openai = judge.openai();
        assert!(openai.is_azure());
        assert_eq!(openai.default_model, "gpt-4o");
        assert!(openai.validate().is_ok());
        assert_eq!(judge.judge_config().timeout, Duration::from_secs(60));
    }
}
