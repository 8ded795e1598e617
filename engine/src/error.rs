//! Error taxonomy for the engine.
//!
//! Errors are scoped to the granularity at which they are recovered:
//!
//! - [`AuthError`]: fatal for the run
//! - [`AgentError`]: fails one item, captured into its `RunItemResult`
//! - [`model::JudgeError`] / [`ConfigError`]: fail one metric, captured into
//!   its `MetricScore` as a [`MetricError`]
//! - [`StoreError`]: fatal for the run
//!
//! The captured kinds are `Clone + Serialize` so they persist with results.

use model::JudgeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity provider failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Credentials rejected by identity provider ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Identity provider unavailable: {message}")]
    Unavailable { message: String },

    #[error("Invalid token response: {message}")]
    InvalidResponse { message: String },

    #[error("Identity configuration error: {message}")]
    Config { message: String },
}

impl AuthError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Unavailable { .. })
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    AuthRejected,
    Timeout,
    MalformedResponse,
    AgentError,
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentErrorKind::AuthRejected => "auth_rejected",
            AgentErrorKind::Timeout => "timeout",
            AgentErrorKind::MalformedResponse => "malformed_response",
            AgentErrorKind::AgentError => "agent_error",
        };
        f.write_str(name)
    }
}

/// A failed conversation with the agent runtime.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Agent {kind}: {message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
    /// Whether the same call may succeed if sent again
    #[serde(skip)]
    transient: bool,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        let transient = kind == AgentErrorKind::Timeout;
        Self {
            kind,
            message: message.into(),
            transient,
        }
    }

    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::AuthRejected, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::MalformedResponse, message)
    }

    /// Agent-side failure that will not go away on retry (4xx, business error).
    pub fn agent(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::AgentError, message)
    }

    /// Agent-side failure worth retrying (5xx, throttling, connection reset).
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::new(AgentErrorKind::AgentError, message)
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn is_auth_rejected(&self) -> bool {
        self.kind == AgentErrorKind::AuthRejected
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Why a conversation could not be produced.
#[derive(Error, Debug)]
pub enum ConverseError {
    /// Credentials could not be obtained at all; fatal for the run.
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Invalid configuration, either of the engine or of one metric invocation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigError {
    #[error("Metric {metric} requires context but the item has none")]
    MissingContext { metric: String },

    #[error("Missing required setting: {field}")]
    Missing { field: String },

    #[error("Invalid setting {field}: {message}")]
    Invalid { field: String, message: String },
}

/// Why one metric produced no score.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricError {
    #[error("Judge error: {0}")]
    Judge(JudgeError),

    #[error("Configuration error: {0}")]
    Config(ConfigError),
}

impl From<JudgeError> for MetricError {
    fn from(err: JudgeError) -> Self {
        MetricError::Judge(err)
    }
}

impl From<ConfigError> for MetricError {
    fn from(err: ConfigError) -> Self {
        MetricError::Config(err)
    }
}

/// Why an item failed before or during its conversation.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemError {
    #[error("{0}")]
    Agent(AgentError),

    #[error("Invalid dataset item: {0}")]
    InvalidItem(String),
}

impl From<AgentError> for ItemError {
    fn from(err: AgentError) -> Self {
        ItemError::Agent(err)
    }
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse dataset: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Dataset not found: {0}")]
    NotFound(String),
}

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is already {status} and cannot change")]
    Terminal { run_id: String, status: String },

    #[error("Invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: String,
        to: String,
    },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a run or by engine setup.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to read config file: {0}")]
    ConfigFile(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Judge model setup failed: {0}")]
    Model(#[from] model::ModelError),
}

pub type EngineResult<T> = Result<T, EngineError>;
