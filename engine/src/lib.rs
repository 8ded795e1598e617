pub mod agent;
pub mod auth;
pub mod config;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod run;
pub mod store;

pub use agent::{
    assemble_reply, Activity, ActivityType, AgentClient, AgentReply, AgentRuntime, AgentSettings,
    HttpAgentRuntime, Termination, Transcript, TurnResponse, NO_RESPONSE,
};
pub use auth::{ClientCredentialsExchange, CredentialExchange, Token, TokenProvider};
pub use config::{
    AgentEndpointConfig, EngineConfig, IdentityConfig, JudgeBackend, JudgeModelConfig, RunSettings,
};
pub use dataset::{
    parse_dataset, DatasetItem, DatasetSource, Difficulty, EvalType, JsonDatasetSource, Role,
    StaticDatasetSource, Turn,
};
pub use error::{
    AgentError, AgentErrorKind, AgentResult, AuthError, AuthResult, ConfigError, ConverseError,
    DatasetError, DatasetResult, EngineError, EngineResult, ItemError, MetricError, StoreError,
    StoreResult,
};
pub use metrics::{Metric, MetricJudge, MetricKind, MetricScore, Thresholds};
pub use orchestrator::{RunConfig, RunOrchestrator};
pub use registry::{applicable_metrics, MetricRegistry};
pub use run::{ItemStatus, MetricSummary, Run, RunItemResult, RunStatus, RunSummary};
pub use store::{InMemoryRunStore, JsonFileRunStore, RunStore, StoreCall};
