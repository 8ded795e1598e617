pub mod config;
pub mod judge;
#[cfg(feature = "ollama")]
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod types;

pub use config::{OllamaConfig, OpenAiConfig};
pub use judge::{
    parse_verdict, JudgeClient, JudgeConfig, JudgeError, JudgeResult, Verdict,
    DEFAULT_JUDGE_SYSTEM,
};
pub use openai::OpenAiProvider;
pub use provider::{ModelError, ModelProvider, ModelResult};
pub use retry::RetryPolicy;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, MessageRole, ModelInfo,
    ResponseFormat, Usage,
};

#[cfg(feature = "ollama")]
pub use ollama::OllamaProvider;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::judge::*;
    pub use crate::openai::*;
    pub use crate::provider::*;
    pub use crate::retry::*;
    pub use crate::types::*;

    #[cfg(feature = "ollama")]
    pub use crate::ollama::*;
}
