//! LLM-as-judge calls and verdict parsing
//!
//! A [`JudgeClient`] sends one evaluation prompt to a [`ModelProvider`] and
//! turns the free-form completion into a [`Verdict`]: a score in `[0.0, 1.0]`
//! and the judge's rationale.
//!
//! Judges are asked for `{"score": <0..1>, "reason": "..."}`, but models drift
//! from the requested format. [`parse_verdict`] accepts, in order:
//!
//! - the requested JSON object, optionally inside a markdown code fence or
//!   surrounded by prose
//! - `reasoning` / `rationale` / `explanation` in place of `reason`, and
//!   numeric strings for `score`
//! - a `Score: 8/10` or `score = 0.7` line anywhere in the text
//!
//! Scores reported on a 0-10 or 0-100 scale are normalized. Anything else is
//! a [`JudgeError::ParseFailure`].
//!
//! # Examples
//!
//! ```
//! use model::judge::parse_verdict;
//!
//! let verdict = parse_verdict("```json\n{\"score\": 0.8, \"reason\": \"Mostly relevant\"}\n```")
//!     .unwrap();
//! assert_eq!(verdict.score, 0.8);
//! assert_eq!(verdict.reasoning, "Mostly relevant");
//!
//! let verdict = parse_verdict("Score: 7/10\nThe answer misses the refund window.").unwrap();
//! assert!((verdict.score - 0.7).abs() < 1e-9);
//! ```

use crate::provider::{ModelError, ModelProvider};
use crate::retry::RetryPolicy;
use crate::types::{ChatMessage, ChatRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

static SCORE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bscore\b\W{0,4}(\d+(?:\.\d+)?)(?:\s*/\s*(\d+(?:\.\d+)?))?")
        .expect("valid score regex")
});

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid code fence regex")
});

pub const DEFAULT_JUDGE_SYSTEM: &str = "You are an impartial evaluator of conversational AI systems. \
Grade strictly according to the rubric you are given. \
Respond with a single JSON object of the form {\"score\": <number between 0 and 1>, \"reason\": \"<one or two sentences>\"} \
where 1 is the best possible outcome for the rubric.";

/// Errors from one judge call. Captured into metric results, so owned and serializable.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum JudgeError {
    #[error("judge call timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not parse judge response: {0}")]
    ParseFailure(String),

    #[error("judge model error: {0}")]
    Model(String),
}

impl From<ModelError> for JudgeError {
    fn from(err: ModelError) -> Self {
        JudgeError::Model(err.to_string())
    }
}

pub type JudgeResult<T> = Result<T, JudgeError>;

/// Configuration for judge model calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Model or deployment name passed to the provider
    pub model: String,
    /// System instruction sent ahead of every rubric prompt
    pub system_instruction: String,
    /// Sampling temperature for judge calls
    pub temperature: f32,
    /// Completion length cap
    pub max_tokens: Option<u32>,
    /// Ask providers that support it for a JSON object response
    pub json_output: bool,
    /// Timeout for one judge call attempt
    pub timeout: Duration,
    /// Retry policy for transient model failures
    pub retry: RetryPolicy,
    /// Enable detailed logging for judge calls
    pub verbose_logging: bool,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            system_instruction: DEFAULT_JUDGE_SYSTEM.to_string(),
            temperature: 0.0,
            max_tokens: Some(512),
            json_output: true,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            verbose_logging: false,
        }
    }
}

impl JudgeConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// Set custom timeout for one judge call attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enable verbose logging for debugging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }
}

/// Parsed judge output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Score normalized to `[0.0, 1.0]`, higher is better
    pub score: f64,
    /// The judge's rationale
    pub reasoning: String,
}

/// Sends rubric prompts to a judge model.
#[derive(Clone)]
pub struct JudgeClient {
    provider: Arc<dyn ModelProvider>,
    config: JudgeConfig,
}

impl JudgeClient {
    pub fn new(provider: Arc<dyn ModelProvider>, config: JudgeConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    /// Run one judge call for `prompt` and parse the verdict.
    ///
    /// Transient model failures and per-attempt timeouts are retried under
    /// the configured [`RetryPolicy`]. A response that cannot be parsed is
    /// not retried.
    pub async fn judge(&self, prompt: &str) -> JudgeResult<Verdict> {
        let start = Instant::now();
        let config = &self.config;

        let text = config
            .retry
            .run(
                "judge call",
                |attempt| {
                    let request = self.build_request(prompt);
                    async move {
                        if config.verbose_logging {
                            debug!("Judge call attempt {} with model {}", attempt, config.model);
                        }
                        match tokio::time::timeout(config.timeout, self.provider.chat(request)).await
                        {
                            Ok(Ok(response)) => response
                                .first_content()
                                .map(str::to_string)
                                .ok_or(AttemptError::Empty),
                            Ok(Err(e)) => Err(AttemptError::Model(e)),
                            Err(_) => Err(AttemptError::TimedOut),
                        }
                    }
                },
                AttemptError::is_transient,
            )
            .await
            .map_err(|e| match e {
                AttemptError::TimedOut | AttemptError::Model(ModelError::Timeout) => {
                    JudgeError::Timeout(config.timeout)
                }
                AttemptError::Empty => {
                    JudgeError::ParseFailure("judge returned an empty response".to_string())
                }
                AttemptError::Model(e) => JudgeError::from(e),
            })?;

        let verdict = parse_verdict(&text).inspect_err(|e| {
            warn!("Discarding judge response: {}", e);
        })?;

        if config.verbose_logging {
            debug!(
                "Judge verdict {:.3} in {:?}: {}",
                verdict.score,
                start.elapsed(),
                truncate(&verdict.reasoning, 120)
            );
        }

        Ok(verdict)
    }

    fn build_request(&self, prompt: &str) -> ChatRequest {
        let mut request = ChatRequest::new(
            self.config.model.clone(),
            vec![
                ChatMessage::system(self.config.system_instruction.clone()),
                ChatMessage::user(prompt),
            ],
        )
        .with_temperature(self.config.temperature);

        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if self.config.json_output {
            request = request.with_json_output();
        }
        request
    }
}

#[derive(Debug)]
enum AttemptError {
    Model(ModelError),
    TimedOut,
    Empty,
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Model(e) => e.is_transient(),
            AttemptError::TimedOut => true,
            AttemptError::Empty => false,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Model(e) => write!(f, "{}", e),
            AttemptError::TimedOut => write!(f, "attempt timed out"),
            AttemptError::Empty => write!(f, "empty response"),
        }
    }
}

/// Extract a score and rationale from a judge completion.
pub fn parse_verdict(text: &str) -> JudgeResult<Verdict> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(JudgeError::ParseFailure("empty response".to_string()));
    }

    if let Some(object) = find_json_object(trimmed) {
        let reasoning = ["reason", "reasoning", "rationale", "explanation"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::to_string);

        let raw_score = object.get("score").and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        });

        if let Some(raw) = raw_score {
            return Ok(Verdict {
                score: normalize_score(raw, None)?,
                reasoning: reasoning.unwrap_or_else(|| "No reasoning provided".to_string()),
            });
        }
    }

    if let Some(caps) = SCORE_LINE.captures(trimmed) {
        let raw = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .ok_or_else(|| JudgeError::ParseFailure("unreadable score".to_string()))?;
        let scale = caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok());

        let reasoning = SCORE_LINE
            .replace(trimmed, "")
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, '*' | '#' | '-' | ':'))
            .to_string();
        return Ok(Verdict {
            score: normalize_score(raw, scale)?,
            reasoning: if reasoning.is_empty() {
                "No reasoning provided".to_string()
            } else {
                reasoning
            },
        });
    }

    if let Ok(raw) = trimmed.parse::<f64>() {
        return Ok(Verdict {
            score: normalize_score(raw, None)?,
            reasoning: "No reasoning provided".to_string(),
        });
    }

    Err(JudgeError::ParseFailure(format!(
        "no score found in: {}",
        truncate(trimmed, 200)
    )))
}

fn find_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let candidates = CODE_FENCE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .chain(std::iter::once(text))
        .chain(embedded_object(text));

    for candidate in candidates {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            return Some(map);
        }
    }
    None
}

fn embedded_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn normalize_score(raw: f64, scale: Option<f64>) -> JudgeResult<f64> {
    if !raw.is_finite() || raw < 0.0 {
        return Err(JudgeError::ParseFailure(format!("invalid score {}", raw)));
    }

    let score = match scale {
        Some(scale) if scale > 0.0 => raw / scale,
        Some(_) => return Err(JudgeError::ParseFailure("zero score scale".to_string())),
        None if raw <= 1.0 => raw,
        // Fractions just above 1 read as an overshoot of the unit scale
        None if raw < 2.0 => {
            return Err(JudgeError::ParseFailure(format!(
                "score {} is ambiguous without a scale",
                raw
            )))
        }
        None if raw <= 10.0 => raw / 10.0,
        None if raw <= 100.0 => raw / 100.0,
        None => return Err(JudgeError::ParseFailure(format!("score {} out of range", raw))),
    };

    if score > 1.0 {
        return Err(JudgeError::ParseFailure(format!(
            "score {} exceeds its scale",
            raw
        )));
    }
    Ok(score)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
