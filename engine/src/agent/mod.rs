//! Conversations with the agent under evaluation.
//!
//! [`AgentRuntime`] is the wire seam: start a conversation, send one turn,
//! get back the raw activities the agent emitted. [`AgentClient`] drives a
//! whole [`DatasetItem`] through it and produces a [`Transcript`].

pub mod http;

pub use http::HttpAgentRuntime;

use crate::auth::{Token, TokenProvider};
use crate::dataset::{DatasetItem, EvalType, Role, Turn};
use crate::error::{AgentError, AgentResult, ConverseError};
use async_trait::async_trait;
use model::{RetryPolicy, Usage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reply text recorded when a turn produced no message text.
pub const NO_RESPONSE: &str = "[No response from agent]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityType {
    Message,
    Event,
    Trace,
    Invoke,
    Typing,
    EndOfConversation,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SuggestedActions {
    #[serde(default)]
    pub actions: Vec<SuggestedAction>,
}

/// One raw activity emitted by the agent runtime, kept verbatim on transcripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_actions: Option<SuggestedActions>,
}

impl Activity {
    pub fn message(text: impl Into<String>) -> Self {
        Self::of(ActivityType::Message).with_text(text)
    }

    pub fn end_of_conversation() -> Self {
        Self::of(ActivityType::EndOfConversation)
    }

    pub fn of(activity_type: ActivityType) -> Self {
        Self {
            activity_type,
            text: None,
            name: None,
            label: None,
            value: None,
            suggested_actions: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_suggestions<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggested_actions = Some(SuggestedActions {
            actions: titles
                .into_iter()
                .map(|t| SuggestedAction {
                    title: Some(t.into()),
                })
                .collect(),
        });
        self
    }
}

/// What the runtime returned for one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResponse {
    pub activities: Vec<Activity>,
    pub usage: Option<Usage>,
}

/// Chat-turn protocol of the agent runtime.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Open a new conversation and return its id.
    async fn start_conversation(&self, token: &Token) -> AgentResult<String>;

    /// Send one user turn and collect the agent's activities.
    async fn send_turn(
        &self,
        token: &Token,
        conversation_id: &str,
        turn: &Turn,
    ) -> AgentResult<TurnResponse>;
}

/// The agent's reply to one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    pub end_of_conversation: bool,
}

/// Assemble reply text from a turn's activities.
///
/// Message texts are joined with newlines and suggested actions are appended
/// as `[Suggested: a, b]`. Activities after an end-of-conversation are ignored.
pub fn assemble_reply(activities: &[Activity]) -> AgentReply {
    let mut parts: Vec<String> = Vec::new();
    let mut end_of_conversation = false;

    for activity in activities {
        match activity.activity_type {
            ActivityType::Message => {
                if let Some(text) = activity.text.as_deref().filter(|t| !t.is_empty()) {
                    parts.push(text.to_string());
                }
            }
            ActivityType::EndOfConversation => {
                end_of_conversation = true;
                break;
            }
            _ => {}
        }

        if let Some(suggested) = &activity.suggested_actions {
            let titles: Vec<&str> = suggested
                .actions
                .iter()
                .filter_map(|a| a.title.as_deref())
                .collect();
            if !titles.is_empty() {
                parts.push(format!("[Suggested: {}]", titles.join(", ")));
            }
        }
    }

    AgentReply {
        text: if parts.is_empty() {
            NO_RESPONSE.to_string()
        } else {
            parts.join("\n")
        },
        end_of_conversation,
    }
}

/// Why a conversation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Single-turn item answered
    SinglePass,
    /// All scripted user turns sent
    ScriptExhausted,
    /// Autonomous agent ended the conversation or declared the task done
    CompletionSignal,
    /// Autonomous exchange cap reached
    TurnCap,
}

/// The recorded conversation for one dataset item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub conversation_id: String,
    /// Sent user turns and the agent's replies, in order
    pub turns: Vec<Turn>,
    /// The final assistant reply
    pub actual_output: String,
    pub activities: Vec<Activity>,
    pub termination: Termination,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Usage>,
}

impl Transcript {
    /// Number of user/assistant exchanges.
    pub fn exchanges(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::Assistant).count()
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Timeout for one agent turn
    pub turn_timeout: Duration,
    /// Retry policy for transient turn failures
    pub retry: RetryPolicy,
    /// Exchange cap for autonomous items
    pub max_autonomous_turns: u32,
    /// User message sent after each autonomous reply
    pub continuation_prompt: String,
    /// Case-insensitive phrases meaning the autonomous task is done
    pub completion_markers: Vec<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            max_autonomous_turns: 10,
            continuation_prompt:
                "Please continue working toward the goal. When the task is fully complete, reply with TASK COMPLETE."
                    .to_string(),
            completion_markers: vec!["TASK COMPLETE".to_string()],
        }
    }
}

impl AgentSettings {
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_autonomous_turns(mut self, max: u32) -> Self {
        self.max_autonomous_turns = max;
        self
    }

    fn is_completion(&self, reply: &str) -> bool {
        let reply = reply.to_lowercase();
        self.completion_markers
            .iter()
            .filter(|m| !m.trim().is_empty())
            .any(|m| reply.contains(&m.to_lowercase()))
    }
}

/// Drives dataset items through the agent runtime.
pub struct AgentClient {
    runtime: Arc<dyn AgentRuntime>,
    tokens: Arc<TokenProvider>,
    settings: AgentSettings,
}

/// Accumulates one conversation.
struct Conversation<'a> {
    client: &'a AgentClient,
    token: &'a Token,
    id: String,
    turns: Vec<Turn>,
    activities: Vec<Activity>,
    usage: Option<Usage>,
}

impl Conversation<'_> {
    async fn exchange(&mut self, text: &str) -> AgentResult<AgentReply> {
        let turn = Turn::user(text);
        let response = self.client.send(self.token, &self.id, &turn).await?;
        let reply = assemble_reply(&response.activities);

        debug!(
            "Conversation {} turn {}: {} chars in, {} chars out",
            self.id,
            self.turns.len() / 2 + 1,
            text.len(),
            reply.text.len()
        );

        if let Some(usage) = &response.usage {
            self.usage.get_or_insert_with(Usage::default).add(usage);
        }
        self.turns.push(turn);
        self.turns.push(Turn::assistant(reply.text.clone()));
        self.activities.extend(response.activities);
        Ok(reply)
    }

    fn finish(self, actual_output: String, termination: Termination, start: Instant) -> Transcript {
        Transcript {
            conversation_id: self.id,
            turns: self.turns,
            actual_output,
            activities: self.activities,
            termination,
            duration_ms: start.elapsed().as_millis() as u64,
            token_usage: self.usage,
        }
    }
}

impl AgentClient {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        tokens: Arc<TokenProvider>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            runtime,
            tokens,
            settings,
        }
    }

    pub fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run `item` as a fresh conversation.
    ///
    /// If the agent rejects the bearer token, the token is refreshed once and
    /// the whole conversation is retried once; a second rejection fails the
    /// item with `auth_rejected`. A failure to obtain credentials at all is
    /// returned as [`ConverseError::Auth`].
    pub async fn converse(&self, item: &DatasetItem) -> Result<Transcript, ConverseError> {
        let token = self.tokens.acquire().await?;

        match self.converse_with(&token, item).await {
            Err(e) if e.is_auth_rejected() => {
                let fresh = self.tokens.refresh_after_rejection(&token).await?;
                Ok(self.converse_with(&fresh, item).await?)
            }
            other => Ok(other?),
        }
    }

    /// Run `item` with an explicit token and no refresh on rejection.
    pub async fn converse_with(&self, token: &Token, item: &DatasetItem) -> AgentResult<Transcript> {
        let start = Instant::now();
        let id = self.start(token).await?;
        debug!("Started conversation {} for {} item", id, item.eval_type);

        let mut conversation = Conversation {
            client: self,
            token,
            id,
            turns: Vec::new(),
            activities: Vec::new(),
            usage: None,
        };

        match item.eval_type {
            EvalType::SingleTurn | EvalType::MultiTurn => {
                // The script drives the conversation; an end-of-conversation
                // activity only closes that turn's reply.
                let mut last = None;
                for turn in item.user_turns() {
                    let reply = conversation.exchange(&turn.content).await?;
                    if reply.end_of_conversation {
                        debug!(
                            "Conversation {} signalled end of conversation mid-script",
                            conversation.id
                        );
                    }
                    last = Some(reply.text);
                }

                let termination = match item.eval_type {
                    EvalType::SingleTurn => Termination::SinglePass,
                    _ => Termination::ScriptExhausted,
                };

                let actual_output = last.ok_or_else(|| {
                    AgentError::agent("item has no user turns to send".to_string())
                })?;
                Ok(conversation.finish(actual_output, termination, start))
            }
            EvalType::Autonomous => {
                let goal = item
                    .goal
                    .as_deref()
                    .ok_or_else(|| AgentError::agent("autonomous item has no goal"))?;
                let cap = self.settings.max_autonomous_turns.max(1);

                let mut reply = conversation.exchange(goal).await?;
                let mut exchanges = 1;
                let mut termination = Termination::TurnCap;

                loop {
                    if reply.end_of_conversation || self.settings.is_completion(&reply.text) {
                        termination = Termination::CompletionSignal;
                        break;
                    }
                    if exchanges >= cap {
                        break;
                    }
                    reply = conversation
                        .exchange(&self.settings.continuation_prompt)
                        .await?;
                    exchanges += 1;
                }

                if termination == Termination::TurnCap {
                    info!(
                        "Autonomous conversation {} stopped at the {} exchange cap",
                        conversation.id, cap
                    );
                }
                Ok(conversation.finish(reply.text, termination, start))
            }
        }
    }

    async fn start(&self, token: &Token) -> AgentResult<String> {
        self.with_retry("start conversation", || {
            self.runtime.start_conversation(token)
        })
        .await
    }

    async fn send(&self, token: &Token, id: &str, turn: &Turn) -> AgentResult<TurnResponse> {
        self.with_retry("agent turn", || self.runtime.send_turn(token, id, turn))
            .await
    }

    /// Apply the per-turn timeout and retry transient failures.
    async fn with_retry<T, F, Fut>(&self, operation: &str, call: F) -> AgentResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = AgentResult<T>>,
    {
        let timeout = self.settings.turn_timeout;
        self.settings
            .retry
            .run(
                operation,
                |attempt| {
                    let fut = call();
                    async move {
                        match tokio::time::timeout(timeout, fut).await {
                            Ok(result) => result,
                            Err(_) => {
                                warn!("{} attempt {} timed out after {:?}", operation, attempt, timeout);
                                Err(AgentError::timeout(format!(
                                    "{} exceeded {:?}",
                                    operation, timeout
                                )))
                            }
                        }
                    }
                },
                AgentError::is_transient,
            )
            .await
    }
}
