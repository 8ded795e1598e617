//! The nine quality and safety metrics and their LLM-judge scoring.
//!
//! [`Metric`] is a closed set. Every metric is scored on `[0.0, 1.0]` with
//! 1.0 the best outcome, so the safety metrics (toxicity, bias,
//! hallucination) report the *absence* of the problem and all metrics share
//! the same "score ≥ threshold" pass rule.

mod judge;
pub mod prompts;

pub use judge::MetricJudge;

use crate::error::{ConfigError, MetricError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    AnswerRelevancy,
    TaskCompletion,
    Hallucination,
    Toxicity,
    Bias,
    Faithfulness,
    ConversationCompleteness,
    KnowledgeRetention,
    RoleAdherence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Reads the final exchange
    SingleTurn,
    /// Reads the whole turn sequence
    Conversational,
}

impl Metric {
    pub const ALL: [Metric; 9] = [
        Metric::AnswerRelevancy,
        Metric::TaskCompletion,
        Metric::Hallucination,
        Metric::Toxicity,
        Metric::Bias,
        Metric::Faithfulness,
        Metric::ConversationCompleteness,
        Metric::KnowledgeRetention,
        Metric::RoleAdherence,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::AnswerRelevancy => "answer_relevancy",
            Metric::TaskCompletion => "task_completion",
            Metric::Hallucination => "hallucination",
            Metric::Toxicity => "toxicity",
            Metric::Bias => "bias",
            Metric::Faithfulness => "faithfulness",
            Metric::ConversationCompleteness => "conversation_completeness",
            Metric::KnowledgeRetention => "knowledge_retention",
            Metric::RoleAdherence => "role_adherence",
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::ConversationCompleteness | Metric::KnowledgeRetention | Metric::RoleAdherence => {
                MetricKind::Conversational
            }
            _ => MetricKind::SingleTurn,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Metric::AnswerRelevancy => "How directly the final answer addresses the user's input",
            Metric::TaskCompletion => "Whether the agent accomplished what the user asked for",
            Metric::Hallucination => "Absence of claims contradicting the reference or known facts",
            Metric::Toxicity => "Absence of offensive, hostile or harmful language",
            Metric::Bias => "Absence of unfair or stereotyped treatment of groups",
            Metric::Faithfulness => "Whether every claim is supported by the supplied context",
            Metric::ConversationCompleteness => {
                "Whether every user intention in the conversation was satisfied"
            }
            Metric::KnowledgeRetention => {
                "Whether the agent remembers facts the user gave earlier"
            }
            Metric::RoleAdherence => "Whether the agent stays within its assistant role throughout",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Metric::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| ConfigError::Invalid {
                field: "metrics".to_string(),
                message: format!("unknown metric '{}'", s.trim()),
            })
    }
}

/// Pass thresholds: one default plus per-metric overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub default: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<Metric, f64>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl Thresholds {
    pub fn new(default: f64) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, metric: Metric, threshold: f64) -> Self {
        self.overrides.insert(metric, threshold);
        self
    }

    pub fn for_metric(&self, metric: Metric) -> f64 {
        self.overrides.get(&metric).copied().unwrap_or(self.default)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_range = |t: f64| (0.0..=1.0).contains(&t);
        if !in_range(self.default) {
            return Err(ConfigError::Invalid {
                field: "threshold".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if let Some((metric, _)) = self.overrides.iter().find(|(_, t)| !in_range(**t)) {
            return Err(ConfigError::Invalid {
                field: format!("thresholds.{}", metric),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// Result of scoring one metric for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    #[serde(rename = "metric_name")]
    pub metric: Metric,
    /// In `[0.0, 1.0]`; 0.0 when `error` is set
    pub score: f64,
    pub reasoning: String,
    pub passed: bool,
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MetricError>,
}

impl MetricScore {
    pub fn scored(
        metric: Metric,
        score: f64,
        reasoning: impl Into<String>,
        threshold: f64,
    ) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            metric,
            score,
            reasoning: reasoning.into(),
            passed: score >= threshold,
            threshold,
            error: None,
        }
    }

    pub fn failed(metric: Metric, error: impl Into<MetricError>, threshold: f64) -> Self {
        let error = error.into();
        Self {
            metric,
            score: 0.0,
            reasoning: error.to_string(),
            passed: false,
            threshold,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(metric.name().parse::<Metric>().unwrap(), metric);
            let json = serde_json::to_string(&metric).unwrap();
            assert_eq!(json, format!("\"{}\"", metric.name()));
        }
        assert_eq!("Answer-Relevancy".parse::<Metric>().unwrap(), Metric::AnswerRelevancy);
        assert!("coherence".parse::<Metric>().is_err());
    }

    #[test]
    fn test_kinds() {
        let conversational: Vec<_> = Metric::ALL
            .into_iter()
            .filter(|m| m.kind() == MetricKind::Conversational)
            .collect();
        assert_eq!(
            conversational,
            vec![
                Metric::ConversationCompleteness,
                Metric::KnowledgeRetention,
                Metric::RoleAdherence
            ]
        );
    }

    #[test]
    fn test_thresholds() {
        let thresholds = Thresholds::new(0.5).with_override(Metric::Toxicity, 0.9);
        assert_eq!(thresholds.for_metric(Metric::Toxicity), 0.9);
        assert_eq!(thresholds.for_metric(Metric::Bias), 0.5);
        assert!(thresholds.validate().is_ok());
        assert!(Thresholds::new(1.5).validate().is_err());
        assert!(Thresholds::new(0.5)
            .with_override(Metric::Bias, -0.1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_score_pass_rule() {
        assert!(MetricScore::scored(Metric::Bias, 0.5, "ok", 0.5).passed);
        assert!(!MetricScore::scored(Metric::Bias, 0.49, "meh", 0.5).passed);

        let failed = MetricScore::failed(
            Metric::Faithfulness,
            ConfigError::MissingContext {
                metric: "faithfulness".to_string(),
            },
            0.5,
        );
        assert!(failed.is_error());
        assert!(!failed.passed);
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["metric_name"], "faithfulness");
        assert_eq!(json["error"]["config"]["kind"], "missing_context");
    }
}
