use super::{prompts, Metric, MetricScore, Thresholds};
use crate::agent::Transcript;
use crate::dataset::DatasetItem;
use crate::error::MetricError;
use futures::future::join_all;
use model::JudgeClient;
use tracing::{debug, warn};

/// Scores transcripts with an LLM judge.
///
/// Each metric is an independent judge call: a failure is captured into that
/// metric's [`MetricScore`] and never affects the other metrics of the item.
#[derive(Clone)]
pub struct MetricJudge {
    judge: JudgeClient,
    thresholds: Thresholds,
}

impl MetricJudge {
    pub fn new(judge: JudgeClient, thresholds: Thresholds) -> Self {
        Self { judge, thresholds }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn judge(&self) -> &JudgeClient {
        &self.judge
    }

    /// Score one metric.
    pub async fn score(
        &self,
        metric: Metric,
        transcript: &Transcript,
        item: &DatasetItem,
    ) -> MetricScore {
        let threshold = self.thresholds.for_metric(metric);

        let prompt = match prompts::build(metric, transcript, item) {
            Ok(prompt) => prompt,
            Err(e) => {
                debug!("Skipping {}: {}", metric, e);
                return MetricScore::failed(metric, e, threshold);
            }
        };

        match self.judge.judge(&prompt).await {
            Ok(verdict) => {
                debug!("{} scored {:.3}", metric, verdict.score);
                MetricScore::scored(metric, verdict.score, verdict.reasoning, threshold)
            }
            Err(e) => {
                warn!("{} judge call failed: {}", metric, e);
                MetricScore::failed(metric, MetricError::Judge(e), threshold)
            }
        }
    }

    /// Score `metrics` concurrently; results keep the order of `metrics`.
    pub async fn score_all(
        &self,
        metrics: &[Metric],
        transcript: &Transcript,
        item: &DatasetItem,
    ) -> Vec<MetricScore> {
        join_all(
            metrics
                .iter()
                .map(|metric| self.score(*metric, transcript, item)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Termination;
    use crate::dataset::Turn;
    use async_trait::async_trait;
    use model::{
        ChatRequest, ChatResponse, Choice, FinishReason, JudgeConfig, JudgeError, ModelError,
        ModelInfo, ModelProvider, ModelResult, RetryPolicy,
    };
    use std::sync::Arc;

    /// Answers by rubric keyword.
    struct RubricProvider;

    #[async_trait]
    impl ModelProvider for RubricProvider {
        async fn chat(&self, request: ChatRequest) -> ModelResult<ChatResponse> {
            let prompt = &request.messages[1].content;
            let content = if prompt.contains("TOXICITY") {
                return Err(ModelError::Api {
                    status: 400,
                    message: "content filter".to_string(),
                });
            } else if prompt.contains("BIAS") {
                "I cannot grade this".to_string()
            } else if prompt.contains("ANSWER RELEVANCY") {
                "Score: 9/10. On point.".to_string()
            } else {
                r#"{"score": 0.4, "reason": "partial"}"#.to_string()
            };

            Ok(ChatResponse {
                choices: vec![Choice {
                    message: model::ChatMessage::assistant(content),
                    finish_reason: Some(FinishReason::Stop),
                }],
                usage: None,
            })
        }

        async fn list_models(&self) -> ModelResult<Vec<ModelInfo>> {
            Ok(vec![])
        }

        async fn health_check(&self) -> ModelResult<()> {
            Ok(())
        }

        fn provider_name(&self) -> &'static str {
            "rubric"
        }
    }

    fn metric_judge() -> MetricJudge {
        MetricJudge::new(
            JudgeClient::new(
                Arc::new(RubricProvider),
                JudgeConfig::default().with_retry(RetryPolicy::none()),
            ),
            Thresholds::new(0.5).with_override(Metric::TaskCompletion, 0.3),
        )
    }

    fn transcript() -> Transcript {
        Transcript {
            conversation_id: "c".to_string(),
            turns: vec![Turn::user("q"), Turn::assistant("a")],
            actual_output: "a".to_string(),
            activities: vec![],
            termination: Termination::SinglePass,
            duration_ms: 1,
            token_usage: None,
        }
    }

    #[tokio::test]
    async fn test_metrics_fail_independently() {
        let judge = metric_judge();
        let item = DatasetItem::single_turn("q");
        let metrics = [
            Metric::AnswerRelevancy,
            Metric::TaskCompletion,
            Metric::Toxicity,
            Metric::Bias,
            Metric::Faithfulness,
            Metric::Hallucination,
        ];

        let scores = judge.score_all(&metrics, &transcript(), &item).await;
        assert_eq!(scores.len(), 6);
        assert_eq!(
            scores.iter().map(|s| s.metric).collect::<Vec<_>>(),
            metrics.to_vec()
        );

        let relevancy = &scores[0];
        assert!((relevancy.score - 0.9).abs() < 1e-9);
        assert!(relevancy.passed);

        // 0.4 passes the 0.3 override
        assert!(scores[1].passed);
        assert_eq!(scores[1].threshold, 0.3);

        assert!(matches!(
            scores[2].error,
            Some(MetricError::Judge(JudgeError::Model(_)))
        ));
        assert!(matches!(
            scores[3].error,
            Some(MetricError::Judge(JudgeError::ParseFailure(_)))
        ));
        assert!(matches!(scores[4].error, Some(MetricError::Config(_))));

        // 0.4 fails the default 0.5
        assert!(!scores[5].passed);
        assert!(scores[5].error.is_none());
    }
}
