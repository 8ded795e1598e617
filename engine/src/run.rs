//! Run records: the durable outcome of evaluating one dataset.
//!
//! A [`Run`] moves `pending → running → {completed | failed | cancelled}`
//! (or straight from `pending` to `failed`/`cancelled` when nothing could be
//! attempted). Terminal states never change. Item results sit in dataset
//! order regardless of the order in which they finished.

use crate::agent::Transcript;
use crate::dataset::{DatasetItem, EvalType};
use crate::error::{ItemError, StoreError, StoreResult};
use crate::metrics::{Metric, MetricScore};
use crate::orchestrator::RunConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item progress.
///
/// [`RunOrchestrator`](crate::RunOrchestrator) writes an item to the store
/// only once it has finished, so the records it produces hold `pending`,
/// `completed` or `failed`. `running` is for stores and embedders that
/// snapshot in-flight items; summaries count it with `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One dataset item's outcome within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunItemResult {
    /// Position in the dataset
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub eval_type: EvalType,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Transcript>,
    #[serde(default)]
    pub scores: Vec<MetricScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    pub duration_ms: u64,
    /// All successfully scored metrics passed and the item did not error
    pub passed: bool,
}

impl RunItemResult {
    /// Placeholder for an item that has not been dispatched.
    pub fn pending(index: usize, item: &DatasetItem) -> Self {
        Self {
            index,
            item_id: item.id.clone(),
            eval_type: item.eval_type,
            status: ItemStatus::Pending,
            transcript: None,
            scores: Vec::new(),
            error: None,
            duration_ms: 0,
            passed: false,
        }
    }

    pub fn completed(
        index: usize,
        item: &DatasetItem,
        transcript: Transcript,
        scores: Vec<MetricScore>,
        duration_ms: u64,
    ) -> Self {
        let scored: Vec<&MetricScore> = scores.iter().filter(|s| !s.is_error()).collect();
        let passed = !scored.is_empty() && scored.iter().all(|s| s.passed);

        Self {
            status: ItemStatus::Completed,
            transcript: Some(transcript),
            scores,
            duration_ms,
            passed,
            ..Self::pending(index, item)
        }
    }

    pub fn failed(index: usize, item: &DatasetItem, error: ItemError, duration_ms: u64) -> Self {
        Self {
            status: ItemStatus::Failed,
            error: Some(error),
            duration_ms,
            ..Self::pending(index, item)
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// Aggregate for one metric across the items that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Mean over successful scores; errored scores are excluded
    pub mean: f64,
    pub pass_rate: f64,
    pub scored: usize,
    pub errored: usize,
}

/// Run-level statistics, computed once the run reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    /// Never dispatched, e.g. after cancellation or a fatal error
    pub pending_items: usize,
    pub passed_items: usize,
    /// Passed items over processed (completed + failed) items
    pub pass_rate: f64,
    /// Completed items over processed items
    pub item_success_rate: f64,
    /// Mean of the per-metric means
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_score: Option<f64>,
    pub metrics: BTreeMap<Metric, MetricSummary>,
    /// Why the run failed, for `failed` runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl RunSummary {
    pub fn from_items(items: &[RunItemResult]) -> Self {
        let total_items = items.len();
        let completed_items = items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .count();
        let failed_items = items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count();
        let passed_items = items.iter().filter(|i| i.passed).count();
        let processed = completed_items + failed_items;

        // (sum, passed, scored, errored)
        let mut tallies: BTreeMap<Metric, (f64, usize, usize, usize)> = BTreeMap::new();
        for score in items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .flat_map(|i| i.scores.iter())
        {
            let entry = tallies.entry(score.metric).or_insert((0.0, 0, 0, 0));
            if score.is_error() {
                entry.3 += 1;
            } else {
                entry.0 += score.score;
                entry.1 += score.passed as usize;
                entry.2 += 1;
            }
        }

        let metrics: BTreeMap<Metric, MetricSummary> = tallies
            .into_iter()
            .map(|(metric, (sum, passed, scored, errored))| {
                (
                    metric,
                    MetricSummary {
                        mean: ratio_f(sum, scored),
                        pass_rate: ratio(passed, scored),
                        scored,
                        errored,
                    },
                )
            })
            .collect();

        let means: Vec<f64> = metrics
            .values()
            .filter(|m| m.scored > 0)
            .map(|m| m.mean)
            .collect();
        let mean_score = if means.is_empty() {
            None
        } else {
            Some(means.iter().sum::<f64>() / means.len() as f64)
        };

        Self {
            total_items,
            completed_items,
            failed_items,
            pending_items: total_items - processed,
            passed_items,
            pass_rate: ratio(passed_items, processed),
            item_success_rate: ratio(completed_items, processed),
            mean_score,
            metrics,
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    ratio_f(numerator as f64, denominator)
}

fn ratio_f(numerator: f64, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

/// The top-level record of one evaluation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub dataset_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub config: RunConfig,
    /// Dataset order
    #[serde(default)]
    pub items: Vec<RunItemResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl Run {
    pub fn new(dataset_id: impl Into<String>, name: Option<String>, config: RunConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            dataset_id: dataset_id.into(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            config,
            items: Vec::new(),
            summary: None,
        }
    }

    /// Move to `next`, stamping start and completion times.
    pub fn set_status(&mut self, next: RunStatus) -> StoreResult<()> {
        if self.status.is_terminal() {
            return Err(self.terminal_error());
        }
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                run_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Record an item result at its dataset position, replacing any earlier
    /// record for the same index.
    pub fn record_item(&mut self, result: RunItemResult) -> StoreResult<()> {
        if self.status.is_terminal() {
            return Err(self.terminal_error());
        }
        match self.items.binary_search_by_key(&result.index, |i| i.index) {
            Ok(pos) => self.items[pos] = result,
            Err(pos) => self.items.insert(pos, result),
        }
        Ok(())
    }

    /// Attach the final summary; only once, and only to a terminal run.
    pub fn record_summary(&mut self, summary: RunSummary) -> StoreResult<()> {
        if !self.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                run_id: self.id.clone(),
                from: self.status.to_string(),
                to: "finalized".to_string(),
            });
        }
        if self.summary.is_some() {
            return Err(self.terminal_error());
        }
        self.summary = Some(summary);
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal() && self.summary.is_some()
    }

    fn terminal_error(&self) -> StoreError {
        StoreError::Terminal {
            run_id: self.id.clone(),
            status: self.status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Termination;
    use crate::dataset::Turn;
    use crate::error::{AgentError, ConfigError};

    fn transcript() -> Transcript {
        Transcript {
            conversation_id: "c".to_string(),
            turns: vec![Turn::user("q"), Turn::assistant("a")],
            actual_output: "a".to_string(),
            activities: vec![],
            termination: Termination::SinglePass,
            duration_ms: 3,
            token_usage: None,
        }
    }

    fn missing_context() -> MetricScore {
        MetricScore::failed(
            Metric::Faithfulness,
            ConfigError::MissingContext {
                metric: "faithfulness".to_string(),
            },
            0.5,
        )
    }

    #[test]
    fn test_status_transitions() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = Run::new("ds", None, RunConfig::default());
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.set_status(RunStatus::Completed).is_err());

        run.set_status(RunStatus::Running).unwrap();
        assert!(run.started_at.is_some());

        let item = DatasetItem::single_turn("q");
        run.record_item(RunItemResult::pending(1, &item)).unwrap();
        run.record_item(RunItemResult::pending(0, &item)).unwrap();
        run.record_item(RunItemResult::failed(
            1,
            &item,
            AgentError::timeout("slow").into(),
            5,
        ))
        .unwrap();
        assert_eq!(
            run.items.iter().map(|i| i.index).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(run.items[1].status, ItemStatus::Failed);

        run.set_status(RunStatus::Completed).unwrap();
        assert!(run.completed_at.is_some());
        assert!(matches!(
            run.record_item(RunItemResult::pending(2, &item)),
            Err(StoreError::Terminal { .. })
        ));
        assert!(matches!(
            run.set_status(RunStatus::Failed),
            Err(StoreError::Terminal { .. })
        ));

        run.record_summary(RunSummary::from_items(&run.items)).unwrap();
        assert!(run.is_finalized());
        assert!(run.record_summary(RunSummary::from_items(&[])).is_err());
    }

    #[test]
    fn test_item_pass_ignores_errored_metrics() {
        let item = DatasetItem::single_turn("q");
        let result = RunItemResult::completed(
            0,
            &item,
            transcript(),
            vec![
                MetricScore::scored(Metric::Toxicity, 1.0, "clean", 0.5),
                missing_context(),
            ],
            10,
        );
        assert!(result.passed);

        let failing = RunItemResult::completed(
            0,
            &item,
            transcript(),
            vec![
                MetricScore::scored(Metric::Toxicity, 1.0, "clean", 0.5),
                MetricScore::scored(Metric::Bias, 0.2, "slanted", 0.5),
            ],
            10,
        );
        assert!(!failing.passed);

        let nothing_scored =
            RunItemResult::completed(0, &item, transcript(), vec![missing_context()], 1);
        assert!(!nothing_scored.passed);
    }

    #[test]
    fn test_summary_excludes_errored_scores() {
        let item = DatasetItem::single_turn("q");
        let items = vec![
            RunItemResult::completed(
                0,
                &item,
                transcript(),
                vec![
                    MetricScore::scored(Metric::Toxicity, 0.8, "", 0.5),
                    missing_context(),
                ],
                1,
            ),
            RunItemResult::completed(
                1,
                &item,
                transcript(),
                vec![
                    MetricScore::scored(Metric::Toxicity, 0.4, "", 0.5),
                    MetricScore::scored(Metric::Faithfulness, 1.0, "", 0.5),
                ],
                1,
            ),
            RunItemResult::failed(2, &item, AgentError::timeout("slow").into(), 1),
            RunItemResult::pending(3, &item),
        ];

        let summary = RunSummary::from_items(&items);
        assert_eq!(summary.total_items, 4);
        assert_eq!(summary.completed_items, 2);
        assert_eq!(summary.failed_items, 1);
        assert_eq!(summary.pending_items, 1);
        assert_eq!(summary.passed_items, 1);
        assert!((summary.pass_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((summary.item_success_rate - 2.0 / 3.0).abs() < 1e-9);

        let toxicity = &summary.metrics[&Metric::Toxicity];
        assert!((toxicity.mean - 0.6).abs() < 1e-9);
        assert_eq!(toxicity.pass_rate, 0.5);

        // One errored, one scored: the error is not averaged in as zero
        let faithfulness = &summary.metrics[&Metric::Faithfulness];
        assert_eq!(faithfulness.mean, 1.0);
        assert_eq!(faithfulness.scored, 1);
        assert_eq!(faithfulness.errored, 1);

        assert!((summary.mean_score.unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary() {
        let summary = RunSummary::from_items(&[]);
        assert_eq!(summary.pass_rate, 0.0);
        assert!(summary.mean_score.is_none());
        assert!(summary.metrics.is_empty());
    }

    #[test]
    fn test_run_serializes_statuses() {
        let mut run = Run::new("ds", Some("nightly".to_string()), RunConfig::default());
        run.set_status(RunStatus::Failed).unwrap();
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["name"], "nightly");
        let back: Run = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }
}
