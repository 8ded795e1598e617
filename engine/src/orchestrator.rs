//! Drives a dataset through the agent and the metric judges.
//!
//! # Run lifecycle
//!
//! 1. The run is created `pending` and the dataset is listed.
//! 2. Credentials are acquired once up front; if that fails the run goes
//!    straight to `failed` and no item is attempted.
//! 3. The run goes `running` and items are dispatched with bounded
//!    concurrency. Each item converses with the agent, then all of its
//!    applicable metrics are scored concurrently.
//! 4. Item results are appended as they finish and slotted into dataset
//!    order. An agent failure fails only its item; losing credentials
//!    mid-run stops dispatch and fails the run.
//! 5. Cancellation stops dispatch, lets in-flight items finish, and ends the
//!    run `cancelled`.
//! 6. The terminal status is written, then the summary.
//!
//! Only store failures surface as `Err`; every other outcome is a [`Run`]
//! in a terminal status.

use crate::agent::AgentClient;
use crate::dataset::{DatasetItem, DatasetSource};
use crate::error::{
    AgentError, AuthError, ConfigError, ConverseError, EngineError, EngineResult, ItemError,
};
use crate::metrics::{Metric, MetricJudge, Thresholds};
use crate::registry::MetricRegistry;
use crate::run::{ItemStatus, Run, RunItemResult, RunStatus, RunSummary};
use crate::store::RunStore;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings for one run; snapshotted onto the [`Run`] record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Items processed at once
    pub concurrency: usize,
    pub thresholds: Thresholds,
    /// Metric selection; `None` scores every applicable metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeSet<Metric>>,
    /// Delay between starting consecutive items
    #[serde(rename = "dispatch_interval_ms", with = "duration_ms", default)]
    pub dispatch_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            thresholds: Thresholds::default(),
            metrics: None,
            dispatch_interval: Duration::ZERO,
        }
    }
}

impl RunConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_metrics(mut self, metrics: impl IntoIterator<Item = Metric>) -> Self {
        self.metrics = Some(metrics.into_iter().collect());
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn registry(&self) -> MetricRegistry {
        match &self.metrics {
            Some(selection) => MetricRegistry::with_selection(selection.iter().copied()),
            None => MetricRegistry::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "run.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if matches!(&self.metrics, Some(selection) if selection.is_empty()) {
            return Err(ConfigError::Invalid {
                field: "run.metrics".to_string(),
                message: "selection is empty".to_string(),
            });
        }

        self.thresholds.validate()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// One finished item plus any run-fatal error it hit.
struct ItemOutcome {
    result: RunItemResult,
    fatal: Option<AuthError>,
}

impl From<RunItemResult> for ItemOutcome {
    fn from(result: RunItemResult) -> Self {
        Self {
            result,
            fatal: None,
        }
    }
}

pub struct RunOrchestrator {
    agent: Arc<AgentClient>,
    judge: MetricJudge,
    datasets: Arc<dyn DatasetSource>,
    store: Arc<dyn RunStore>,
    registry: MetricRegistry,
    config: RunConfig,
}

impl RunOrchestrator {
    /// The judge is rebound to the run's thresholds.
    pub fn new(
        agent: Arc<AgentClient>,
        judge: MetricJudge,
        datasets: Arc<dyn DatasetSource>,
        store: Arc<dyn RunStore>,
        config: RunConfig,
    ) -> Self {
        Self {
            agent,
            judge: judge.with_thresholds(config.thresholds.clone()),
            datasets,
            store,
            registry: config.registry(),
            config,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Evaluate `dataset_id` and return the terminal run.
    ///
    /// Triggering `cancel` stops dispatching new items; items already in
    /// flight finish their current calls before the run ends `cancelled`.
    pub async fn execute(
        &self,
        dataset_id: &str,
        name: Option<String>,
        cancel: CancellationToken,
    ) -> EngineResult<Run> {
        let mut run = Run::new(dataset_id, name, self.config.clone());
        run.id = self.store.create_run(&run).await?;
        info!("Created run {} for dataset {}", run.id, dataset_id);

        let items = match self.datasets.list_items(dataset_id).await {
            Ok(items) => items,
            Err(e) => {
                error!("Run {}: failed to load dataset: {}", run.id, e);
                return self
                    .finish(run, RunStatus::Failed, Some(e.to_string()))
                    .await;
            }
        };

        run.items = items
            .iter()
            .enumerate()
            .map(|(index, item)| RunItemResult::pending(index, item))
            .collect();

        if cancel.is_cancelled() {
            info!("Run {} cancelled before start", run.id);
            return self.finish(run, RunStatus::Cancelled, None).await;
        }

        if let Err(e) = self.agent.tokens().acquire().await {
            error!("Run {}: no credentials, no items attempted: {}", run.id, e);
            return self
                .finish(run, RunStatus::Failed, Some(e.to_string()))
                .await;
        }

        self.transition(&mut run, RunStatus::Running).await?;
        info!(
            "Run {} running: {} items, concurrency {}",
            run.id,
            items.len(),
            self.config.concurrency
        );

        let fatal = match self.dispatch(&mut run, items, &cancel).await {
            Ok(fatal) => fatal,
            Err(e) => return Err(self.abort(&run, e).await),
        };

        let undispatched = run
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .count();

        match fatal {
            Some(e) => {
                self.finish(run, RunStatus::Failed, Some(e.to_string()))
                    .await
            }
            None if cancel.is_cancelled() && undispatched > 0 => {
                info!("Run {} cancelled with {} items undispatched", run.id, undispatched);
                self.finish(run, RunStatus::Cancelled, None).await
            }
            None => self.finish(run, RunStatus::Completed, None).await,
        }
    }

    /// Process every item until the dataset is exhausted, `cancel` fires or
    /// credentials are lost. Returns the credential error, if any.
    async fn dispatch(
        &self,
        run: &mut Run,
        items: Vec<DatasetItem>,
        cancel: &CancellationToken,
    ) -> Result<Option<AuthError>, EngineError> {
        let stop = cancel.child_token();
        let interval = self.config.dispatch_interval;

        let outcomes = stream::iter(items.into_iter().enumerate())
            .then(|(index, item)| async move {
                if index > 0 && !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                (index, item)
            })
            .take_until(stop.cancelled())
            .map(|(index, item)| self.process(index, item))
            .buffer_unordered(self.config.concurrency.max(1));
        let mut outcomes = std::pin::pin!(outcomes);

        let mut fatal = None;
        while let Some(outcome) = outcomes.next().await {
            if let Some(e) = outcome.fatal {
                if fatal.is_none() {
                    warn!("Run {}: credentials lost, stopping dispatch", run.id);
                    stop.cancel();
                    fatal = Some(e);
                }
            }

            let result = outcome.result;
            self.store.append_item_result(&run.id, &result).await?;
            let index = result.index;
            run.items[index] = result;
        }

        Ok(fatal)
    }

    async fn process(&self, index: usize, item: DatasetItem) -> ItemOutcome {
        let start = Instant::now();
        let elapsed = || start.elapsed().as_millis() as u64;

        if let Err(reason) = item.validate() {
            warn!("Item {} is invalid: {}", index, reason);
            return RunItemResult::failed(index, &item, ItemError::InvalidItem(reason), elapsed())
                .into();
        }

        debug!("Item {} ({}) started", index, item.eval_type);
        match self.agent.converse(&item).await {
            Ok(transcript) => {
                let metrics = self.registry.metrics_for(item.eval_type);
                let scores = self.judge.score_all(&metrics, &transcript, &item).await;
                let errored = scores.iter().filter(|s| s.is_error()).count();
                debug!(
                    "Item {} scored {} metrics ({} errored)",
                    index,
                    scores.len(),
                    errored
                );
                RunItemResult::completed(index, &item, transcript, scores, elapsed()).into()
            }
            Err(ConverseError::Agent(e)) => {
                warn!("Item {} failed: {}", index, e);
                RunItemResult::failed(index, &item, e.into(), elapsed()).into()
            }
            Err(ConverseError::Auth(e)) => {
                error!("Item {} could not obtain credentials: {}", index, e);
                let error = AgentError::auth_rejected(e.to_string());
                ItemOutcome {
                    result: RunItemResult::failed(index, &item, error.into(), elapsed()),
                    fatal: Some(e),
                }
            }
        }
    }

    async fn transition(&self, run: &mut Run, status: RunStatus) -> EngineResult<()> {
        self.store.update_run_status(&run.id, status).await?;
        run.set_status(status)?;
        info!("Run {} -> {}", run.id, status);
        Ok(())
    }

    async fn finish(
        &self,
        mut run: Run,
        status: RunStatus,
        failure: Option<String>,
    ) -> EngineResult<Run> {
        if let Err(e) = self.transition(&mut run, status).await {
            return Err(self.abort(&run, e).await);
        }

        let mut summary = RunSummary::from_items(&run.items);
        if let Some(failure) = failure {
            summary = summary.with_failure(failure);
        }
        self.store.finalize_run(&run.id, &summary).await?;
        run.record_summary(summary)?;

        if let Some(summary) = &run.summary {
            info!(
                "Run {} {}: {}/{} completed, {} failed, {} pending, pass rate {:.1}%",
                run.id,
                run.status,
                summary.completed_items,
                summary.total_items,
                summary.failed_items,
                summary.pending_items,
                summary.pass_rate * 100.0
            );
        }
        Ok(run)
    }

    /// Best-effort move to `failed` after a store error.
    async fn abort(&self, run: &Run, err: EngineError) -> EngineError {
        error!("Run {} aborted: {}", run.id, err);
        if !run.status.is_terminal() {
            if let Err(e) = self.store.update_run_status(&run.id, RunStatus::Failed).await {
                warn!("Run {}: could not record failure: {}", run.id, e);
            }
        }
        err
    }
}
