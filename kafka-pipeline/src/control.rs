//! Lifecycle of a running pipeline.
//!
//! A pipeline is a set of stage tasks. [`PipelineControl`] owns two one-way
//! signals: `drain` stops the source and lets every admitted element finish,
//! `shutdown` makes every stage return at its next suspension point. The
//! terminal result is computed once by a supervisor task and cached, so
//! repeated calls all observe the same outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::kafka::client::{ConsumerClient, ProducerClient};
use crate::metrics::PipelineMetrics;
use crate::metrics_consts::PIPELINE_TERMINATED_COUNTER;
use crate::offset::CommitSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    ShuttingDown,
    Drained,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Drained | Self::Failed)
    }
}

/// Final value of a pipeline that completed without error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub records_emitted: u64,
    pub records_processed: u64,
    pub records_sent: u64,
    pub commits: CommitSummary,
}

impl PipelineSummary {
    pub fn merge(&mut self, other: PipelineSummary) {
        self.records_emitted += other.records_emitted;
        self.records_processed += other.records_processed;
        self.records_sent += other.records_sent;
        self.commits.merge(other.commits);
    }
}

type StageResult<T> = Option<Result<T, PipelineError>>;

/// A spawned task whose result can be awaited by any number of observers
#[derive(Clone)]
pub struct StageHandle<T: Clone> {
    name: &'static str,
    result: watch::Receiver<StageResult<T>>,
}

impl<T> StageHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn spawn<F>(name: &'static str, task: F) -> Self
    where
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let (tx, result) = watch::channel(None);
        let inner = tokio::spawn(task);
        tokio::spawn(async move {
            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(e) => Err(PipelineError::StagePanicked {
                    stage: name,
                    message: e.to_string(),
                }),
            };
            tx.send_replace(Some(outcome));
        });
        Self { name, result }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    pub async fn wait(&self) -> Result<T, PipelineError> {
        let mut rx = self.result.clone();
        let stage = self.name;
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.as_ref().cloned(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(PipelineError::StagePanicked {
                stage,
                message: "stage finished without a result".to_string(),
            })
        })
    }
}

/// Wait for every stage. The first failure cancels `shutdown` so the
/// remaining stages stop, and is returned once they have.
pub async fn supervise(
    stages: Vec<StageHandle<PipelineSummary>>,
    shutdown: CancellationToken,
) -> Result<PipelineSummary, PipelineError> {
    let mut waiting: FuturesUnordered<_> = stages
        .iter()
        .map(|stage| async move { (stage.name(), stage.wait().await) })
        .collect();

    let mut summary = PipelineSummary::default();
    let mut first_error: Option<PipelineError> = None;

    while let Some((stage, result)) = waiting.next().await {
        match result {
            Ok(partial) => summary.merge(partial),
            Err(e) => {
                if first_error.is_none() {
                    error!(stage = stage, error = %e, "Pipeline stage failed, stopping pipeline");
                    shutdown.cancel();
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(summary),
    }
}

struct ControlInner {
    state: watch::Sender<PipelineState>,
    result: watch::Receiver<StageResult<PipelineSummary>>,
    drain: CancellationToken,
    shutdown: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    consumer: Arc<dyn ConsumerClient>,
    producer: Option<Arc<dyn ProducerClient>>,
}

/// Handle returned when a pipeline starts
#[derive(Clone)]
pub struct PipelineControl {
    inner: Arc<ControlInner>,
}

/// Signals shared between a pipeline's stages and its control
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub drain: CancellationToken,
    pub shutdown: CancellationToken,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineControl {
    /// Supervise `stages` and expose their lifecycle. The consumer is closed
    /// once every stage has finished.
    pub fn launch(
        stages: Vec<StageHandle<PipelineSummary>>,
        signals: Signals,
        consumer: Arc<dyn ConsumerClient>,
        producer: Option<Arc<dyn ProducerClient>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Running);
        let (result_tx, result) = watch::channel(None);

        let inner = Arc::new(ControlInner {
            state,
            result,
            drain: signals.drain,
            shutdown: signals.shutdown,
            metrics,
            consumer,
            producer,
        });

        let supervisor = inner.clone();
        tokio::spawn(async move {
            let outcome = supervise(stages, supervisor.shutdown.clone()).await;
            supervisor.consumer.close();

            let terminal = match &outcome {
                Ok(summary) => {
                    info!(
                        emitted = summary.records_emitted,
                        processed = summary.records_processed,
                        commit_batches = summary.commits.batches,
                        "Pipeline drained"
                    );
                    PipelineState::Drained
                }
                Err(e) => {
                    error!(error = %e, "Pipeline failed");
                    PipelineState::Failed
                }
            };
            metrics::counter!(
                PIPELINE_TERMINATED_COUNTER,
                "outcome" => if terminal == PipelineState::Drained { "drained" } else { "failed" }
            )
            .increment(1);

            supervisor.state.send_replace(terminal);
            result_tx.send_replace(Some(outcome));
        });

        Self { inner }
    }

    pub fn state(&self) -> PipelineState {
        *self.inner.state.borrow()
    }

    /// Resolves when the state changes to `target` or any terminal state
    pub async fn wait_for_state(&self, target: PipelineState) -> PipelineState {
        let mut rx = self.inner.state.subscribe();
        let reached = match rx.wait_for(|s| *s == target || s.is_terminal()).await {
            Ok(state) => Some(*state),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| self.state())
    }

    fn begin_shutdown(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == PipelineState::Running {
                *state = PipelineState::ShuttingDown;
                true
            } else {
                false
            }
        });
    }

    /// Stop every stage at its next suspension point. In-flight elements may
    /// be abandoned without being committed.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.begin_shutdown();
        self.inner.drain.cancel();
        self.inner.shutdown.cancel();
        self.wait().await.map(|_| ())
    }

    /// Stop consuming, let every admitted element finish (process, send,
    /// commit), then stop.
    pub async fn drain_and_shutdown(&self) -> Result<PipelineSummary, PipelineError> {
        self.begin_shutdown();
        self.inner.drain.cancel();
        self.wait().await
    }

    /// Wait for the pipeline to end on its own
    pub async fn wait(&self) -> Result<PipelineSummary, PipelineError> {
        let mut rx = self.inner.result.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.as_ref().cloned(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(PipelineError::StagePanicked {
                stage: "supervisor",
                message: "pipeline supervisor went away".to_string(),
            })
        })
    }

    /// Pipeline counters merged with the broker clients' own metrics
    pub fn metrics(&self) -> HashMap<String, f64> {
        let mut snapshot = self.inner.consumer.metrics();
        if let Some(producer) = &self.inner.producer {
            snapshot.extend(producer.metrics());
        }
        snapshot.extend(self.inner.metrics.snapshot());
        snapshot.insert(
            "pipeline_state".to_string(),
            match self.state() {
                PipelineState::Running => 0.0,
                PipelineState::ShuttingDown => 1.0,
                PipelineState::Drained => 2.0,
                PipelineState::Failed => 3.0,
            },
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::BrokerError;
    use crate::kafka::test_utils::InMemoryBroker;

    fn launch(stages: Vec<StageHandle<PipelineSummary>>, signals: Signals) -> PipelineControl {
        let broker = InMemoryBroker::new();
        PipelineControl::launch(
            stages,
            signals,
            Arc::new(broker.consumer("group")),
            None,
            Arc::new(PipelineMetrics::new()),
        )
    }

    fn waiting_stage(name: &'static str, signals: &Signals, emitted: u64) -> StageHandle<PipelineSummary> {
        let drain = signals.drain.clone();
        let shutdown = signals.shutdown.clone();
        StageHandle::spawn(name, async move {
            tokio::select! {
                _ = drain.cancelled() => {}
                _ = shutdown.cancelled() => {}
            }
            Ok(PipelineSummary {
                records_emitted: emitted,
                ..Default::default()
            })
        })
    }

    #[tokio::test]
    async fn test_drain_returns_merged_summary_and_is_idempotent() {
        let signals = Signals::new();
        let control = launch(
            vec![
                waiting_stage("a", &signals, 2),
                waiting_stage("b", &signals, 3),
            ],
            signals,
        );
        assert_eq!(control.state(), PipelineState::Running);

        let summary = control.drain_and_shutdown().await.unwrap();
        assert_eq!(summary.records_emitted, 5);
        assert_eq!(control.state(), PipelineState::Drained);

        // Terminal: further calls return the cached outcome
        assert_eq!(control.drain_and_shutdown().await.unwrap(), summary);
        assert!(control.shutdown().await.is_ok());
        assert_eq!(control.state(), PipelineState::Drained);
    }

    #[tokio::test]
    async fn test_first_failure_stops_other_stages() {
        let signals = Signals::new();
        let failing = StageHandle::spawn("failing", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<PipelineSummary, _>(PipelineError::from(BrokerError::ConsumerEvicted(
                "missed heartbeat".into(),
            )))
        });
        let control = launch(vec![failing, waiting_stage("waiting", &signals, 1)], signals);

        // A terminal state also ends a wait for another state
        assert_eq!(
            control.wait_for_state(PipelineState::Drained).await,
            PipelineState::Failed
        );
        let err = control.wait().await.unwrap_err();
        assert!(matches!(err, PipelineError::ConsumerEvicted(_)));

        // Both operations resolve with the same first error
        assert!(matches!(
            control.shutdown().await,
            Err(PipelineError::ConsumerEvicted(_))
        ));
        assert!(matches!(
            control.drain_and_shutdown().await,
            Err(PipelineError::ConsumerEvicted(_))
        ));
    }

    #[tokio::test]
    async fn test_panicking_stage_fails_pipeline() {
        let signals = Signals::new();
        let panicking = StageHandle::spawn("panicking", async {
            if true {
                panic!("boom");
            }
            Ok(PipelineSummary::default())
        });
        let control = launch(vec![panicking], signals);
        assert!(matches!(
            control.wait().await,
            Err(PipelineError::StagePanicked {
                stage: "panicking",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_metrics_include_state() {
        let signals = Signals::new();
        let control = launch(vec![waiting_stage("a", &signals, 0)], signals);
        let snapshot = control.metrics();
        assert_eq!(snapshot["pipeline_state"], 0.0);
        assert!(snapshot.contains_key("records_emitted"));
        assert!(snapshot.contains_key("client_poll_calls"));
        control.shutdown().await.unwrap();
        assert_eq!(control.metrics()["pipeline_state"], 2.0);
    }
}
