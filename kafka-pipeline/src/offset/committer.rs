//! Batched committing of offsets.
//!
//! Handles are folded into a [`CommitBatch`] which is flushed when it holds
//! `max_batch` handles or when `max_interval` has passed since its first
//! handle arrived, whichever comes first. The committer also flushes on
//! revocation (through [`RevocationFlush`]) and once more when its input
//! closes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BatchCommitError, CommitError, PipelineError};
use crate::kafka::client::RebalanceListener;
use crate::kafka::types::Partition;
use crate::metrics::PipelineMetrics;
use crate::metrics_consts::{
    COMMIT_BATCH_SIZE_HISTOGRAM, COMMIT_CALLS_COUNTER, COMMIT_DURATION_HISTOGRAM,
    COMMIT_FAILURES_COUNTER, COMMITTED_OFFSET_GAUGE,
};
use crate::offset::batch::CommitBatch;
use crate::offset::handle::CommitHandle;

#[derive(Debug, Clone)]
pub struct CommitterSettings {
    /// Flush after this many handles
    pub max_batch: usize,
    /// Flush when the oldest handle in the batch is this old
    pub max_interval: Duration,
    /// Attempts after the first for transient commit failures
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CommitterSettings {
    fn default() -> Self {
        Self {
            max_batch: 20,
            max_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// What a committer did over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub batches: u64,
    pub handles: u64,
    pub stale_dropped: u64,
    pub last_committed: BTreeMap<Partition, i64>,
}

impl CommitSummary {
    pub fn merge(&mut self, other: CommitSummary) {
        self.batches += other.batches;
        self.handles += other.handles;
        self.stale_dropped += other.stale_dropped;
        for (partition, offset) in other.last_committed {
            let entry = self.last_committed.entry(partition).or_insert(offset);
            *entry = (*entry).max(offset);
        }
    }
}

/// Count and time triggers around a [`CommitBatch`]. Holds no I/O.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_batch: usize,
    max_interval: Duration,
    batch: CommitBatch,
    opened_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(settings: &CommitterSettings) -> Self {
        Self {
            max_batch: settings.max_batch.max(1),
            max_interval: settings.max_interval,
            batch: CommitBatch::empty(),
            opened_at: None,
        }
    }

    /// Fold a handle in. Returns true when the count trigger fired.
    pub fn push(&mut self, handle: CommitHandle) -> bool {
        if self.batch.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.batch.update(handle);
        self.is_full()
    }

    /// When the time trigger fires for the current batch
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.max_interval)
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.batch.len() >= self.max_batch
    }

    pub fn take(&mut self) -> CommitBatch {
        self.opened_at = None;
        self.batch.take()
    }

    pub fn take_partitions(&mut self, partitions: &[Partition]) -> CommitBatch {
        let taken = self.batch.take_partitions(partitions);
        if self.batch.is_empty() {
            self.opened_at = None;
        }
        taken
    }
}

/// Commit a batch, retrying partitions that failed transiently.
///
/// Partitions whose generation went stale are dropped with a warning: the
/// partition now belongs to a newer assignment which re-delivers from the
/// last committed offset.
pub async fn commit_batch(
    batch: CommitBatch,
    settings: &CommitterSettings,
    metrics: &PipelineMetrics,
    summary: &mut CommitSummary,
) -> Result<(), PipelineError> {
    if batch.is_empty() {
        return Ok(());
    }

    let handles = batch.len();
    metrics::histogram!(COMMIT_BATCH_SIZE_HISTOGRAM).record(handles as f64);
    summary.batches += 1;
    summary.handles += handles as u64;

    let mut pending = batch;
    let mut attempt: u32 = 0;

    loop {
        let started = Instant::now();
        let result = pending.commit().await;
        metrics::histogram!(COMMIT_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        metrics::counter!(COMMIT_CALLS_COUNTER).increment(1);

        let (committed, failure) = match result {
            Ok(committed) => (committed, None),
            Err(BatchCommitError { committed, failed }) => (committed, Some(failed)),
        };

        metrics.commit_call(committed.len() as u64);
        for (partition, next_offset) in committed {
            metrics::gauge!(
                COMMITTED_OFFSET_GAUGE,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .set(next_offset as f64);
            debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                next_offset = next_offset,
                "Committed offset"
            );
            let entry = summary.last_committed.entry(partition).or_insert(next_offset);
            *entry = (*entry).max(next_offset);
        }

        let Some(failed) = failure else {
            return Ok(());
        };

        let mut retryable = BTreeMap::new();
        for (partition, err) in failed {
            metrics.commit_failure();
            metrics::counter!(COMMIT_FAILURES_COUNTER, "error_type" => err.error_type())
                .increment(1);
            match err {
                CommitError::StaleGeneration { .. } => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        error = %err,
                        "Dropping commit for partition no longer owned under this generation"
                    );
                    summary.stale_dropped += 1;
                }
                CommitError::ConsumerClosed => {
                    return Err(PipelineError::Commit(CommitError::ConsumerClosed));
                }
                CommitError::Transient(_) => {
                    retryable.insert(partition, err);
                }
            }
        }

        if retryable.is_empty() {
            return Ok(());
        }

        if attempt >= settings.max_retries {
            error!(
                attempts = attempt + 1,
                partitions = retryable.len(),
                "Giving up on commit after retries"
            );
            return Err(PipelineError::BatchCommit(BatchCommitError {
                committed: Default::default(),
                failed: retryable.into_iter().collect(),
            }));
        }

        let backoff = settings.retry_backoff * 2u32.saturating_pow(attempt);
        warn!(
            attempt = attempt + 1,
            partitions = retryable.len(),
            backoff_ms = backoff.as_millis() as u64,
            "Retrying transient commit failure"
        );
        tokio::time::sleep(backoff).await;
        pending.retain(|partition| retryable.contains_key(partition));
        attempt += 1;
    }
}

/// Request to commit pending offsets of partitions about to be revoked
#[derive(Debug)]
struct FlushRequest {
    partitions: Vec<Partition>,
    done: oneshot::Sender<()>,
}

/// Rebalance listener that makes the committer flush revoked partitions
/// before the revocation completes
#[derive(Debug, Clone)]
pub struct RevocationFlush {
    requests: mpsc::Sender<FlushRequest>,
}

#[async_trait]
impl RebalanceListener for RevocationFlush {
    async fn on_partitions_revoked(&self, partitions: &[Partition]) {
        let (done, wait) = oneshot::channel();
        let request = FlushRequest {
            partitions: partitions.to_vec(),
            done,
        };
        if self.requests.send(request).await.is_err() {
            debug!("Committer already stopped, nothing to flush on revocation");
            return;
        }
        if wait.await.is_err() {
            warn!("Committer stopped before flushing revoked partitions");
        }
    }
}

/// Sending side of a running committer
pub struct Committer {
    input: mpsc::Sender<CommitHandle>,
    revocation: RevocationFlush,
}

impl Committer {
    /// Create the committer channels. The returned future is the committer
    /// task and must be spawned by the caller.
    pub fn new(
        settings: CommitterSettings,
        metrics: std::sync::Arc<PipelineMetrics>,
        shutdown: CancellationToken,
        buffer: usize,
    ) -> (
        Self,
        impl std::future::Future<Output = Result<CommitSummary, PipelineError>> + Send + 'static,
    ) {
        let (input, handles) = mpsc::channel(buffer.max(1));
        let (requests, flushes) = mpsc::channel(8);
        let task = run_committer(settings, handles, flushes, metrics, shutdown);
        (
            Self {
                input,
                revocation: RevocationFlush { requests },
            },
            task,
        )
    }

    pub fn input(&self) -> mpsc::Sender<CommitHandle> {
        self.input.clone()
    }

    pub fn revocation_listener(&self) -> RevocationFlush {
        self.revocation.clone()
    }
}

async fn run_committer(
    settings: CommitterSettings,
    mut handles: mpsc::Receiver<CommitHandle>,
    mut flushes: mpsc::Receiver<FlushRequest>,
    metrics: std::sync::Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<CommitSummary, PipelineError> {
    let mut accumulator = BatchAccumulator::new(&settings);
    let mut summary = CommitSummary::default();

    info!(
        max_batch = settings.max_batch,
        max_interval_ms = settings.max_interval.as_millis() as u64,
        "Starting committer"
    );

    loop {
        let deadline = accumulator
            .deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(
                    pending = accumulator.len(),
                    "Committer shutting down, abandoning pending offsets"
                );
                return Ok(summary);
            }

            Some(request) = flushes.recv() => {
                // Handles sent before the revocation belong to this flush
                while let Ok(handle) = handles.try_recv() {
                    accumulator.push(handle);
                }
                let batch = accumulator.take_partitions(&request.partitions);
                debug!(
                    partitions = request.partitions.len(),
                    handles = batch.len(),
                    "Flushing offsets of revoked partitions"
                );
                let result = commit_batch(batch, &settings, &metrics, &mut summary).await;
                if request.done.send(()).is_err() {
                    debug!("Revocation flush requester went away");
                }
                result?;
                if accumulator.is_full() {
                    commit_batch(accumulator.take(), &settings, &metrics, &mut summary).await?;
                }
            }

            handle = handles.recv() => match handle {
                Some(handle) => {
                    if accumulator.push(handle) {
                        commit_batch(accumulator.take(), &settings, &metrics, &mut summary).await?;
                    }
                }
                None => break,
            },

            _ = tokio::time::sleep_until(deadline), if !accumulator.is_empty() => {
                commit_batch(accumulator.take(), &settings, &metrics, &mut summary).await?;
            }
        }
    }

    commit_batch(accumulator.take(), &settings, &metrics, &mut summary).await?;
    info!(
        batches = summary.batches,
        handles = summary.handles,
        "Committer finished"
    );
    Ok(summary)
}
