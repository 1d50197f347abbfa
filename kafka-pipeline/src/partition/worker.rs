//! Partition Worker - processes the records of a single owned partition
//!
//! Each partition gets its own worker task with a bounded channel, so:
//! 1. Records of a partition are processed in offset order
//! 2. Partitions are processed in parallel
//! 3. A slow partition only backs up its own channel
//!
//! The worker is the single writer of its partition's offsets. It folds
//! commit handles into its own batch and commits it on the usual count and
//! time triggers, and once more when its channel closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::PipelineSummary;
use crate::error::PipelineError;
use crate::kafka::types::Partition;
use crate::metrics::PipelineMetrics;
use crate::metrics_consts::{PROCESSING_ERRORS_COUNTER, RECORDS_PROCESSED_COUNTER};
use crate::offset::committer::commit_batch;
use crate::offset::{BatchAccumulator, CommittableRecord, CommitterSettings};
use crate::pipeline::RecordProcessor;

/// Everything a worker needs besides its partition
#[derive(Clone)]
pub struct WorkerContext {
    pub processor: Arc<dyn RecordProcessor>,
    pub committer: CommitterSettings,
    /// Records buffered per partition
    pub buffer_size: usize,
    pub metrics: Arc<PipelineMetrics>,
    /// Abandon queued records and pending commits
    pub shutdown: CancellationToken,
}

pub struct PartitionWorker {
    partition: Partition,
    generation: u64,
    sender: mpsc::Sender<CommittableRecord>,
    handle: JoinHandle<Result<PipelineSummary, PipelineError>>,
}

impl PartitionWorker {
    pub fn spawn(partition: Partition, generation: u64, context: &WorkerContext) -> Self {
        let (sender, receiver) = mpsc::channel(context.buffer_size.max(1));
        let handle = tokio::spawn(run_worker(partition.clone(), receiver, context.clone()));

        Self {
            partition,
            generation,
            sender,
            handle,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Assignment generation the worker was started under
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Get a clone of the sender for use outside of DashMap guards
    pub fn sender(&self) -> mpsc::Sender<CommittableRecord> {
        self.sender.clone()
    }

    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Close the channel and wait until everything queued is processed and
    /// committed
    pub async fn drain(self) -> Result<PipelineSummary, PipelineError> {
        drop(self.sender);

        match self.handle.await {
            Ok(result) => {
                debug!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    "Partition worker drained"
                );
                result
            }
            Err(e) => {
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition_number(),
                    error = %e,
                    "Partition worker panicked"
                );
                Err(PipelineError::StagePanicked {
                    stage: "partition_worker",
                    message: e.to_string(),
                })
            }
        }
    }
}

async fn run_worker(
    partition: Partition,
    mut receiver: mpsc::Receiver<CommittableRecord>,
    context: WorkerContext,
) -> Result<PipelineSummary, PipelineError> {
    info!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        "Starting partition worker"
    );

    let mut accumulator = BatchAccumulator::new(&context.committer);
    let mut summary = PipelineSummary::default();

    loop {
        let deadline = accumulator
            .deadline()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            biased;
            _ = context.shutdown.cancelled() => {
                if !accumulator.is_empty() {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition_number(),
                        pending = accumulator.len(),
                        "Shutdown requested, abandoning uncommitted offsets"
                    );
                }
                return Ok(summary);
            }
            next = receiver.recv() => {
                let Some(committable) = next else {
                    break;
                };
                let (record, handle) = committable.into_parts();

                if let Err(e) = context.processor.process(&record).await {
                    metrics::counter!(PROCESSING_ERRORS_COUNTER).increment(1);
                    return Err(PipelineError::processing(
                        record.partition().clone(),
                        record.offset(),
                        e,
                    ));
                }
                metrics::counter!(RECORDS_PROCESSED_COUNTER).increment(1);
                context.metrics.record_processed();
                summary.records_processed += 1;

                if accumulator.push(handle) {
                    commit_batch(
                        accumulator.take(),
                        &context.committer,
                        &context.metrics,
                        &mut summary.commits,
                    )
                    .await?;
                }
            }
            _ = tokio::time::sleep_until(deadline), if !accumulator.is_empty() => {
                commit_batch(
                    accumulator.take(),
                    &context.committer,
                    &context.metrics,
                    &mut summary.commits,
                )
                .await?;
            }
        }
    }

    commit_batch(
        accumulator.take(),
        &context.committer,
        &context.metrics,
        &mut summary.commits,
    )
    .await?;

    info!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        processed = summary.records_processed,
        "Partition worker stopped"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::kafka::client::ConsumerClient;
    use crate::kafka::test_utils::InMemoryBroker;
    use crate::kafka::types::{PartitionStart, Record};
    use crate::offset::CommitHandle;

    struct Recording {
        seen: Mutex<Vec<i64>>,
        fail_at: Option<i64>,
    }

    #[async_trait]
    impl RecordProcessor for Recording {
        async fn process(&self, record: &Record) -> anyhow::Result<()> {
            if Some(record.offset()) == self.fail_at {
                return Err(anyhow!("bad record"));
            }
            self.seen.lock().unwrap().push(record.offset());
            Ok(())
        }
    }

    fn context(processor: Arc<dyn RecordProcessor>) -> WorkerContext {
        WorkerContext {
            processor,
            committer: CommitterSettings {
                max_batch: 4,
                ..Default::default()
            },
            buffer_size: 8,
            metrics: Arc::new(PipelineMetrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    async fn assigned(broker: &InMemoryBroker, partition: &Partition) -> (Arc<dyn ConsumerClient>, u64) {
        let client: Arc<dyn ConsumerClient> = Arc::new(broker.consumer("group"));
        client
            .assign(&[PartitionStart::committed(partition.clone())])
            .await
            .unwrap();
        let generation = client.generation(partition).unwrap();
        (client, generation)
    }

    fn committable(
        client: &Arc<dyn ConsumerClient>,
        partition: &Partition,
        offset: i64,
        generation: u64,
    ) -> CommittableRecord {
        let record = Record::new(partition.clone(), offset, None, None, None);
        let handle = CommitHandle::new(partition.clone(), offset, generation, Arc::downgrade(client));
        CommittableRecord::new(record, handle)
    }

    #[tokio::test]
    async fn test_worker_processes_in_order_and_commits_on_drain() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 1);
        let partition = Partition::new("events", 0);
        let (client, generation) = assigned(&broker, &partition).await;

        let processor = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_at: None,
        });
        let worker = PartitionWorker::spawn(partition.clone(), generation, &context(processor.clone()));

        for offset in 0..10 {
            worker
                .sender()
                .send(committable(&client, &partition, offset, generation))
                .await
                .unwrap();
        }

        let summary = worker.drain().await.unwrap();
        assert_eq!(*processor.seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(summary.records_processed, 10);
        // Two full batches of 4 plus the remainder on drain
        assert_eq!(summary.commits.batches, 3);
        assert_eq!(broker.committed("group", &partition), Some(10));
    }

    #[tokio::test]
    async fn test_worker_fails_on_processing_error_without_committing_it() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 1);
        let partition = Partition::new("events", 0);
        let (client, generation) = assigned(&broker, &partition).await;

        let processor = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_at: Some(2),
        });
        let worker = PartitionWorker::spawn(partition.clone(), generation, &context(processor));

        for offset in 0..3 {
            worker
                .sender()
                .send(committable(&client, &partition, offset, generation))
                .await
                .unwrap();
        }

        let err = worker.drain().await.unwrap_err();
        assert!(matches!(err, PipelineError::Processing { offset: 2, .. }));
        assert_eq!(broker.committed("group", &partition), None);
    }

    #[tokio::test]
    async fn test_worker_abandons_pending_commits_on_shutdown() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 1);
        let partition = Partition::new("events", 0);
        let (client, generation) = assigned(&broker, &partition).await;

        let processor = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            fail_at: None,
        });
        let ctx = context(processor.clone());
        let worker = PartitionWorker::spawn(partition.clone(), generation, &ctx);

        worker
            .sender()
            .send(committable(&client, &partition, 0, generation))
            .await
            .unwrap();
        while processor.seen.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        ctx.shutdown.cancel();
        let summary = worker.drain().await.unwrap();
        assert_eq!(summary.commits.batches, 0);
        assert!(broker.commit_log().is_empty());
    }
}
