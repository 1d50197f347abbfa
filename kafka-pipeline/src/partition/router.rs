//! Partition Router - one worker per owned partition, bounded in number
//!
//! The router is a rebalance listener. Workers are started when partitions
//! are assigned and drained when they are revoked; the revocation callback
//! only returns once the revoked workers have committed, so the next owner
//! starts from the offsets this member processed.
//!
//! At most `max_concurrent_partitions` workers run at once. Partitions
//! assigned beyond that are paused and queued until a slot frees up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::control::PipelineSummary;
use crate::error::PipelineError;
use crate::kafka::assignment::PauseReason;
use crate::kafka::client::{ConsumerClient, RebalanceListener};
use crate::kafka::types::Partition;
use crate::metrics_consts::{
    ACTIVE_PARTITIONS_GAUGE, PARTITION_BACKPRESSURE_COUNTER, QUEUED_PARTITIONS_GAUGE,
    QUEUED_RECORDS_DROPPED_COUNTER, REBALANCE_EVENTS_COUNTER, STALE_RECORDS_DROPPED_COUNTER,
};
use crate::offset::CommittableRecord;
use crate::partition::worker::{PartitionWorker, WorkerContext};
use crate::source::RecordStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct PartitionRouter {
    client: Weak<dyn ConsumerClient>,
    context: WorkerContext,
    max_concurrent_partitions: usize,
    workers: DashMap<Partition, PartitionWorker>,
    /// Assigned partitions waiting for a free worker slot, all paused
    queued: Mutex<VecDeque<Partition>>,
    /// Lowest offset dropped for a queued partition, to seek back to
    skipped: DashMap<Partition, i64>,
    /// Promoted partitions waiting for the record they were rewound to.
    /// Anything else arriving first was fetched before the seek.
    rewound: DashMap<Partition, i64>,
    completed: Mutex<PipelineSummary>,
    failure: Mutex<Option<PipelineError>>,
}

impl PartitionRouter {
    pub fn new(
        client: Weak<dyn ConsumerClient>,
        context: WorkerContext,
        max_concurrent_partitions: usize,
    ) -> Self {
        Self {
            client,
            context,
            max_concurrent_partitions: max_concurrent_partitions.max(1),
            workers: DashMap::new(),
            queued: Mutex::new(VecDeque::new()),
            skipped: DashMap::new(),
            rewound: DashMap::new(),
            completed: Mutex::new(PipelineSummary::default()),
            failure: Mutex::new(None),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn active_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<Partition> = self.workers.iter().map(|r| r.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn queued_partitions(&self) -> Vec<Partition> {
        lock(&self.queued).iter().cloned().collect()
    }

    pub fn has_partition(&self, partition: &Partition) -> bool {
        self.workers.contains_key(partition)
    }

    /// First error reported by a worker, if any
    pub fn failure(&self) -> Option<PipelineError> {
        lock(&self.failure).clone()
    }

    fn fail(&self, error: PipelineError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            error!(error = %error, "Partition worker failed, stopping pipeline");
            *failure = Some(error);
        }
        self.context.shutdown.cancel();
    }

    fn publish_counts(&self) {
        let active = self.workers.len();
        let queued = lock(&self.queued).len();
        metrics::gauge!(ACTIVE_PARTITIONS_GAUGE).set(active as f64);
        metrics::gauge!(QUEUED_PARTITIONS_GAUGE).set(queued as f64);
        self.context.metrics.set_partitions(active, queued);
    }

    /// Start a worker for an owned partition, or queue it when all slots are
    /// taken
    async fn add_partition(&self, partition: Partition) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let Some(generation) = client.generation(&partition) else {
            warn!(partition = %partition, "Assigned partition is not owned, skipping");
            return;
        };

        // Re-assigned before its revocation was seen: retire the old worker
        let existing = self.workers.remove(&partition).map(|(_, w)| w);
        if let Some(existing) = existing {
            if existing.generation() == generation {
                debug!(partition = %partition, "Worker already running, reusing");
                self.workers.insert(partition, existing);
                return;
            }
            info!(partition = %partition, "Replacing worker from an older assignment");
            self.finish(existing).await;
        }

        if self.workers.len() >= self.max_concurrent_partitions {
            if let Err(e) = client.pause(std::slice::from_ref(&partition), PauseReason::Queued) {
                warn!(partition = %partition, error = %e, "Failed to pause queued partition");
            }
            info!(
                partition = %partition,
                max_concurrent_partitions = self.max_concurrent_partitions,
                "All partition slots taken, queueing partition"
            );
            let mut queued = lock(&self.queued);
            if !queued.contains(&partition) {
                queued.push_back(partition);
            }
            return;
        }

        info!(partition = %partition, generation = generation, "Creating partition worker");
        let worker = PartitionWorker::spawn(partition.clone(), generation, &self.context);
        self.workers.insert(partition, worker);
    }

    /// Promote queued partitions into free slots
    fn fill_free_slots(&self) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        while self.workers.len() < self.max_concurrent_partitions {
            let next = lock(&self.queued).pop_front();
            let Some(partition) = next else {
                break;
            };
            let Some(generation) = client.generation(&partition) else {
                self.skipped.remove(&partition);
                continue;
            };

            if let Some((_, offset)) = self.skipped.remove(&partition) {
                match client.seek(&partition, offset) {
                    Ok(()) => {
                        self.rewound.insert(partition.clone(), offset);
                    }
                    Err(e) => {
                        warn!(partition = %partition, error = %e, "Failed to rewind promoted partition")
                    }
                }
            }
            if let Err(e) = client.resume(std::slice::from_ref(&partition), PauseReason::Queued) {
                warn!(partition = %partition, error = %e, "Failed to resume promoted partition");
            }
            info!(partition = %partition, "Slot freed, starting queued partition");
            let worker = PartitionWorker::spawn(partition.clone(), generation, &self.context);
            self.workers.insert(partition, worker);
        }
    }

    async fn finish(&self, worker: PartitionWorker) {
        match worker.drain().await {
            Ok(summary) => lock(&self.completed).merge(summary),
            Err(e) => self.fail(e),
        }
    }

    /// Drain the workers of `partitions` concurrently
    async fn remove_partitions(&self, partitions: &[Partition]) {
        {
            let mut queued = lock(&self.queued);
            queued.retain(|p| !partitions.contains(p));
        }
        for partition in partitions {
            self.skipped.remove(partition);
            self.rewound.remove(partition);
        }

        let workers: Vec<PartitionWorker> = partitions
            .iter()
            .filter_map(|p| self.workers.remove(p).map(|(_, w)| w))
            .collect();
        if workers.is_empty() {
            return;
        }
        info!(workers = workers.len(), "Draining partition workers");
        join_all(workers.into_iter().map(|w| self.finish(w))).await;
    }

    /// Drain every worker and return what they did in total
    pub async fn drain_all(&self) -> Result<PipelineSummary, PipelineError> {
        let partitions: Vec<Partition> = self.workers.iter().map(|r| r.key().clone()).collect();
        info!(workers = partitions.len(), "Shutting down partition router");
        self.remove_partitions(&partitions).await;
        lock(&self.queued).clear();
        self.publish_counts();

        match self.failure() {
            Some(e) => Err(e),
            None => Ok(std::mem::take(&mut *lock(&self.completed))),
        }
    }

    /// Hand a record to its partition's worker.
    ///
    /// Records of queued partitions are dropped and remembered so the
    /// partition is rewound when it gets a worker. After the rewind, records
    /// ahead of the rewound offset are dropped until it arrives. Records from
    /// an older assignment are dropped as stale.
    pub async fn route(&self, committable: CommittableRecord) -> Result<(), PipelineError> {
        let partition = committable.record.partition().clone();
        let offset = committable.record.offset();

        let expected = self.rewound.get(&partition).map(|o| *o);
        if let Some(expected) = expected {
            if offset != expected {
                self.drop_queued(&partition, offset);
                return Ok(());
            }
            self.rewound.remove(&partition);
        }

        // Release the DashMap guard before awaiting
        let target = self
            .workers
            .get(&partition)
            .map(|w| (w.sender(), w.capacity(), w.generation()));

        let Some((sender, capacity, generation)) = target else {
            if lock(&self.queued).contains(&partition) {
                self.drop_queued(&partition, offset);
                self.skipped
                    .entry(partition)
                    .and_modify(|o| *o = (*o).min(offset))
                    .or_insert(offset);
            } else {
                self.drop_stale(&partition, offset);
            }
            return Ok(());
        };

        if committable.handle.generation() != generation {
            self.drop_stale(&partition, offset);
            return Ok(());
        }

        if capacity == 0 {
            metrics::counter!(
                PARTITION_BACKPRESSURE_COUNTER,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
        }

        tokio::select! {
            biased;
            _ = self.context.shutdown.cancelled() => Ok(()),
            sent = sender.send(committable) => {
                if sent.is_err() {
                    // The worker stopped: either revoked meanwhile or failed
                    if let Some(e) = self.failure() {
                        return Err(e);
                    }
                    self.drop_stale(&partition, offset);
                }
                Ok(())
            }
        }
    }

    fn drop_queued(&self, partition: &Partition, offset: i64) {
        debug!(partition = %partition, offset = offset, "Dropping record to be fetched again");
        metrics::counter!(QUEUED_RECORDS_DROPPED_COUNTER).increment(1);
        self.context.metrics.queued_record_dropped();
    }

    fn drop_stale(&self, partition: &Partition, offset: i64) {
        debug!(partition = %partition, offset = offset, "Dropping record without a current worker");
        metrics::counter!(STALE_RECORDS_DROPPED_COUNTER).increment(1);
        self.context.metrics.stale_record_dropped();
    }

    /// Route every record of `stream` until it ends or shutdown is requested,
    /// then drain the workers
    pub async fn dispatch(
        self: Arc<Self>,
        mut stream: RecordStream<CommittableRecord>,
    ) -> Result<PipelineSummary, PipelineError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.context.shutdown.cancelled() => None,
                next = stream.recv() => next,
            };
            let Some(committable) = next else {
                break;
            };
            self.route(committable).await?;
        }
        // Stop the source side from blocking on a full buffer
        drop(stream);
        self.drain_all().await
    }
}

#[async_trait]
impl RebalanceListener for PartitionRouter {
    async fn on_partitions_assigned(&self, partitions: &[Partition]) {
        metrics::counter!(REBALANCE_EVENTS_COUNTER, "event" => "assigned").increment(1);
        for partition in partitions {
            self.add_partition(partition.clone()).await;
        }
        self.publish_counts();
    }

    async fn on_partitions_revoked(&self, partitions: &[Partition]) {
        metrics::counter!(REBALANCE_EVENTS_COUNTER, "event" => "revoked").increment(1);
        self.remove_partitions(partitions).await;
        self.fill_free_slots();
        self.publish_counts();
    }
}
