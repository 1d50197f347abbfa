//! Accumulates commit handles and commits only the highest offset per partition.
//!
//! Folding a handle never moves a partition backwards within the same
//! generation. A handle from a newer generation replaces the tracked entry
//! (the partition was re-assigned and re-delivered from its committed
//! offset); a handle from an older generation is ignored.

use std::collections::HashMap;
use std::sync::Weak;

use crate::error::{BatchCommitError, CommitError};
use crate::kafka::client::ConsumerClient;
use crate::kafka::types::{CommitPosition, Partition};
use crate::offset::handle::CommitHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tracked {
    offset: i64,
    generation: u64,
}

#[derive(Debug, Default, Clone)]
pub struct CommitBatch {
    offsets: HashMap<Partition, Tracked>,
    count: usize,
    client: Option<Weak<dyn ConsumerClient>>,
}

impl CommitBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fold a handle into the batch, returning the batch
    pub fn updated(mut self, handle: CommitHandle) -> Self {
        self.update(handle);
        self
    }

    pub fn update(&mut self, handle: CommitHandle) {
        self.count += 1;
        if self.client.is_none() {
            self.client = Some(handle.client().clone());
        }
        self.track(
            handle.partition().clone(),
            Tracked {
                offset: handle.offset(),
                generation: handle.generation(),
            },
        );
    }

    fn track(&mut self, partition: Partition, incoming: Tracked) {
        match self.offsets.get_mut(&partition) {
            Some(current) => {
                if incoming.generation > current.generation
                    || (incoming.generation == current.generation
                        && incoming.offset > current.offset)
                {
                    *current = incoming;
                }
            }
            None => {
                self.offsets.insert(partition, incoming);
            }
        }
    }

    /// Combine two batches. Element counts add up.
    pub fn merge(mut self, other: CommitBatch) -> Self {
        self.count += other.count;
        if self.client.is_none() {
            self.client = other.client;
        }
        for (partition, tracked) in other.offsets {
            self.track(partition, tracked);
        }
        self
    }

    /// Number of handles folded in, including superseded ones
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn partition_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<_> = self.offsets.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// Highest record offset tracked for a partition
    pub fn offset(&self, partition: &Partition) -> Option<i64> {
        self.offsets.get(partition).map(|t| t.offset)
    }

    pub fn generation(&self, partition: &Partition) -> Option<u64> {
        self.offsets.get(partition).map(|t| t.generation)
    }

    pub fn positions(&self) -> HashMap<Partition, CommitPosition> {
        self.offsets
            .iter()
            .map(|(partition, tracked)| {
                (
                    partition.clone(),
                    CommitPosition {
                        next_offset: tracked.offset + 1,
                        generation: tracked.generation,
                    },
                )
            })
            .collect()
    }

    /// Take everything out, leaving an empty batch behind
    pub fn take(&mut self) -> CommitBatch {
        std::mem::take(self)
    }

    /// Split off the entries for `partitions`. The element count moves with
    /// the split only when nothing else is left behind.
    pub fn take_partitions(&mut self, partitions: &[Partition]) -> CommitBatch {
        let mut taken = CommitBatch {
            client: self.client.clone(),
            ..Default::default()
        };
        for partition in partitions {
            if let Some(tracked) = self.offsets.remove(partition) {
                taken.offsets.insert(partition.clone(), tracked);
                taken.count += 1;
            }
        }
        if self.offsets.is_empty() {
            taken.count = taken.count.max(self.count);
            self.count = 0;
        } else {
            self.count = self.count.saturating_sub(taken.count);
        }
        taken
    }

    /// Keep only the entries whose partition satisfies `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(&Partition) -> bool) {
        self.offsets.retain(|partition, _| keep(partition));
        if self.offsets.is_empty() {
            self.count = 0;
        }
    }

    /// Commit the highest offset of every partition in one broker call.
    ///
    /// An empty batch succeeds without calling the broker. On partial failure
    /// the error lists what was committed and what failed, so the caller can
    /// retry just the failed partitions.
    pub async fn commit(&self) -> Result<HashMap<Partition, i64>, BatchCommitError> {
        if self.offsets.is_empty() {
            return Ok(HashMap::new());
        }

        let Some(client) = self.client.as_ref().and_then(Weak::upgrade) else {
            return Err(BatchCommitError {
                committed: HashMap::new(),
                failed: self
                    .offsets
                    .keys()
                    .map(|p| (p.clone(), CommitError::ConsumerClosed))
                    .collect(),
            });
        };

        let mut results = client.commit(self.positions()).await;
        let mut committed = HashMap::with_capacity(self.offsets.len());
        let mut failed = HashMap::new();

        for partition in self.offsets.keys() {
            match results.remove(partition) {
                Some(Ok(next_offset)) => {
                    committed.insert(partition.clone(), next_offset);
                }
                Some(Err(e)) => {
                    failed.insert(partition.clone(), e);
                }
                None => {
                    failed.insert(
                        partition.clone(),
                        CommitError::Transient(format!("no commit result returned for {partition}")),
                    );
                }
            }
        }

        if failed.is_empty() {
            Ok(committed)
        } else {
            Err(BatchCommitError { committed, failed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rstest::rstest;

    use crate::kafka::test_utils::{InMemoryBroker, InMemoryConsumer};
    use crate::kafka::types::PartitionStart;

    fn p(n: i32) -> Partition {
        Partition::new("events", n)
    }

    fn detached(partition: Partition, offset: i64, generation: u64) -> CommitHandle {
        let client: Weak<InMemoryConsumer> = Weak::new();
        CommitHandle::new(partition, offset, generation, client)
    }

    async fn assigned_consumer(
        broker: &InMemoryBroker,
        partitions: &[Partition],
    ) -> (Arc<InMemoryConsumer>, Arc<dyn ConsumerClient>) {
        let consumer = Arc::new(broker.consumer("group"));
        let starts: Vec<_> = partitions
            .iter()
            .cloned()
            .map(PartitionStart::committed)
            .collect();
        consumer.assign(&starts).await.unwrap();
        let client: Arc<dyn ConsumerClient> = consumer.clone();
        (consumer, client)
    }

    #[rstest]
    #[case(vec![1, 5, 3], 5)]
    #[case(vec![9, 2, 7, 9], 9)]
    #[case(vec![0], 0)]
    #[case(vec![4, 3, 2, 1], 4)]
    fn test_updated_keeps_maximum_regardless_of_order(
        #[case] offsets: Vec<i64>,
        #[case] expected: i64,
    ) {
        let count = offsets.len();
        let mut seen = Vec::new();
        let batch = offsets.into_iter().fold(CommitBatch::empty(), |batch, offset| {
            let batch = batch.updated(detached(p(0), offset, 1));
            seen.push(batch.offset(&p(0)).unwrap());
            batch
        });

        assert_eq!(batch.offset(&p(0)), Some(expected));
        assert_eq!(batch.len(), count);
        // Monotone non-decreasing after every fold
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_merge_is_commutative() {
        let left = || {
            CommitBatch::empty()
                .updated(detached(p(0), 3, 1))
                .updated(detached(p(1), 10, 1))
        };
        let right = || {
            CommitBatch::empty()
                .updated(detached(p(0), 8, 1))
                .updated(detached(p(2), 1, 1))
        };

        let a = left().merge(right());
        let b = right().merge(left());
        for partition in [p(0), p(1), p(2)] {
            assert_eq!(a.offset(&partition), b.offset(&partition));
        }
        assert_eq!(a.offset(&p(0)), Some(8));
        assert_eq!(a.len(), 4);
        assert_eq!(a.partitions(), vec![p(0), p(1), p(2)]);
    }

    #[test]
    fn test_newer_generation_replaces_older() {
        let batch = CommitBatch::empty()
            .updated(detached(p(0), 50, 1))
            .updated(detached(p(0), 10, 2))
            .updated(detached(p(0), 99, 1));

        assert_eq!(batch.offset(&p(0)), Some(10));
        assert_eq!(batch.generation(&p(0)), Some(2));
    }

    #[test]
    fn test_take_partitions_splits_batch() {
        let mut batch = CommitBatch::empty()
            .updated(detached(p(0), 1, 1))
            .updated(detached(p(0), 2, 1))
            .updated(detached(p(1), 7, 1));

        let taken = batch.take_partitions(&[p(0)]);
        assert_eq!(taken.offset(&p(0)), Some(2));
        assert_eq!(batch.partitions(), vec![p(1)]);
        assert!(!batch.is_empty());

        let rest = batch.take_partitions(&[p(1)]);
        assert_eq!(rest.offset(&p(1)), Some(7));
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_empty_commit_makes_no_broker_call() {
        let broker = InMemoryBroker::new();
        let batch = CommitBatch::empty();
        assert_eq!(batch.commit().await.unwrap().len(), 0);
        assert!(broker.commit_log().is_empty());
    }

    #[tokio::test]
    async fn test_commit_issues_single_multi_partition_call() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 2);
        let (consumer, client) = assigned_consumer(&broker, &[p(0), p(1)]).await;
        let generation = consumer.generation(&p(0)).unwrap();

        let batch = CommitBatch::empty()
            .updated(CommitHandle::new(p(0), 4, generation, Arc::downgrade(&client)))
            .updated(CommitHandle::new(p(1), 9, generation, Arc::downgrade(&client)))
            .updated(CommitHandle::new(p(0), 2, generation, Arc::downgrade(&client)));

        let committed = batch.commit().await.unwrap();
        assert_eq!(committed[&p(0)], 5);
        assert_eq!(committed[&p(1)], 10);
        assert_eq!(broker.commit_log().len(), 1);
        assert_eq!(broker.committed("group", &p(0)), Some(5));
    }

    #[tokio::test]
    async fn test_partial_failure_reports_failed_partitions() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 2);
        let (consumer, client) = assigned_consumer(&broker, &[p(0), p(1)]).await;
        let generation = consumer.generation(&p(0)).unwrap();

        let batch = CommitBatch::empty()
            .updated(CommitHandle::new(p(0), 4, generation, Arc::downgrade(&client)))
            .updated(CommitHandle::new(p(1), 9, generation + 7, Arc::downgrade(&client)));

        let err = batch.commit().await.unwrap_err();
        assert_eq!(err.committed.get(&p(0)), Some(&5));
        assert_eq!(err.failed_partitions(), vec![p(1)]);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_commit_with_dropped_client_fails_every_partition() {
        let batch = CommitBatch::empty()
            .updated(detached(p(0), 1, 1))
            .updated(detached(p(1), 1, 1));
        let err = batch.commit().await.unwrap_err();
        assert_eq!(err.failed.len(), 2);
        assert!(err
            .failed
            .values()
            .all(|e| *e == CommitError::ConsumerClosed));
    }
}
