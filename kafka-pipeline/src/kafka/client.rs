//! Capabilities the pipeline needs from a broker client.
//!
//! The pipeline only ever talks to the broker through these traits. The
//! rdkafka backed implementations live in `consumer` and `producer`, the
//! in-memory ones in `test_utils`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::{BrokerError, CommitError, SendError};
use crate::kafka::assignment::PauseReason;
use crate::kafka::types::{
    CommitPosition, Partition, PartitionStart, ProducerRecord, Record, SendAck, Subscription,
};

/// Per-partition outcome of a commit call. `Ok` carries the committed next offset.
pub type CommitResults = HashMap<Partition, Result<i64, CommitError>>;

/// Resolves once the broker confirms (or rejects) a produced record
pub type DeliveryFuture = BoxFuture<'static, Result<SendAck, SendError>>;

/// Rebalance notifications from a group managed consumer.
///
/// Both callbacks are awaited by the client before the rebalance handshake
/// continues, so work done in `on_partitions_revoked` (draining, committing)
/// completes while the partitions are still owned.
#[async_trait]
pub trait RebalanceListener: Send + Sync {
    async fn on_partitions_assigned(&self, _partitions: &[Partition]) {}

    async fn on_partitions_revoked(&self, _partitions: &[Partition]) {}
}

/// Invokes several listeners in registration order
#[derive(Default, Clone)]
pub struct ListenerChain {
    listeners: Vec<Arc<dyn RebalanceListener>>,
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn extend<I>(mut self, listeners: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn RebalanceListener>>,
    {
        self.listeners.extend(listeners);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[async_trait]
impl RebalanceListener for ListenerChain {
    async fn on_partitions_assigned(&self, partitions: &[Partition]) {
        for listener in &self.listeners {
            listener.on_partitions_assigned(partitions).await;
        }
    }

    async fn on_partitions_revoked(&self, partitions: &[Partition]) {
        for listener in &self.listeners {
            listener.on_partitions_revoked(partitions).await;
        }
    }
}

#[async_trait]
pub trait ConsumerClient: Send + Sync + 'static {
    /// Join the consumer group for a topic list or pattern. Rebalance
    /// callbacks are delivered to `listener` from within `poll`.
    fn subscribe(
        &self,
        subscription: &Subscription,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError>;

    /// Read a fixed set of partitions without group management
    async fn assign(&self, partitions: &[PartitionStart]) -> Result<(), BrokerError>;

    /// Fetch up to `max_records` records. Calling with `max_records == 0`
    /// keeps the session alive without consuming anything.
    async fn poll(&self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, BrokerError>;

    /// Commit positions for several partitions in one call
    async fn commit(&self, offsets: HashMap<Partition, CommitPosition>) -> CommitResults;

    /// Stop fetching `partitions` on behalf of `reason`
    fn pause(&self, partitions: &[Partition], reason: PauseReason) -> Result<(), BrokerError>;

    /// Release the pause held by `reason`. A partition fetches again only
    /// once no other reason holds it paused.
    fn resume(&self, partitions: &[Partition], reason: PauseReason) -> Result<(), BrokerError>;

    /// Move the fetch position of an owned partition. Records already
    /// buffered for it are discarded.
    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError>;

    fn assignment(&self) -> Vec<Partition>;

    /// Generation under which `partition` is currently owned
    fn generation(&self, partition: &Partition) -> Option<u64>;

    /// Low and high watermarks of a partition
    async fn fetch_watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<(i64, i64), BrokerError>;

    /// Earliest offset whose timestamp is at or after `timestamp_millis`,
    /// or the high watermark when there is none
    async fn offsets_for_timestamp(
        &self,
        partitions: &[Partition],
        timestamp_millis: i64,
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, BrokerError>;

    fn metrics(&self) -> HashMap<String, f64>;

    /// Leave the group and release the rebalance listener
    fn close(&self);
}

#[async_trait]
pub trait ProducerClient: Send + Sync + 'static {
    /// Hand a record to the client. The record is queued before this returns,
    /// so the call order fixes the per-partition submission order.
    fn enqueue(&self, record: ProducerRecord) -> DeliveryFuture;

    async fn flush(&self, timeout: Duration) -> Result<(), SendError>;

    fn metrics(&self) -> HashMap<String, f64>;
}
