//! Offset lookups against the broker, outside of any running pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::debug;

use crate::error::BrokerError;
use crate::kafka::client::ConsumerClient;
use crate::kafka::types::Partition;

pub const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MetadataClient {
    client: Arc<dyn ConsumerClient>,
    timeout: Duration,
}

impl MetadataClient {
    pub fn new(client: Arc<dyn ConsumerClient>) -> Self {
        Self {
            client,
            timeout: DEFAULT_METADATA_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// First available offset of each partition
    pub async fn beginning_offsets(
        &self,
        partitions: &[Partition],
    ) -> Result<HashMap<Partition, i64>, BrokerError> {
        let watermarks = self.watermarks(partitions).await?;
        Ok(watermarks
            .into_iter()
            .map(|(partition, (low, _))| (partition, low))
            .collect())
    }

    pub async fn beginning_offset(&self, partition: &Partition) -> Result<i64, BrokerError> {
        let (low, _) = self.client.fetch_watermarks(partition, self.timeout).await?;
        Ok(low)
    }

    /// Offset the next produced record of each partition will get
    pub async fn end_offsets(
        &self,
        partitions: &[Partition],
    ) -> Result<HashMap<Partition, i64>, BrokerError> {
        let watermarks = self.watermarks(partitions).await?;
        Ok(watermarks
            .into_iter()
            .map(|(partition, (_, high))| (partition, high))
            .collect())
    }

    /// Earliest offset at or after `timestamp_millis`. Partitions with no
    /// such record resolve to their end offset.
    pub async fn offsets_for_timestamp(
        &self,
        partitions: &[Partition],
        timestamp_millis: i64,
    ) -> Result<HashMap<Partition, i64>, BrokerError> {
        if partitions.is_empty() {
            return Ok(HashMap::new());
        }
        debug!(
            partitions = partitions.len(),
            timestamp_millis, "Resolving offsets for timestamp"
        );
        self.client
            .offsets_for_timestamp(partitions, timestamp_millis, self.timeout)
            .await
    }

    async fn watermarks(
        &self,
        partitions: &[Partition],
    ) -> Result<Vec<(Partition, (i64, i64))>, BrokerError> {
        try_join_all(partitions.iter().map(|partition| async move {
            let marks = self.client.fetch_watermarks(partition, self.timeout).await?;
            Ok::<_, BrokerError>((partition.clone(), marks))
        }))
        .await
    }
}
