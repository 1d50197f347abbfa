use std::collections::HashMap;
use std::sync::Weak;

use crate::error::CommitError;
use crate::kafka::client::ConsumerClient;
use crate::kafka::types::{CommitPosition, Partition, Record};

/// The commit point of one consumed record.
///
/// A handle is not `Clone`: it is either committed (by value) or folded into
/// a [`CommitBatch`](crate::offset::CommitBatch). It holds the consumer only
/// weakly so a handle outliving its pipeline fails with `ConsumerClosed`
/// instead of keeping the client alive.
#[derive(Debug)]
pub struct CommitHandle {
    partition: Partition,
    offset: i64,
    generation: u64,
    client: Weak<dyn ConsumerClient>,
}

impl CommitHandle {
    pub fn new(
        partition: Partition,
        offset: i64,
        generation: u64,
        client: Weak<dyn ConsumerClient>,
    ) -> Self {
        Self {
            partition,
            offset,
            generation,
            client,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Offset of the consumed record
    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// What gets written to the group: the offset after this record
    pub fn position(&self) -> CommitPosition {
        CommitPosition {
            next_offset: self.offset + 1,
            generation: self.generation,
        }
    }

    pub(crate) fn client(&self) -> &Weak<dyn ConsumerClient> {
        &self.client
    }

    /// Commit this single position. Returns the committed next offset.
    pub async fn commit(self) -> Result<i64, CommitError> {
        let client = self.client.upgrade().ok_or(CommitError::ConsumerClosed)?;
        let mut results = client
            .commit(HashMap::from([(self.partition.clone(), self.position())]))
            .await;
        results.remove(&self.partition).unwrap_or_else(|| {
            Err(CommitError::Transient(format!(
                "no commit result returned for {}",
                self.partition
            )))
        })
    }
}

/// A record paired with the handle that commits it
#[derive(Debug)]
pub struct CommittableRecord {
    pub record: Record,
    pub handle: CommitHandle,
}

impl CommittableRecord {
    pub fn new(record: Record, handle: CommitHandle) -> Self {
        Self { record, handle }
    }

    pub fn into_parts(self) -> (Record, CommitHandle) {
        (self.record, self.handle)
    }
}
