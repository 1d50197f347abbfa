//! Error taxonomy for the pipeline.
//!
//! All errors are `Clone` because a pipeline's terminal result is cached and
//! handed to every caller of `shutdown`/`drain_and_shutdown`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::kafka::types::Partition;

/// Errors surfaced by the broker client for non-commit operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("consumer evicted from group: {0}")]
    ConsumerEvicted(String),

    #[error("transient broker error: {0}")]
    Transient(String),

    #[error("fatal broker error: {0}")]
    Fatal(String),

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    #[error("partition {0} is not assigned to this consumer")]
    NotAssigned(Partition),

    #[error("consumer is closed")]
    Closed,
}

impl BrokerError {
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ConsumerEvicted(_) => "consumer_evicted",
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
            Self::InvalidSubscription(_) => "invalid_subscription",
            Self::NotAssigned(_) => "not_assigned",
            Self::Closed => "closed",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// The group generation changed since the handle was issued
    #[error("stale generation for {partition}: handle generation {handle_generation}, current {current_generation:?}")]
    StaleGeneration {
        partition: Partition,
        handle_generation: u64,
        current_generation: Option<u64>,
    },

    #[error("transient commit failure: {0}")]
    Transient(String),

    #[error("consumer is closed")]
    ConsumerClosed,
}

impl CommitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::StaleGeneration { .. } => "stale_generation",
            Self::Transient(_) => "transient",
            Self::ConsumerClosed => "consumer_closed",
        }
    }
}

/// Partial failure of a multi-partition commit. Partitions in `committed`
/// are durable; only those in `failed` need another attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("commit failed for {} of {} partitions", .failed.len(), .failed.len() + .committed.len())]
pub struct BatchCommitError {
    pub committed: HashMap<Partition, i64>,
    pub failed: HashMap<Partition, CommitError>,
}

impl BatchCommitError {
    pub fn failed_partitions(&self) -> Vec<Partition> {
        let mut partitions: Vec<_> = self.failed.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    /// True when every failure can be retried
    pub fn is_retryable(&self) -> bool {
        self.failed.values().all(CommitError::is_retryable)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),

    #[error("record of {size} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    #[error("fatal send failure: {0}")]
    Fatal(String),

    #[error("sink terminated after a fatal error")]
    SinkTerminated,
}

impl SendError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::SinkTerminated)
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::RecordTooLarge { .. } => "record_too_large",
            Self::Fatal(_) => "fatal",
            Self::SinkTerminated => "sink_terminated",
        }
    }
}

/// A user processing failure, kept with its full cause chain
#[derive(Clone)]
pub struct ProcessingError(Arc<anyhow::Error>);

impl ProcessingError {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl fmt::Debug for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for ProcessingError {}

/// Terminal failure of a pipeline
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("consumer evicted from group: {0}")]
    ConsumerEvicted(String),

    #[error("broker error: {0}")]
    Broker(BrokerError),

    #[error("commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("batch commit failed: {0}")]
    BatchCommit(#[from] BatchCommitError),

    #[error("send failed: {0}")]
    Send(#[from] SendError),

    #[error("record processing failed at {partition} offset {offset}: {source}")]
    Processing {
        partition: Partition,
        offset: i64,
        source: ProcessingError,
    },

    #[error("pipeline stage {stage} panicked: {message}")]
    StagePanicked { stage: &'static str, message: String },
}

impl From<BrokerError> for PipelineError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ConsumerEvicted(reason) => Self::ConsumerEvicted(reason),
            other => Self::Broker(other),
        }
    }
}

impl PipelineError {
    pub fn processing(partition: Partition, offset: i64, error: anyhow::Error) -> Self {
        Self::Processing {
            partition,
            offset,
            source: ProcessingError::new(error),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ConsumerEvicted(_) => "consumer_evicted",
            Self::Broker(e) => e.error_type(),
            Self::Commit(e) => e.error_type(),
            Self::BatchCommit(_) => "batch_commit",
            Self::Send(e) => e.error_type(),
            Self::Processing { .. } => "processing",
            Self::StagePanicked { .. } => "stage_panicked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_evicted_broker_error_maps_to_pipeline_eviction() {
        let err: PipelineError = BrokerError::ConsumerEvicted("max poll".into()).into();
        assert!(matches!(err, PipelineError::ConsumerEvicted(_)));

        let err: PipelineError = BrokerError::Fatal("auth".into()).into();
        assert!(matches!(err, PipelineError::Broker(BrokerError::Fatal(_))));
    }

    #[test]
    fn test_processing_error_keeps_chain() {
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("root cause"));
        let err = inner.context("decoding event").unwrap_err();
        let err = PipelineError::processing(Partition::new("events", 2), 10, err);
        let message = err.to_string();
        assert!(message.contains("events:2"));
        assert!(message.contains("decoding event: root cause"));
    }

    #[test]
    fn test_batch_commit_error_retryable() {
        let mut failed = HashMap::new();
        failed.insert(
            Partition::new("t", 1),
            CommitError::Transient("timeout".into()),
        );
        let err = BatchCommitError {
            committed: HashMap::from([(Partition::new("t", 0), 5)]),
            failed,
        };
        assert!(err.is_retryable());
        assert_eq!(err.failed_partitions(), vec![Partition::new("t", 1)]);
        assert_eq!(err.to_string(), "commit failed for 1 of 2 partitions");
    }
}
