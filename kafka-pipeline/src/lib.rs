//! Kafka consume/produce pipelines with explicit offset management.
//!
//! Records are pulled from the broker, handed to user code together with a
//! commit handle, and their offsets committed in batches once processing (or
//! the downstream send) completed. Partition ownership is tracked per group
//! generation so handles that outlive a rebalance can never commit.
//!
//! ## Error logging (anyhow)
//!
//! Processor errors are kept with their full cause chain. When logging them
//! use `{e:#}` or `error = ?e` so root causes stay visible.

pub mod backoff;
pub mod config;
pub mod control;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod metrics_consts;
pub mod offset;
pub mod partition;
pub mod pipeline;
pub mod server;
pub mod sink;
pub mod source;

// Re-export commonly used types for convenience
pub use control::{PipelineControl, PipelineState, PipelineSummary};
pub use error::{BrokerError, CommitError, PipelineError, SendError};
pub use kafka::{
    ConsumerClient, Partition, PartitionStart, ProducerClient, ProducerRecord, Record,
    Subscription,
};
pub use offset::{CommitHandle, CommittableRecord};
pub use pipeline::{Pipeline, PipelineSettings, RecordProcessor, RecordTransformer};
pub use sink::{ProducerMessage, PushSink};
pub use source::{PullSource, SourceSettings};
