// Broker client seam: capability traits, rdkafka implementations and shared types
pub mod assignment;
pub mod client;
pub mod config;
pub mod consumer;
pub mod metadata;
pub mod producer;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

pub use assignment::PauseReason;
pub use client::{ConsumerClient, ListenerChain, ProducerClient, RebalanceListener};
pub use config::{ConsumerConfigBuilder, OffsetReset, ProducerConfigBuilder};
pub use consumer::KafkaConsumerClient;
pub use producer::KafkaProducerClient;
pub use types::{Partition, PartitionStart, ProducerRecord, Record, SendAck, StartPosition, Subscription};
