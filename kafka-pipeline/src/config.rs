use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::kafka::config::{ConsumerConfigBuilder, OffsetReset, ProducerConfigBuilder};
use crate::kafka::types::Subscription;
use crate::offset::CommitterSettings;
use crate::pipeline::PipelineSettings;
use crate::source::SourceSettings;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid KAFKA_CONSUMER_OFFSET_RESET: {0}")]
    OffsetReset(String),

    #[error("invalid KAFKA_CONSUMER_TOPIC_PATTERN: {0}")]
    TopicPattern(String),

    #[error("either KAFKA_CONSUMER_TOPIC or KAFKA_CONSUMER_TOPIC_PATTERN must be set")]
    NoTopics,
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "kafka-pipeline")]
    pub kafka_consumer_group: String,

    // Comma separated
    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    // Takes precedence over KAFKA_CONSUMER_TOPIC when set
    pub kafka_consumer_topic_pattern: Option<String>,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Kafka Producer configuration
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "1000000")]
    pub kafka_producer_max_message_bytes: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "snappy")]
    pub kafka_compression_codec: String,

    // Records are forwarded here when set, otherwise only processed
    pub output_topic: Option<String>,

    // Pipeline configuration
    #[envconfig(default = "16")]
    pub max_concurrent_partitions: usize,

    #[envconfig(default = "20")]
    pub commit_batch_size: usize,

    #[envconfig(default = "5000")]
    pub commit_batch_window_ms: u64,

    #[envconfig(default = "3")]
    pub commit_max_retries: u32,

    #[envconfig(default = "300000")]
    pub max_poll_interval_ms: u32,

    #[envconfig(default = "100")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "100")]
    pub source_buffer_size: usize,

    #[envconfig(default = "1")]
    pub processing_parallelism: usize,

    #[envconfig(default = "100")]
    pub producer_parallelism: usize,

    #[envconfig(default = "false")]
    pub partitioned: bool,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("MAX_CONCURRENT_PARTITIONS", self.max_concurrent_partitions),
            ("COMMIT_BATCH_SIZE", self.commit_batch_size),
            ("SOURCE_BUFFER_SIZE", self.source_buffer_size),
            ("PROCESSING_PARALLELISM", self.processing_parallelism),
            ("PRODUCER_PARALLELISM", self.producer_parallelism),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.commit_batch_window_ms == 0 {
            return Err(ConfigError::Zero("COMMIT_BATCH_WINDOW_MS"));
        }
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::Zero("POLL_TIMEOUT_MS"));
        }
        if self.max_poll_interval_ms == 0 {
            return Err(ConfigError::Zero("MAX_POLL_INTERVAL_MS"));
        }

        self.offset_reset()?;
        self.subscription()?;
        Ok(())
    }

    pub fn offset_reset(&self) -> Result<OffsetReset, ConfigError> {
        self.kafka_consumer_offset_reset
            .parse()
            .map_err(ConfigError::OffsetReset)
    }

    /// Topic list or pattern the binary subscribes to
    pub fn subscription(&self) -> Result<Subscription, ConfigError> {
        if let Some(pattern) = self.kafka_consumer_topic_pattern.as_deref() {
            if !pattern.trim().is_empty() {
                return Subscription::pattern(pattern.trim())
                    .map_err(|e| ConfigError::TopicPattern(e.to_string()));
            }
        }

        let topics: Vec<&str> = self
            .kafka_consumer_topic
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        Ok(Subscription::topics(topics))
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn commit_batch_window(&self) -> Duration {
        Duration::from_millis(self.commit_batch_window_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn consumer_config(&self) -> Result<ClientConfig, ConfigError> {
        Ok(
            ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
                .with_tls(self.kafka_tls)
                .with_offset_reset(self.offset_reset()?)
                .with_max_poll_interval_ms(self.max_poll_interval_ms)
                .with_cooperative_assignment()
                .build(),
        )
    }

    pub fn producer_config(&self) -> ClientConfig {
        ProducerConfigBuilder::new(&self.kafka_hosts)
            .with_tls(self.kafka_tls)
            .with_linger_ms(self.kafka_producer_linger_ms)
            .with_queue_limits(
                self.kafka_producer_queue_mib,
                self.kafka_producer_queue_messages,
            )
            .with_max_message_bytes(self.kafka_producer_max_message_bytes)
            .with_message_timeout_ms(self.kafka_message_timeout_ms)
            .with_compression_codec(&self.kafka_compression_codec)
            .build()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            source: SourceSettings {
                poll_timeout: self.poll_timeout(),
                buffer_size: self.source_buffer_size,
                ..Default::default()
            },
            committer: CommitterSettings {
                max_batch: self.commit_batch_size,
                max_interval: self.commit_batch_window(),
                max_retries: self.commit_max_retries,
                ..Default::default()
            },
            processing_parallelism: self.processing_parallelism,
            producer_parallelism: self.producer_parallelism,
            max_concurrent_partitions: self.max_concurrent_partitions,
            ..Default::default()
        }
    }
}
