use std::fmt;
use std::str::FromStr;

use rdkafka::ClientConfig;

/// Where a group consumer starts when it has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(Self::Earliest),
            "latest" => Ok(Self::Latest),
            other => Err(format!(
                "unknown offset reset policy '{other}', expected earliest or latest"
            )),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings shared by consumers and producers
fn client_config(bootstrap_servers: &str, tls: bool) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", bootstrap_servers)
        .set("statistics.interval.ms", "10000");
    apply_tls(&mut config, tls);
    config
}

fn apply_tls(config: &mut ClientConfig, tls: bool) {
    if tls {
        config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    }
}

/// Builds the rdkafka configuration of a pipeline consumer.
///
/// The pipeline commits every offset itself, so neither automatic commits
/// nor the automatic offset store can be switched back on through the
/// typed methods. `set` remains as an escape hatch.
pub struct ConsumerConfigBuilder {
    inner: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut inner = client_config(bootstrap_servers, false);
        inner
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "45000")
            .set("max.poll.interval.ms", "300000");
        Self { inner }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        apply_tls(&mut self.inner, enabled);
        self
    }

    pub fn with_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.inner.set("auto.offset.reset", policy.as_str());
        self
    }

    /// Longest gap between polls before the group evicts this member
    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.inner.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Cooperative rebalancing keeps retained partitions (and their commit
    /// handles) valid across a rebalance
    pub fn with_cooperative_assignment(mut self) -> Self {
        self.inner
            .set("partition.assignment.strategy", "cooperative-sticky");
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.inner.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.inner
    }
}

/// Builds the rdkafka configuration of the output producer
pub struct ProducerConfigBuilder {
    inner: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut inner = client_config(bootstrap_servers, false);
        inner
            .set("linger.ms", "20")
            .set("message.timeout.ms", "20000")
            .set("compression.codec", "snappy")
            .set("message.max.bytes", "1000000");
        Self { inner }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        apply_tls(&mut self.inner, enabled);
        self
    }

    pub fn with_linger_ms(mut self, ms: u32) -> Self {
        self.inner.set("linger.ms", ms.to_string());
        self
    }

    /// Time a record may wait for delivery, retries included
    pub fn with_message_timeout_ms(mut self, ms: u32) -> Self {
        self.inner.set("message.timeout.ms", ms.to_string());
        self
    }

    pub fn with_compression_codec(mut self, codec: &str) -> Self {
        self.inner.set("compression.codec", codec);
        self
    }

    /// Bound the local send queue by size and by record count
    pub fn with_queue_limits(mut self, max_mib: u32, max_messages: u32) -> Self {
        let kbytes = max_mib.saturating_mul(1024);
        self.inner
            .set("queue.buffering.max.kbytes", kbytes.to_string())
            .set("queue.buffering.max.messages", max_messages.to_string());
        self
    }

    /// Also read back by the producer client to classify oversized records
    pub fn with_max_message_bytes(mut self, bytes: u32) -> Self {
        self.inner.set("message.max.bytes", bytes.to_string());
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.inner.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults_disable_auto_commit() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group").build();
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("group.id"), Some("group"));
    }

    #[test]
    fn test_consumer_overrides() {
        let config = ConsumerConfigBuilder::new("localhost:9092", "group")
            .with_offset_reset(OffsetReset::Latest)
            .with_max_poll_interval_ms(10_000)
            .with_tls(true)
            .build();
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("max.poll.interval.ms"), Some("10000"));
        assert_eq!(config.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_producer_queue_limits() {
        let config = ProducerConfigBuilder::new("localhost:9092")
            .with_queue_limits(400, 1000)
            .with_tls(false)
            .build();
        assert_eq!(config.get("queue.buffering.max.kbytes"), Some("409600"));
        assert_eq!(config.get("queue.buffering.max.messages"), Some("1000"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_offset_reset_parsing() {
        assert_eq!("Earliest".parse::<OffsetReset>(), Ok(OffsetReset::Earliest));
        assert_eq!("latest".parse::<OffsetReset>(), Ok(OffsetReset::Latest));
        assert!("smallest".parse::<OffsetReset>().is_err());
    }
}
