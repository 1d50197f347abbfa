use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext};
use tracing::{debug, error, info};

use crate::error::SendError;
use crate::kafka::client::{DeliveryFuture, ProducerClient};
use crate::kafka::types::{Partition, ProducerRecord, SendAck};

type SharedStats = Arc<Mutex<HashMap<String, f64>>>;

/// Keeps the latest producer statistics for metrics snapshots
struct ProducerContext {
    stats: SharedStats,
}

impl ClientContext for ProducerContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!("kafka_pipeline_producer_queue_depth").set(stats.msg_cnt as f64);
        metrics::gauge!("kafka_pipeline_producer_callback_queue_depth").set(stats.replyq as f64);

        let snapshot = HashMap::from([
            ("producer_queue_depth".to_string(), stats.msg_cnt as f64),
            ("producer_queue_bytes".to_string(), stats.msg_size as f64),
            ("producer_tx_requests".to_string(), stats.tx as f64),
            ("producer_tx_messages".to_string(), stats.txmsgs as f64),
        ]);
        match self.stats.lock() {
            Ok(mut stats) => *stats = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

/// Map a producer error the way the rest of the pipeline classifies them
pub fn classify_send_error(error: &KafkaError, size: usize, max: usize) -> SendError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => SendError::RecordTooLarge { size, max },
        Some(
            RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown,
        ) => SendError::Transient(error.to_string()),
        _ => SendError::Fatal(error.to_string()),
    }
}

/// [`ProducerClient`] backed by an rdkafka `FutureProducer`
pub struct KafkaProducerClient {
    producer: FutureProducer<ProducerContext>,
    stats: SharedStats,
    max_message_bytes: usize,
}

impl KafkaProducerClient {
    /// Create the producer and ping the cluster so a bad configuration fails
    /// at startup
    pub fn new(config: &ClientConfig) -> Result<Self, KafkaError> {
        debug!("rdkafka producer configuration: {:?}", config);
        let stats = SharedStats::default();
        let producer: FutureProducer<ProducerContext> = config.create_with_context(ProducerContext {
            stats: stats.clone(),
        })?;

        drop(producer.client().fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(Duration::from_secs(10)),
        )?);
        info!("Producer connected to Kafka brokers");

        let max_message_bytes = config
            .get("message.max.bytes")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000_000);
        Ok(Self {
            producer,
            stats,
            max_message_bytes,
        })
    }
}

#[async_trait]
impl ProducerClient for KafkaProducerClient {
    fn enqueue(&self, record: ProducerRecord) -> DeliveryFuture {
        let size = record.size_bytes();
        let max = self.max_message_bytes;
        let topic = record.topic().to_string();

        let mut headers = OwnedHeaders::new();
        for (key, value) in record.headers() {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_slice()),
            });
        }

        let mut future_record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&topic).headers(headers);
        if let Some(key) = record.key() {
            future_record = future_record.key(key);
        }
        if let Some(payload) = record.payload() {
            future_record = future_record.payload(payload);
        }
        if let Some(partition) = record.partition() {
            future_record = future_record.partition(partition);
        }
        if let Some(timestamp) = record.timestamp_millis() {
            future_record = future_record.timestamp(timestamp);
        }

        let delivery = match self.producer.send_result(future_record) {
            Ok(delivery) => delivery,
            Err((e, _)) => {
                error!(topic = %topic, error = %e, "Failed to enqueue record");
                return futures::future::ready(Err(classify_send_error(&e, size, max))).boxed();
            }
        };

        async move {
            match delivery.await {
                // Cancelled: the producer was dropped or timed out while retrying
                Err(_) => Err(SendError::Transient(
                    "delivery cancelled before acknowledgement".to_string(),
                )),
                Ok(Err((e, _))) => Err(classify_send_error(&e, size, max)),
                Ok(Ok((partition, offset))) => Ok(SendAck {
                    partition: Partition::new(topic, partition),
                    offset,
                }),
            }
        }
        .boxed()
    }

    async fn flush(&self, timeout: Duration) -> Result<(), SendError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| SendError::Fatal(format!("flush task failed: {e}")))?
            .map_err(|e| SendError::Transient(e.to_string()))
    }

    fn metrics(&self) -> HashMap<String, f64> {
        let mut snapshot = match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        snapshot.insert(
            "producer_in_flight".to_string(),
            self.producer.in_flight_count() as f64,
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_send_errors() {
        let too_large = KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge);
        assert!(matches!(
            classify_send_error(&too_large, 10, 4),
            SendError::RecordTooLarge { size: 10, max: 4 }
        ));

        let queue_full = KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull);
        assert!(matches!(
            classify_send_error(&queue_full, 10, 4),
            SendError::Transient(_)
        ));

        let denied = KafkaError::MessageProduction(RDKafkaErrorCode::TopicAuthorizationFailed);
        assert!(classify_send_error(&denied, 10, 4).is_fatal());
    }
}
