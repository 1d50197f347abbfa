//! Producing sink with a pass-through value.
//!
//! Every message carries a value of the caller's choosing, typically the
//! commit handle of the consumed record it was derived from. The value is
//! handed back untouched once the broker has acknowledged the send, so the
//! caller can commit the source offset only after the output is durable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, Stream, StreamExt};
use tracing::{error, warn};

use crate::error::SendError;
use crate::kafka::client::ProducerClient;
use crate::kafka::types::{ProducerRecord, SendAck};
use crate::metrics::PipelineMetrics;
use crate::metrics_consts::{RECORDS_SENT_COUNTER, SEND_DURATION_HISTOGRAM, SEND_ERRORS_COUNTER};

/// What to send for one upstream element
#[derive(Debug)]
pub enum ProducerMessage<P> {
    Single { record: ProducerRecord, pass_through: P },
    Multi { records: Vec<ProducerRecord>, pass_through: P },
    /// Send nothing, only forward the value
    PassThrough(P),
}

impl<P> ProducerMessage<P> {
    pub fn single(record: ProducerRecord, pass_through: P) -> Self {
        Self::Single {
            record,
            pass_through,
        }
    }

    pub fn multi(records: Vec<ProducerRecord>, pass_through: P) -> Self {
        Self::Multi {
            records,
            pass_through,
        }
    }

    pub fn pass_through(pass_through: P) -> Self {
        Self::PassThrough(pass_through)
    }

    pub fn record_count(&self) -> usize {
        match self {
            Self::Single { .. } => 1,
            Self::Multi { records, .. } => records.len(),
            Self::PassThrough(_) => 0,
        }
    }
}

/// Acknowledgements for one message, in submission order, plus its value
#[derive(Debug)]
pub struct SendResult<P> {
    pub acks: Vec<SendAck>,
    pub pass_through: P,
}

struct SinkInner {
    producer: Arc<dyn ProducerClient>,
    terminated: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

impl SinkInner {
    fn observe(&self, result: &Result<SendAck, SendError>, started: Instant) {
        metrics::histogram!(SEND_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());
        match result {
            Ok(_) => {
                metrics::counter!(RECORDS_SENT_COUNTER).increment(1);
                self.metrics.record_sent();
            }
            Err(e) => {
                metrics::counter!(SEND_ERRORS_COUNTER, "error_type" => e.error_type()).increment(1);
                self.metrics.send_failure();
                if e.is_fatal() {
                    if !self.terminated.swap(true, Ordering::SeqCst) {
                        error!(error = %e, "Fatal send error, terminating sink");
                    }
                } else {
                    warn!(error = %e, "Send failed");
                }
            }
        }
    }
}

/// Sends records through a [`ProducerClient`]. Cheap to clone.
#[derive(Clone)]
pub struct PushSink {
    inner: Arc<SinkInner>,
}

impl PushSink {
    pub fn new(producer: Arc<dyn ProducerClient>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                producer,
                terminated: AtomicBool::new(false),
                metrics: Arc::new(PipelineMetrics::new()),
            }),
        }
    }

    /// Share counters with an enclosing pipeline
    pub fn with_metrics(self, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                producer: self.inner.producer.clone(),
                terminated: AtomicBool::new(self.is_terminated()),
                metrics,
            }),
        }
    }

    /// True once a fatal error was seen. Every later send fails.
    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Send one record and hand back `pass_through` with its acknowledgement
    pub async fn send<P>(&self, record: ProducerRecord, pass_through: P) -> Result<(SendAck, P), SendError> {
        let ack = self.enqueue_record(record).await?;
        Ok((ack, pass_through))
    }

    fn enqueue_record(&self, record: ProducerRecord) -> BoxFuture<'static, Result<SendAck, SendError>> {
        if self.is_terminated() {
            return futures::future::ready(Err(SendError::SinkTerminated)).boxed();
        }
        let started = Instant::now();
        let delivery = self.inner.producer.enqueue(record);
        let inner = self.inner.clone();
        async move {
            let result = delivery.await;
            inner.observe(&result, started);
            result
        }
        .boxed()
    }

    /// Hand a message to the producer now and return a future for its
    /// acknowledgements.
    ///
    /// Records are queued before this returns, so messages enqueued one after
    /// another keep their order on each partition no matter how their
    /// futures are awaited.
    pub fn enqueue<P>(&self, message: ProducerMessage<P>) -> BoxFuture<'static, Result<SendResult<P>, SendError>>
    where
        P: Send + 'static,
    {
        match message {
            ProducerMessage::Single {
                record,
                pass_through,
            } => {
                let delivery = self.enqueue_record(record);
                async move {
                    let ack = delivery.await?;
                    Ok(SendResult {
                        acks: vec![ack],
                        pass_through,
                    })
                }
                .boxed()
            }
            ProducerMessage::Multi {
                records,
                pass_through,
            } => {
                let deliveries: Vec<_> = records.into_iter().map(|r| self.enqueue_record(r)).collect();
                async move {
                    let acks = join_all(deliveries)
                        .await
                        .into_iter()
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(SendResult { acks, pass_through })
                }
                .boxed()
            }
            ProducerMessage::PassThrough(pass_through) => {
                if self.is_terminated() {
                    return futures::future::ready(Err(SendError::SinkTerminated)).boxed();
                }
                futures::future::ready(Ok(SendResult {
                    acks: Vec::new(),
                    pass_through,
                }))
                .boxed()
            }
        }
    }

    /// Send every message of `messages` with up to `parallelism` in flight.
    /// Results come out in input order.
    pub fn flow<S, P>(
        &self,
        messages: S,
        parallelism: usize,
    ) -> impl Stream<Item = Result<SendResult<P>, SendError>> + Send + 'static
    where
        S: Stream<Item = ProducerMessage<P>> + Send + 'static,
        P: Send + 'static,
    {
        let sink = self.clone();
        messages
            .map(move |message| sink.enqueue(message))
            .buffered(parallelism.max(1))
    }

    /// Wait for everything queued in the producer to be delivered
    pub async fn flush(&self, timeout: Duration) -> Result<(), SendError> {
        self.inner.producer.flush(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::kafka::test_utils::InMemoryBroker;

    fn sink(broker: &InMemoryBroker) -> PushSink {
        PushSink::new(Arc::new(broker.producer()))
    }

    #[tokio::test]
    async fn test_send_returns_pass_through_with_ack() {
        let broker = InMemoryBroker::new();
        broker.create_topic("out", 1);
        let sink = sink(&broker);

        let (ack, token) = sink
            .send(ProducerRecord::new("out").with_payload("hello"), "token")
            .await
            .unwrap();

        assert_eq!(token, "token");
        assert_eq!(ack.partition.topic(), "out");
        assert_eq!(ack.offset, 0);
        assert_eq!(broker.records("out", 0)[0].payload_str(), Some("hello"));
    }

    #[tokio::test]
    async fn test_multi_and_pass_through_messages() {
        let broker = InMemoryBroker::new();
        broker.create_topic("out", 1);
        let sink = sink(&broker);

        let result = sink
            .enqueue(ProducerMessage::multi(
                vec![
                    ProducerRecord::new("out").with_payload("a"),
                    ProducerRecord::new("out").with_payload("b"),
                ],
                7,
            ))
            .await
            .unwrap();
        assert_eq!(result.pass_through, 7);
        assert_eq!(result.acks.iter().map(|a| a.offset).collect::<Vec<_>>(), vec![0, 1]);

        let skipped = sink.enqueue(ProducerMessage::pass_through(8)).await.unwrap();
        assert!(skipped.acks.is_empty());
        assert_eq!(skipped.pass_through, 8);
        assert_eq!(broker.records("out", 0).len(), 2);
    }

    #[tokio::test]
    async fn test_record_too_large_does_not_terminate_sink() {
        let broker = InMemoryBroker::new();
        broker.create_topic("out", 1);
        broker.set_max_message_bytes(4);
        let sink = sink(&broker);

        let err = sink
            .send(ProducerRecord::new("out").with_payload("too large"), ())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::RecordTooLarge { max: 4, .. }));
        assert!(!sink.is_terminated());

        sink.send(ProducerRecord::new("out").with_payload("ok"), ()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_error_terminates_sink() {
        let broker = InMemoryBroker::new();
        broker.create_topic("out", 1);
        broker.fail_next_send(SendError::Fatal("topic authorization failed".into()));
        let sink = sink(&broker);

        let err = sink
            .send(ProducerRecord::new("out").with_payload("a"), ())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Fatal(_)));
        assert!(sink.is_terminated());

        let err = sink
            .send(ProducerRecord::new("out").with_payload("b"), ())
            .await
            .unwrap_err();
        assert_eq!(err, SendError::SinkTerminated);
        assert!(broker.records("out", 0).is_empty());
    }

    #[tokio::test]
    async fn test_flow_keeps_submission_order() {
        let broker = InMemoryBroker::new();
        broker.create_topic("out", 1);
        let producer = broker.producer().with_ack_delay(Duration::from_millis(5));
        let sink = PushSink::new(Arc::new(producer));

        let messages = futures::stream::iter((0..20).map(|i| {
            ProducerMessage::single(ProducerRecord::new("out").with_payload(i.to_string()), i)
        }));
        let results: Vec<_> = sink.flow(messages, 8).collect().await;

        let pass_through: Vec<i32> = results.iter().map(|r| r.as_ref().unwrap().pass_through).collect();
        assert_eq!(pass_through, (0..20).collect::<Vec<_>>());
        let offsets: Vec<i64> = results.iter().map(|r| r.as_ref().unwrap().acks[0].offset).collect();
        assert_eq!(offsets, (0..20).collect::<Vec<_>>());
    }
}
