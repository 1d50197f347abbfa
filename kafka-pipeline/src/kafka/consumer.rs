use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::error::{BrokerError, CommitError};
use crate::kafka::assignment::{PartitionAssignment, PauseReason};
use crate::kafka::client::{CommitResults, ConsumerClient, RebalanceListener};
use crate::kafka::types::{
    CommitPosition, Partition, PartitionStart, Record, StartPosition, Subscription,
};
use crate::metrics_consts::{
    CONSUMER_CALLBACK_QUEUE_GAUGE, CONSUMER_ERRORS_COUNTER, REBALANCE_EMPTY_SKIPPED_COUNTER,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

thread_local! {
    // Set while a blocking poll runs on this thread. Rebalance callbacks can
    // only wait on async listeners from there.
    static IN_POLL: Cell<bool> = const { Cell::new(false) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements().into_iter().map(Partition::from).collect()
}

fn partition_list(partitions: &[Partition]) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for partition in partitions {
        tpl.add_partition(partition.topic(), partition.partition_number());
    }
    tpl
}

fn record_from(message: &BorrowedMessage<'_>) -> Record {
    Record::new(
        Partition::new(message.topic(), message.partition()),
        message.offset(),
        message.key().map(<[u8]>::to_vec),
        message.payload().map(<[u8]>::to_vec),
        message.timestamp().to_millis(),
    )
}

/// Map a consumer error to the pipeline taxonomy. `None` means the error is
/// informational and polling simply continues.
pub fn classify_consumer_error(error: &KafkaError) -> Option<BrokerError> {
    let (level, kind, mapped) = match error {
        KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => {
            ("info", "partition_eof", None)
        }
        KafkaError::MessageConsumption(RDKafkaErrorCode::PollExceeded)
        | KafkaError::Global(RDKafkaErrorCode::PollExceeded) => (
            "fatal",
            "max_poll_exceeded",
            Some(BrokerError::ConsumerEvicted(error.to_string())),
        ),
        KafkaError::MessageConsumptionFatal(_) => {
            ("fatal", "consumer", Some(BrokerError::Fatal(error.to_string())))
        }
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::TopicAuthorizationFailed | RDKafkaErrorCode::GroupAuthorizationFailed,
        )
        | KafkaError::Global(RDKafkaErrorCode::Authentication) => (
            "fatal",
            "authentication",
            Some(BrokerError::Fatal(error.to_string())),
        ),
        KafkaError::Canceled => ("info", "canceled", Some(BrokerError::Closed)),
        KafkaError::Global(RDKafkaErrorCode::AllBrokersDown) => (
            "warn",
            "all_brokers_down",
            Some(BrokerError::Transient(error.to_string())),
        ),
        KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure) => (
            "warn",
            "broker_transport",
            Some(BrokerError::Transient(error.to_string())),
        ),
        _ => ("warn", "consumer", Some(BrokerError::Transient(error.to_string()))),
    };

    metrics::counter!(CONSUMER_ERRORS_COUNTER, &[("level", level), ("error", kind)]).increment(1);
    mapped
}

/// rdkafka context that keeps [`PartitionAssignment`] in step with the group
/// and runs the registered [`RebalanceListener`] inside the rebalance
/// callbacks.
pub struct PipelineConsumerContext {
    /// Handle to the async runtime for awaiting listeners from the poll thread
    runtime: Handle,
    assignment: Arc<PartitionAssignment>,
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
    /// Records fetched beyond the last poll's budget
    overflow: Mutex<VecDeque<Record>>,
    evicted: Mutex<Option<String>>,
    stats: Mutex<HashMap<String, f64>>,
}

impl PipelineConsumerContext {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            assignment: Arc::new(PartitionAssignment::new()),
            listener: Mutex::new(None),
            overflow: Mutex::new(VecDeque::new()),
            evicted: Mutex::new(None),
            stats: Mutex::new(HashMap::new()),
        }
    }

    fn listener(&self) -> Option<Arc<dyn RebalanceListener>> {
        lock(&self.listener).clone()
    }

    fn await_listener<F: Future<Output = ()>>(&self, event: &str, fut: F) {
        if IN_POLL.with(Cell::get) {
            self.runtime.block_on(fut);
        } else {
            warn!(event, "Rebalance callback outside of poll, listener not invoked");
        }
    }

    fn take_overflow(&self, max_records: usize) -> Vec<Record> {
        let mut overflow = lock(&self.overflow);
        let take = overflow.len().min(max_records);
        overflow.drain(..take).collect()
    }

    fn stash(&self, record: Record) {
        lock(&self.overflow).push_back(record);
    }

    fn discard_overflow(&self, partitions: &[Partition]) {
        lock(&self.overflow).retain(|r| !partitions.contains(r.partition()));
    }

    fn check_evicted(&self) -> Result<(), BrokerError> {
        match lock(&self.evicted).clone() {
            Some(reason) => Err(BrokerError::ConsumerEvicted(reason)),
            None => Ok(()),
        }
    }

    fn mark_evicted(&self, reason: String) {
        error!(reason = %reason, "Consumer lost its group membership");
        lock(&self.evicted).get_or_insert(reason);
    }
}

impl ClientContext for PipelineConsumerContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!(CONSUMER_CALLBACK_QUEUE_GAUGE).set(stats.replyq as f64);

        let snapshot = HashMap::from([
            ("consumer_rx_messages".to_string(), stats.rxmsgs as f64),
            ("consumer_rx_responses".to_string(), stats.rx as f64),
            ("consumer_callback_queue_depth".to_string(), stats.replyq as f64),
        ]);
        *lock(&self.stats) = snapshot;
    }
}

impl ConsumerContext for PipelineConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Pre-rebalance event: {:?}", rebalance);

        match rebalance {
            Rebalance::Revoke(tpl) => {
                if tpl.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    metrics::counter!(REBALANCE_EMPTY_SKIPPED_COUNTER, "event_type" => "revoke")
                        .increment(1);
                    return;
                }

                let partitions = partitions_of(tpl);
                let lost = base_consumer.assignment_lost();
                info!(count = partitions.len(), lost, "Revoking partitions");

                // Listeners run while the partitions are still owned, so their
                // final commits carry a valid generation
                if let Some(listener) = self.listener() {
                    self.await_listener("revoke", listener.on_partitions_revoked(&partitions));
                }
                self.assignment.revoke(&partitions);
                self.discard_overflow(&partitions);

                if lost {
                    self.mark_evicted("partition assignment lost".to_string());
                }
            }
            Rebalance::Assign(tpl) => {
                debug!(count = tpl.count(), "Pre-rebalance assign event");
            }
            Rebalance::Error(e) => {
                self.mark_evicted(format!("rebalance error: {e}"));
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        info!("Post-rebalance event: {:?}", rebalance);

        if let Rebalance::Assign(tpl) = rebalance {
            if tpl.count() == 0 {
                debug!("Skipping empty assign rebalance");
                metrics::counter!(REBALANCE_EMPTY_SKIPPED_COUNTER, "event_type" => "assign")
                    .increment(1);
                return;
            }

            let partitions = partitions_of(tpl);
            let generation = self.assignment.assign(&partitions);
            info!(count = partitions.len(), generation, "Assigned partitions");

            if let Some(listener) = self.listener() {
                self.await_listener("assign", listener.on_partitions_assigned(&partitions));
            }
        }
    }

    fn commit_callback(&self, result: rdkafka::error::KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

type PipelineBaseConsumer = BaseConsumer<PipelineConsumerContext>;

async fn run_blocking<T, F>(f: F) -> Result<T, BrokerError>
where
    F: FnOnce() -> Result<T, BrokerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BrokerError::Fatal(format!("consumer task failed: {e}")))?
}

fn poll_blocking(
    consumer: &PipelineBaseConsumer,
    timeout: Duration,
    max_records: usize,
) -> Result<Vec<Record>, BrokerError> {
    let context = consumer.context();
    let mut records = context.take_overflow(max_records);

    IN_POLL.with(|flag| flag.set(true));
    let result = fill_from_consumer(consumer, &mut records, timeout, max_records);
    IN_POLL.with(|flag| flag.set(false));
    result?;

    context.check_evicted()?;
    // Drop anything fetched for partitions revoked during this poll
    records.retain(|r| context.assignment.is_owned(r.partition()));
    Ok(records)
}

fn fill_from_consumer(
    consumer: &PipelineBaseConsumer,
    records: &mut Vec<Record>,
    timeout: Duration,
    max_records: usize,
) -> Result<(), BrokerError> {
    let context = consumer.context();
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        // Wait only for the first record, then take what is already buffered
        let wait = if records.is_empty() && max_records > 0 {
            remaining
        } else {
            Duration::ZERO
        };

        match consumer.poll(wait) {
            Some(Ok(message)) => {
                let record = record_from(&message);
                if records.len() < max_records {
                    records.push(record);
                } else {
                    context.stash(record);
                    return Ok(());
                }
            }
            Some(Err(e)) => match classify_consumer_error(&e) {
                None => continue,
                Some(err @ BrokerError::Transient(_)) if !records.is_empty() => {
                    warn!(error = %err, "Consumer error after fetching records, returning partial batch");
                    return Ok(());
                }
                Some(err) => return Err(err),
            },
            None => {
                if !records.is_empty() || remaining.is_zero() || max_records == 0 {
                    return Ok(());
                }
            }
        }
    }
}

/// [`ConsumerClient`] backed by an rdkafka `BaseConsumer`.
///
/// Every librdkafka call that can block runs on the blocking thread pool.
/// Rebalance callbacks fire from within `poll` on that pool, which is what
/// lets them wait for async listeners.
pub struct KafkaConsumerClient {
    consumer: Arc<PipelineBaseConsumer>,
}

impl KafkaConsumerClient {
    /// Create the consumer and ping the cluster. Must be called from within a
    /// tokio runtime.
    pub fn new(config: &ClientConfig) -> Result<Self, KafkaError> {
        debug!("rdkafka consumer configuration: {:?}", config);
        let context = PipelineConsumerContext::new(Handle::current());
        let consumer: PipelineBaseConsumer = config.create_with_context(context)?;

        drop(consumer.fetch_metadata(
            Some("__consumer_offsets"),
            Timeout::After(METADATA_TIMEOUT),
        )?);
        info!("Consumer connected to Kafka brokers");

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    fn context(&self) -> &PipelineConsumerContext {
        self.consumer.context()
    }

    fn assignment_state(&self) -> &PartitionAssignment {
        &self.context().assignment
    }

    fn commit_error(&self, partition: &Partition, generation: u64, error: &KafkaError) -> CommitError {
        match error.rdkafka_error_code() {
            // The group moved on while the commit was in flight
            Some(
                RDKafkaErrorCode::IllegalGeneration
                | RDKafkaErrorCode::UnknownMemberId
                | RDKafkaErrorCode::RebalanceInProgress,
            ) => CommitError::StaleGeneration {
                partition: partition.clone(),
                handle_generation: generation,
                current_generation: self.assignment_state().generation_of(partition),
            },
            _ if matches!(error, KafkaError::Canceled) => CommitError::ConsumerClosed,
            _ => CommitError::Transient(error.to_string()),
        }
    }
}

fn resolve_starts(
    consumer: &PipelineBaseConsumer,
    starts: &[PartitionStart],
) -> Result<TopicPartitionList, BrokerError> {
    let mut tpl = TopicPartitionList::new();
    let mut timestamps = TopicPartitionList::new();

    for start in starts {
        let (topic, number) = (start.partition.topic(), start.partition.partition_number());
        let result = match start.start {
            StartPosition::Committed => tpl.add_partition_offset(topic, number, Offset::Stored),
            StartPosition::Offset(offset) => {
                tpl.add_partition_offset(topic, number, Offset::Offset(offset))
            }
            StartPosition::Timestamp(ts) => {
                timestamps.add_partition_offset(topic, number, Offset::Offset(ts))
            }
        };
        result.map_err(|e| BrokerError::InvalidSubscription(e.to_string()))?;
    }

    if timestamps.count() > 0 {
        let resolved = consumer
            .offsets_for_times(timestamps, Timeout::After(METADATA_TIMEOUT))
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        for elem in resolved.elements() {
            // No record at or after the timestamp: start at the end
            let offset = match elem.offset() {
                Offset::Offset(offset) => Offset::Offset(offset),
                _ => Offset::End,
            };
            tpl.add_partition_offset(elem.topic(), elem.partition(), offset)
                .map_err(|e| BrokerError::InvalidSubscription(e.to_string()))?;
        }
    }

    Ok(tpl)
}

#[async_trait]
impl ConsumerClient for KafkaConsumerClient {
    fn subscribe(
        &self,
        subscription: &Subscription,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        let topics: Vec<String> = match subscription {
            Subscription::Topics(topics) => topics.clone(),
            // librdkafka treats subscriptions starting with '^' as regexes
            Subscription::Pattern(regex) => {
                let pattern = regex.as_str();
                if pattern.starts_with('^') {
                    vec![pattern.to_string()]
                } else {
                    vec![format!("^{pattern}")]
                }
            }
            Subscription::Assignment(_) => {
                return Err(BrokerError::InvalidSubscription(
                    "manual assignments must use assign".to_string(),
                ))
            }
        };

        *lock(&self.context().listener) = Some(listener);
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::InvalidSubscription(e.to_string()))?;
        info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }

    async fn assign(&self, partitions: &[PartitionStart]) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let starts = partitions.to_vec();
        run_blocking(move || {
            let tpl = resolve_starts(&consumer, &starts)?;
            consumer
                .assign(&tpl)
                .map_err(|e| BrokerError::Fatal(e.to_string()))?;
            let owned: Vec<Partition> = starts.into_iter().map(|s| s.partition).collect();
            let generation = consumer.context().assignment.assign(&owned);
            info!(count = owned.len(), generation, "Assigned partitions manually");
            Ok(())
        })
        .await
    }

    async fn poll(&self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, BrokerError> {
        let consumer = self.consumer.clone();
        run_blocking(move || poll_blocking(&consumer, timeout, max_records)).await
    }

    async fn commit(&self, offsets: HashMap<Partition, CommitPosition>) -> CommitResults {
        let mut results = CommitResults::with_capacity(offsets.len());
        let mut tpl = TopicPartitionList::new();
        let mut pending = Vec::new();
        let mut generations = HashMap::new();

        for (partition, position) in offsets {
            if let Err(e) = self.assignment_state().validate(&partition, position.generation) {
                results.insert(partition, Err(e));
                continue;
            }
            if let Err(e) = tpl.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(position.next_offset),
            ) {
                results.insert(partition, Err(CommitError::Transient(e.to_string())));
                continue;
            }
            generations.insert(partition.clone(), position.generation);
            pending.push((partition, position.next_offset));
        }

        if pending.is_empty() {
            return results;
        }

        let consumer = self.consumer.clone();
        let outcome = tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => {
                for (partition, _) in pending {
                    results.insert(
                        partition,
                        Err(CommitError::Transient(format!("commit task failed: {e}"))),
                    );
                }
                return results;
            }
        };

        for (partition, next_offset) in pending {
            let result = match &failure {
                None => Ok(next_offset),
                Some(e) => Err(self.commit_error(&partition, generations[&partition], e)),
            };
            results.insert(partition, result);
        }
        results
    }

    fn pause(&self, partitions: &[Partition], reason: PauseReason) -> Result<(), BrokerError> {
        let assignment = self.assignment_state();
        let newly_paused: Vec<Partition> = partitions
            .iter()
            .filter(|p| assignment.pause(p, reason))
            .cloned()
            .collect();
        if newly_paused.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.consumer.pause(&partition_list(&newly_paused)) {
            for partition in &newly_paused {
                assignment.resume(partition, reason);
            }
            return Err(BrokerError::Transient(e.to_string()));
        }
        Ok(())
    }

    fn resume(&self, partitions: &[Partition], reason: PauseReason) -> Result<(), BrokerError> {
        let assignment = self.assignment_state();
        let released: Vec<Partition> = partitions
            .iter()
            .filter(|p| assignment.resume(p, reason))
            .cloned()
            .collect();
        if released.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.consumer.resume(&partition_list(&released)) {
            for partition in &released {
                assignment.pause(partition, reason);
            }
            return Err(BrokerError::Transient(e.to_string()));
        }
        Ok(())
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        if !self.assignment_state().is_owned(partition) {
            return Err(BrokerError::NotAssigned(partition.clone()));
        }
        self.consumer
            .seek(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(offset),
                Timeout::After(SEEK_TIMEOUT),
            )
            .map_err(|e| BrokerError::Transient(e.to_string()))?;
        // Buffered records are ahead of the new position
        self.context().discard_overflow(std::slice::from_ref(partition));
        Ok(())
    }

    fn assignment(&self) -> Vec<Partition> {
        self.assignment_state().partitions()
    }

    fn generation(&self, partition: &Partition) -> Option<u64> {
        self.assignment_state().generation_of(partition)
    }

    async fn fetch_watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<(i64, i64), BrokerError> {
        let consumer = self.consumer.clone();
        let partition = partition.clone();
        run_blocking(move || {
            consumer
                .fetch_watermarks(
                    partition.topic(),
                    partition.partition_number(),
                    Timeout::After(timeout),
                )
                .map_err(|e| BrokerError::Transient(e.to_string()))
        })
        .await
    }

    async fn offsets_for_timestamp(
        &self,
        partitions: &[Partition],
        timestamp_millis: i64,
        timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, BrokerError> {
        let consumer = self.consumer.clone();
        let partitions = partitions.to_vec();
        run_blocking(move || {
            let mut tpl = TopicPartitionList::new();
            for partition in &partitions {
                tpl.add_partition_offset(
                    partition.topic(),
                    partition.partition_number(),
                    Offset::Offset(timestamp_millis),
                )
                .map_err(|e| BrokerError::InvalidSubscription(e.to_string()))?;
            }

            let resolved = consumer
                .offsets_for_times(tpl, Timeout::After(timeout))
                .map_err(|e| BrokerError::Transient(e.to_string()))?;

            let mut offsets = HashMap::with_capacity(partitions.len());
            for elem in resolved.elements() {
                let partition = Partition::new(elem.topic(), elem.partition());
                let offset = match elem.offset() {
                    Offset::Offset(offset) => offset,
                    _ => {
                        consumer
                            .fetch_watermarks(
                                partition.topic(),
                                partition.partition_number(),
                                Timeout::After(timeout),
                            )
                            .map_err(|e| BrokerError::Transient(e.to_string()))?
                            .1
                    }
                };
                offsets.insert(partition, offset);
            }
            Ok(offsets)
        })
        .await
    }

    fn metrics(&self) -> HashMap<String, f64> {
        let context = self.context();
        let mut snapshot = lock(&context.stats).clone();
        snapshot.insert(
            "client_assigned_partitions".to_string(),
            context.assignment.len() as f64,
        );
        snapshot.insert(
            "client_paused_partitions".to_string(),
            context.assignment.paused().len() as f64,
        );
        snapshot.insert(
            "client_buffered_records".to_string(),
            lock(&context.overflow).len() as f64,
        );
        snapshot
    }

    fn close(&self) {
        let context = self.context();
        lock(&context.listener).take();
        self.consumer.unsubscribe();
        let released = context.assignment.revoke_all();
        lock(&context.overflow).clear();
        info!(partitions = released.len(), "Consumer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_informational_errors_are_skipped() {
        let eof = KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF);
        assert_eq!(classify_consumer_error(&eof), None);
    }

    #[test]
    fn test_max_poll_exceeded_is_eviction() {
        let err = KafkaError::MessageConsumption(RDKafkaErrorCode::PollExceeded);
        assert!(matches!(
            classify_consumer_error(&err),
            Some(BrokerError::ConsumerEvicted(_))
        ));
    }

    #[test]
    fn test_fatal_and_transient_errors() {
        let fatal = KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fail);
        assert!(matches!(classify_consumer_error(&fatal), Some(BrokerError::Fatal(_))));

        let auth = KafkaError::Global(RDKafkaErrorCode::Authentication);
        assert!(matches!(classify_consumer_error(&auth), Some(BrokerError::Fatal(_))));

        let down = KafkaError::Global(RDKafkaErrorCode::AllBrokersDown);
        assert!(matches!(classify_consumer_error(&down), Some(BrokerError::Transient(_))));

        assert_eq!(classify_consumer_error(&KafkaError::Canceled), Some(BrokerError::Closed));
    }

    #[test]
    fn test_partition_list_keeps_order() {
        let partitions = vec![Partition::new("events", 3), Partition::new("events", 1)];
        let tpl = partition_list(&partitions);
        assert_eq!(partitions_of(&tpl), partitions);
    }
}
