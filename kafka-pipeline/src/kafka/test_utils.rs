//! In-memory broker used by unit tests and the `tests/` integration suite.
//!
//! It models just enough of a Kafka cluster for the pipeline: partitioned
//! logs, group committed offsets, generation checked commits, rebalances
//! delivered from within `poll`, max-poll-interval eviction and producer
//! acknowledgements. State lives behind a std mutex that is never held
//! across an await point.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{BrokerError, CommitError, SendError};
use crate::kafka::assignment::{PartitionAssignment, PauseReason};
use crate::kafka::client::{
    CommitResults, ConsumerClient, DeliveryFuture, ProducerClient, RebalanceListener,
};
use crate::kafka::config::OffsetReset;
use crate::kafka::types::{
    CommitPosition, Partition, PartitionStart, ProducerRecord, Record, SendAck, StartPosition,
    Subscription,
};

/// Something observable that happened on the broker, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Assigned {
        member: String,
        partitions: Vec<Partition>,
    },
    RevocationCompleted {
        member: String,
        partitions: Vec<Partition>,
    },
    Committed {
        member: String,
        partition: Partition,
        next_offset: i64,
    },
    Evicted {
        member: String,
    },
}

/// One commit call as received by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCall {
    pub group: String,
    pub member: String,
    pub offsets: BTreeMap<Partition, i64>,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct PartitionLog {
    log_start: i64,
    records: Vec<StoredRecord>,
}

impl PartitionLog {
    fn high_watermark(&self) -> i64 {
        self.records.len() as i64
    }
}

#[derive(Debug)]
struct BrokerState {
    topics: BTreeMap<String, Vec<PartitionLog>>,
    committed: HashMap<(String, Partition), i64>,
    /// Group member currently owning each subscribed partition
    owners: HashMap<(String, Partition), String>,
    commit_log: Vec<CommitCall>,
    events: Vec<BrokerEvent>,
    commit_failures: usize,
    send_failures: VecDeque<SendError>,
    max_message_bytes: usize,
    round_robin: usize,
    next_member: u64,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            topics: BTreeMap::new(),
            committed: HashMap::new(),
            owners: HashMap::new(),
            commit_log: Vec::new(),
            events: Vec::new(),
            commit_failures: 0,
            send_failures: VecDeque::new(),
            max_message_bytes: 1_000_000,
            round_robin: 0,
            next_member: 0,
        }
    }
}

impl BrokerState {
    fn log(&self, partition: &Partition) -> Option<&PartitionLog> {
        self.topics
            .get(partition.topic())
            .and_then(|logs| logs.get(usize::try_from(partition.partition_number()).ok()?))
    }

    fn log_mut(&mut self, partition: &Partition) -> Option<&mut PartitionLog> {
        self.topics
            .get_mut(partition.topic())
            .and_then(|logs| logs.get_mut(usize::try_from(partition.partition_number()).ok()?))
    }

    fn append(&mut self, partition: &Partition, record: StoredRecord) -> i64 {
        let index = usize::try_from(partition.partition_number()).unwrap_or(0);
        let logs = self.topics.entry(partition.topic().to_string()).or_default();
        if logs.len() <= index {
            logs.resize_with(index + 1, PartitionLog::default);
        }
        let log = &mut logs[index];
        log.records.push(record);
        log.high_watermark() - 1
    }

    fn partitions_of(&self, topic: &str) -> Vec<Partition> {
        self.topics
            .get(topic)
            .map(|logs| {
                (0..logs.len())
                    .filter_map(|n| i32::try_from(n).ok())
                    .map(|n| Partition::new(topic, n))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Handle to a shared in-memory cluster. Cloning shares the state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.state();
        let logs = state.topics.entry(topic.to_string()).or_default();
        if logs.len() < partitions {
            logs.resize_with(partitions, PartitionLog::default);
        }
    }

    /// Append a record with the current wall clock timestamp
    pub fn produce(&self, topic: &str, partition: i32, key: Option<&str>, payload: &str) -> i64 {
        self.produce_at(topic, partition, key, payload, now_millis())
    }

    pub fn produce_at(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: &str,
        timestamp_millis: i64,
    ) -> i64 {
        self.state().append(
            &Partition::new(topic, partition),
            StoredRecord {
                key: key.map(|k| k.as_bytes().to_vec()),
                payload: Some(payload.as_bytes().to_vec()),
                timestamp: timestamp_millis,
            },
        )
    }

    /// Append `count` records with payloads `"0"`, `"1"`, ...
    pub fn produce_many(&self, topic: &str, partition: i32, count: usize) {
        for i in 0..count {
            self.produce(topic, partition, None, &i.to_string());
        }
    }

    /// Everything currently stored in a partition, from the log start
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        let partition = Partition::new(topic, partition);
        let state = self.state();
        let Some(log) = state.log(&partition) else {
            return Vec::new();
        };
        read_range(&partition, log, log.log_start, usize::MAX)
    }

    /// Drop everything before `offset`, moving the low watermark
    pub fn truncate(&self, topic: &str, partition: i32, offset: i64) {
        if let Some(log) = self.state().log_mut(&Partition::new(topic, partition)) {
            log.log_start = offset.clamp(0, log.high_watermark());
        }
    }

    pub fn committed(&self, group: &str, partition: &Partition) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
    }

    pub fn set_committed(&self, group: &str, partition: &Partition, next_offset: i64) {
        self.state()
            .committed
            .insert((group.to_string(), partition.clone()), next_offset);
    }

    pub fn commit_log(&self) -> Vec<CommitCall> {
        self.state().commit_log.clone()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state().events.clone()
    }

    /// The next `calls` commit calls fail with a transient error
    pub fn fail_next_commits(&self, calls: usize) {
        self.state().commit_failures = calls;
    }

    /// Queue an error for the next send
    pub fn fail_next_send(&self, error: SendError) {
        self.state().send_failures.push_back(error);
    }

    pub fn set_max_message_bytes(&self, bytes: usize) {
        self.state().max_message_bytes = bytes;
    }

    pub fn consumer(&self, group: &str) -> InMemoryConsumer {
        self.consumer_with(group, InMemoryConsumerSettings::default())
    }

    pub fn consumer_with(&self, group: &str, settings: InMemoryConsumerSettings) -> InMemoryConsumer {
        let member = {
            let mut state = self.state();
            state.next_member += 1;
            format!("{group}-member-{}", state.next_member)
        };
        InMemoryConsumer {
            broker: self.clone(),
            group: group.to_string(),
            member,
            settings,
            assignment: PartitionAssignment::new(),
            positions: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            pending_rebalances: Mutex::new(VecDeque::new()),
            last_poll: Mutex::new(None),
            evicted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            poll_calls: AtomicU64::new(0),
            records_fetched: AtomicU64::new(0),
        }
    }

    /// Move `partitions` between two members of a group the way a group
    /// coordinator does: `to` is assigned only after `from` has finished its
    /// revocation callbacks. Both members must be polling.
    pub async fn hand_off(
        &self,
        from: &InMemoryConsumer,
        to: &InMemoryConsumer,
        partitions: Vec<Partition>,
    ) -> Result<(), BrokerError> {
        from.schedule_rebalance(partitions.clone(), Vec::new())
            .await
            .map_err(|_| BrokerError::Closed)?;
        to.schedule_rebalance(Vec::new(), partitions)
            .await
            .map_err(|_| BrokerError::Closed)
    }

    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
            ack_delay: None,
            records_sent: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryConsumerSettings {
    pub offset_reset: OffsetReset,
    pub max_poll_interval: Duration,
}

impl Default for InMemoryConsumerSettings {
    fn default() -> Self {
        Self {
            offset_reset: OffsetReset::Earliest,
            max_poll_interval: Duration::from_secs(30),
        }
    }
}

struct PendingRebalance {
    revoked: Vec<Partition>,
    assigned: Vec<Partition>,
    done: oneshot::Sender<()>,
}

/// One member of a consumer group on the in-memory broker
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    group: String,
    member: String,
    settings: InMemoryConsumerSettings,
    assignment: PartitionAssignment,
    positions: Mutex<HashMap<Partition, i64>>,
    listener: Mutex<Option<Arc<dyn RebalanceListener>>>,
    pending_rebalances: Mutex<VecDeque<PendingRebalance>>,
    last_poll: Mutex<Option<Instant>>,
    evicted: AtomicBool,
    closed: AtomicBool,
    poll_calls: AtomicU64,
    records_fetched: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl InMemoryConsumer {
    pub fn member_id(&self) -> &str {
        &self.member
    }

    pub fn group_id(&self) -> &str {
        &self.group
    }

    /// Queue a rebalance that is delivered during the next poll. The returned
    /// receiver fires once both callbacks have completed.
    pub fn schedule_rebalance(
        &self,
        revoked: Vec<Partition>,
        assigned: Vec<Partition>,
    ) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        lock(&self.pending_rebalances).push_back(PendingRebalance {
            revoked,
            assigned,
            done,
        });
        rx
    }

    /// Current fetch position of a partition
    pub fn position(&self, partition: &Partition) -> Option<i64> {
        lock(&self.positions).get(partition).copied()
    }

    pub fn is_paused(&self, partition: &Partition) -> bool {
        self.assignment.is_paused(partition)
    }

    pub fn is_paused_by(&self, partition: &Partition, reason: PauseReason) -> bool {
        self.assignment.is_paused_by(partition, reason)
    }

    fn start_offset(&self, partition: &Partition, start: StartPosition) -> i64 {
        let state = self.broker.state();
        let (low, high) = state
            .log(partition)
            .map(|log| (log.log_start, log.high_watermark()))
            .unwrap_or((0, 0));

        let resolved = match start {
            StartPosition::Offset(offset) => offset,
            StartPosition::Timestamp(ts) => state
                .log(partition)
                .and_then(|log| {
                    log.records
                        .iter()
                        .enumerate()
                        .skip(usize::try_from(log.log_start).unwrap_or(0))
                        .find(|(_, r)| r.timestamp >= ts)
                        .map(|(i, _)| i as i64)
                })
                .unwrap_or(high),
            StartPosition::Committed => state
                .committed
                .get(&(self.group.clone(), partition.clone()))
                .copied()
                .unwrap_or(match self.settings.offset_reset {
                    OffsetReset::Earliest => low,
                    OffsetReset::Latest => high,
                }),
        };
        resolved.clamp(low, high)
    }

    fn take_ownership(&self, partitions: &[PartitionStart]) {
        let owned: Vec<Partition> = partitions.iter().map(|s| s.partition.clone()).collect();
        self.assignment.assign(&owned);
        let starts: Vec<(Partition, i64)> = partitions
            .iter()
            .map(|s| (s.partition.clone(), self.start_offset(&s.partition, s.start)))
            .collect();
        lock(&self.positions).extend(starts);
        self.broker.state().events.push(BrokerEvent::Assigned {
            member: self.member.clone(),
            partitions: owned,
        });
    }

    async fn deliver_rebalances(&self) {
        loop {
            let next = lock(&self.pending_rebalances).pop_front();
            let Some(rebalance) = next else {
                return;
            };
            let listener = lock(&self.listener).clone();

            let revoked: Vec<Partition> = rebalance
                .revoked
                .into_iter()
                .filter(|p| self.assignment.is_owned(p))
                .collect();
            if !revoked.is_empty() {
                if let Some(listener) = &listener {
                    listener.on_partitions_revoked(&revoked).await;
                }
                self.assignment.revoke(&revoked);
                {
                    let mut positions = lock(&self.positions);
                    for partition in &revoked {
                        positions.remove(partition);
                    }
                }
                self.release_ownership(&revoked);
                self.broker
                    .state()
                    .events
                    .push(BrokerEvent::RevocationCompleted {
                        member: self.member.clone(),
                        partitions: revoked,
                    });
            }

            if !rebalance.assigned.is_empty() {
                let starts: Vec<PartitionStart> = rebalance
                    .assigned
                    .iter()
                    .cloned()
                    .map(PartitionStart::committed)
                    .collect();
                {
                    let mut state = self.broker.state();
                    for partition in &rebalance.assigned {
                        state
                            .owners
                            .insert((self.group.clone(), partition.clone()), self.member.clone());
                    }
                }
                self.take_ownership(&starts);
                if let Some(listener) = &listener {
                    listener.on_partitions_assigned(&rebalance.assigned).await;
                }
            }

            if rebalance.done.send(()).is_err() {
                debug!(member = %self.member, "rebalance completion not observed");
            }
        }
    }

    fn release_ownership(&self, partitions: &[Partition]) {
        let mut state = self.broker.state();
        for partition in partitions {
            let key = (self.group.clone(), partition.clone());
            if state.owners.get(&key) == Some(&self.member) {
                state.owners.remove(&key);
            }
        }
    }

    fn fetch(&self, max_records: usize) -> Vec<Record> {
        if max_records == 0 {
            return Vec::new();
        }
        let active: Vec<Partition> = self
            .assignment
            .partitions()
            .into_iter()
            .filter(|p| !self.assignment.is_paused(p))
            .collect();
        if active.is_empty() {
            return Vec::new();
        }

        let rotation = self.poll_calls.load(Ordering::Relaxed) as usize % active.len();
        let state = self.broker.state();
        let mut positions = lock(&self.positions);
        let mut out = Vec::new();

        for partition in active.iter().cycle().skip(rotation).take(active.len()) {
            let remaining = max_records - out.len();
            if remaining == 0 {
                break;
            }
            let Some(log) = state.log(partition) else {
                continue;
            };
            let position = positions.get(partition).copied().unwrap_or(log.log_start);
            let records = read_range(partition, log, position, remaining);
            if let Some(last) = records.last() {
                positions.insert(partition.clone(), last.offset() + 1);
            }
            out.extend(records);
        }
        out
    }
}

fn read_range(partition: &Partition, log: &PartitionLog, from: i64, max: usize) -> Vec<Record> {
    let start = from.max(log.log_start);
    let Ok(start_index) = usize::try_from(start) else {
        return Vec::new();
    };
    log.records
        .iter()
        .enumerate()
        .skip(start_index)
        .take(max)
        .map(|(offset, stored)| {
            Record::new(
                partition.clone(),
                offset as i64,
                stored.key.clone(),
                stored.payload.clone(),
                Some(stored.timestamp),
            )
        })
        .collect()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl ConsumerClient for InMemoryConsumer {
    fn subscribe(
        &self,
        subscription: &Subscription,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<(), BrokerError> {
        if !subscription.is_group_managed() {
            return Err(BrokerError::InvalidSubscription(
                "manual assignments must use assign".to_string(),
            ));
        }
        *lock(&self.listener) = Some(listener);

        // The first member to subscribe takes every unowned partition,
        // later members join empty until partitions are handed to them
        let partitions: Vec<Partition> = {
            let mut state = self.broker.state();
            let unowned: Vec<Partition> = state
                .topics
                .keys()
                .filter(|topic| subscription.matches_topic(topic))
                .flat_map(|topic| state.partitions_of(topic))
                .filter(|p| !state.owners.contains_key(&(self.group.clone(), p.clone())))
                .collect();
            for partition in &unowned {
                state
                    .owners
                    .insert((self.group.clone(), partition.clone()), self.member.clone());
            }
            unowned
        };
        if partitions.is_empty() {
            return Ok(());
        }
        // Initial group join: drop the completion receiver, nobody waits on it
        drop(self.schedule_rebalance(Vec::new(), partitions));
        Ok(())
    }

    async fn assign(&self, partitions: &[PartitionStart]) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.take_ownership(partitions);
        Ok(())
    }

    async fn poll(&self, timeout: Duration, max_records: usize) -> Result<Vec<Record>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.evicted.load(Ordering::SeqCst) {
            return Err(BrokerError::ConsumerEvicted(format!(
                "{} is no longer a group member",
                self.member
            )));
        }

        let last = *lock(&self.last_poll);
        if let Some(last) = last {
            if last.elapsed() > self.settings.max_poll_interval {
                self.evicted.store(true, Ordering::SeqCst);
                self.assignment.revoke_all();
                self.broker.state().events.push(BrokerEvent::Evicted {
                    member: self.member.clone(),
                });
                return Err(BrokerError::ConsumerEvicted(format!(
                    "max poll interval of {:?} exceeded",
                    self.settings.max_poll_interval
                )));
            }
        }

        self.deliver_rebalances().await;

        let mut records = self.fetch(max_records);
        if records.is_empty() {
            tokio::time::sleep(timeout).await;
            self.deliver_rebalances().await;
            records = self.fetch(max_records);
        }

        self.poll_calls.fetch_add(1, Ordering::Relaxed);
        self.records_fetched
            .fetch_add(records.len() as u64, Ordering::Relaxed);
        *lock(&self.last_poll) = Some(Instant::now());
        Ok(records)
    }

    async fn commit(&self, offsets: HashMap<Partition, CommitPosition>) -> CommitResults {
        if self.closed.load(Ordering::SeqCst) {
            return offsets
                .into_keys()
                .map(|p| (p, Err(CommitError::ConsumerClosed)))
                .collect();
        }

        let mut state = self.broker.state();
        state.commit_log.push(CommitCall {
            group: self.group.clone(),
            member: self.member.clone(),
            offsets: offsets
                .iter()
                .map(|(p, pos)| (p.clone(), pos.next_offset))
                .collect(),
        });

        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return offsets
                .into_keys()
                .map(|p| (p, Err(CommitError::Transient("coordinator not available".into()))))
                .collect();
        }

        let mut results = HashMap::with_capacity(offsets.len());
        for (partition, position) in offsets {
            let result = match self.assignment.validate(&partition, position.generation) {
                Ok(()) => {
                    state
                        .committed
                        .insert((self.group.clone(), partition.clone()), position.next_offset);
                    state.events.push(BrokerEvent::Committed {
                        member: self.member.clone(),
                        partition: partition.clone(),
                        next_offset: position.next_offset,
                    });
                    Ok(position.next_offset)
                }
                Err(e) => Err(e),
            };
            results.insert(partition, result);
        }
        results
    }

    fn pause(&self, partitions: &[Partition], reason: PauseReason) -> Result<(), BrokerError> {
        for partition in partitions {
            self.assignment.pause(partition, reason);
        }
        Ok(())
    }

    fn resume(&self, partitions: &[Partition], reason: PauseReason) -> Result<(), BrokerError> {
        for partition in partitions {
            self.assignment.resume(partition, reason);
        }
        Ok(())
    }

    fn seek(&self, partition: &Partition, offset: i64) -> Result<(), BrokerError> {
        if !self.assignment.is_owned(partition) {
            return Err(BrokerError::NotAssigned(partition.clone()));
        }
        lock(&self.positions).insert(partition.clone(), offset);
        Ok(())
    }

    fn assignment(&self) -> Vec<Partition> {
        self.assignment.partitions()
    }

    fn generation(&self, partition: &Partition) -> Option<u64> {
        self.assignment.generation_of(partition)
    }

    async fn fetch_watermarks(
        &self,
        partition: &Partition,
        _timeout: Duration,
    ) -> Result<(i64, i64), BrokerError> {
        self.broker
            .state()
            .log(partition)
            .map(|log| (log.log_start, log.high_watermark()))
            .ok_or_else(|| BrokerError::Fatal(format!("unknown partition {partition}")))
    }

    async fn offsets_for_timestamp(
        &self,
        partitions: &[Partition],
        timestamp_millis: i64,
        _timeout: Duration,
    ) -> Result<HashMap<Partition, i64>, BrokerError> {
        Ok(partitions
            .iter()
            .map(|p| {
                (
                    p.clone(),
                    self.start_offset(p, StartPosition::Timestamp(timestamp_millis)),
                )
            })
            .collect())
    }

    fn metrics(&self) -> HashMap<String, f64> {
        HashMap::from([
            (
                "client_poll_calls".to_string(),
                self.poll_calls.load(Ordering::Relaxed) as f64,
            ),
            (
                "client_records_fetched".to_string(),
                self.records_fetched.load(Ordering::Relaxed) as f64,
            ),
            (
                "client_assigned_partitions".to_string(),
                self.assignment.len() as f64,
            ),
            (
                "client_paused_partitions".to_string(),
                self.assignment.paused().len() as f64,
            ),
        ])
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.listener).take();
        self.assignment.revoke_all();
        self.broker
            .state()
            .owners
            .retain(|_, member| *member != self.member);
    }
}

/// Producer on the in-memory broker. Records are appended at enqueue time.
pub struct InMemoryProducer {
    broker: InMemoryBroker,
    ack_delay: Option<Duration>,
    records_sent: AtomicU64,
}

impl InMemoryProducer {
    /// Delay every acknowledgement, keeping sends in flight for a while
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = Some(delay);
        self
    }

    fn append(&self, record: &ProducerRecord) -> Result<SendAck, SendError> {
        let mut state = self.broker.state();
        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        let size = record.size_bytes();
        if size > state.max_message_bytes {
            return Err(SendError::RecordTooLarge {
                size,
                max: state.max_message_bytes,
            });
        }

        let partition_count = state
            .topics
            .get(record.topic())
            .map(Vec::len)
            .unwrap_or(1)
            .max(1);
        let partition_number = match (record.partition(), record.key()) {
            (Some(partition), _) => partition,
            (None, Some(key)) => {
                let hash: usize = key.iter().map(|b| usize::from(*b)).sum();
                i32::try_from(hash % partition_count).unwrap_or(0)
            }
            (None, None) => {
                state.round_robin = state.round_robin.wrapping_add(1);
                i32::try_from(state.round_robin % partition_count).unwrap_or(0)
            }
        };

        let partition = Partition::new(record.topic(), partition_number);
        let offset = state.append(
            &partition,
            StoredRecord {
                key: record.key().map(<[u8]>::to_vec),
                payload: record.payload().map(<[u8]>::to_vec),
                timestamp: record.timestamp_millis().unwrap_or_else(now_millis),
            },
        );
        Ok(SendAck { partition, offset })
    }
}

#[async_trait]
impl ProducerClient for InMemoryProducer {
    fn enqueue(&self, record: ProducerRecord) -> DeliveryFuture {
        let result = self.append(&record);
        if result.is_ok() {
            self.records_sent.fetch_add(1, Ordering::Relaxed);
        }
        match self.ack_delay {
            Some(delay) => async move {
                tokio::time::sleep(delay).await;
                result
            }
            .boxed(),
            None => futures::future::ready(result).boxed(),
        }
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), SendError> {
        Ok(())
    }

    fn metrics(&self) -> HashMap<String, f64> {
        HashMap::from([(
            "producer_records_sent".to_string(),
            self.records_sent.load(Ordering::Relaxed) as f64,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: i32) -> Partition {
        Partition::new("events", n)
    }

    #[tokio::test]
    async fn test_assign_with_offset_reads_from_offset() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 1);
        broker.produce_many("events", 0, 10);

        let consumer = broker.consumer("group");
        consumer
            .assign(&[PartitionStart::at_offset(p(0), 7)])
            .await
            .unwrap();

        let records = consumer.poll(Duration::from_millis(1), 100).await.unwrap();
        let offsets: Vec<i64> = records.iter().map(Record::offset).collect();
        assert_eq!(offsets, vec![7, 8, 9]);
        assert_eq!(consumer.position(&p(0)), Some(10));
    }

    #[tokio::test]
    async fn test_poll_respects_max_records_and_pause() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 2);
        broker.produce_many("events", 0, 5);
        broker.produce_many("events", 1, 5);

        let consumer = broker.consumer("group");
        consumer
            .assign(&[PartitionStart::committed(p(0)), PartitionStart::committed(p(1))])
            .await
            .unwrap();

        consumer.pause(&[p(1)], PauseReason::Backpressure).unwrap();
        let records = consumer.poll(Duration::from_millis(1), 3).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.partition() == &p(0)));

        let nothing = consumer.poll(Duration::from_millis(1), 0).await.unwrap();
        assert!(nothing.is_empty());
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_generation() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 1);
        let consumer = broker.consumer("group");
        consumer
            .assign(&[PartitionStart::committed(p(0))])
            .await
            .unwrap();
        let generation = consumer.generation(&p(0)).unwrap();

        let results = consumer
            .commit(HashMap::from([(
                p(0),
                CommitPosition {
                    next_offset: 3,
                    generation,
                },
            )]))
            .await;
        assert_eq!(results[&p(0)], Ok(3));
        assert_eq!(broker.committed("group", &p(0)), Some(3));

        let results = consumer
            .commit(HashMap::from([(
                p(0),
                CommitPosition {
                    next_offset: 5,
                    generation: generation + 10,
                },
            )]))
            .await;
        assert!(matches!(
            results[&p(0)],
            Err(CommitError::StaleGeneration { .. })
        ));
        assert_eq!(broker.committed("group", &p(0)), Some(3));
    }

    #[tokio::test]
    async fn test_consumer_evicted_after_max_poll_interval() {
        let broker = InMemoryBroker::new();
        broker.create_topic("events", 1);
        let consumer = broker.consumer_with(
            "group",
            InMemoryConsumerSettings {
                max_poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
        );
        consumer
            .assign(&[PartitionStart::committed(p(0))])
            .await
            .unwrap();
        consumer.poll(Duration::from_millis(1), 10).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let result = consumer.poll(Duration::from_millis(1), 10).await;
        assert!(matches!(result, Err(BrokerError::ConsumerEvicted(_))));
        assert!(consumer.assignment().is_empty());
    }

    #[tokio::test]
    async fn test_producer_appends_and_rejects_large_records() {
        let broker = InMemoryBroker::new();
        broker.create_topic("out", 1);
        broker.set_max_message_bytes(8);
        let producer = broker.producer();

        let ack = producer
            .enqueue(ProducerRecord::new("out").with_payload("small"))
            .await
            .unwrap();
        assert_eq!(ack.offset, 0);

        let err = producer
            .enqueue(ProducerRecord::new("out").with_payload("far too large"))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::RecordTooLarge { .. }));
        assert_eq!(broker.records("out", 0).len(), 1);
    }
}
