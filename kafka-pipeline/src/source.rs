//! Demand-driven record source.
//!
//! The poll loop runs on its own task and hands records to a bounded
//! channel. When the channel is full the loop pauses every assigned
//! partition for backpressure and keeps calling `poll` with a zero record budget, so the
//! consumer stays in its group (heartbeats and rebalance callbacks keep
//! flowing) without fetching more than downstream can absorb. At most
//! `buffer_size` records sit between the broker and the consumer of the
//! stream.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::{PipelineSummary, Signals, StageHandle};
use crate::error::{BrokerError, PipelineError};
use crate::kafka::assignment::PauseReason;
use crate::kafka::client::{ConsumerClient, ListenerChain, RebalanceListener};
use crate::kafka::types::{CommitPosition, Partition, Record, Subscription};
use crate::metrics::PipelineMetrics;
use crate::metrics_consts::{
    POLL_BATCH_SIZE_HISTOGRAM, POLL_ERRORS_COUNTER, RECORDS_EMITTED_COUNTER,
    RECORDS_POLLED_COUNTER, SOURCE_BACKPRESSURE_COUNTER, STALE_RECORDS_DROPPED_COUNTER,
};
use crate::offset::{CommitHandle, CommittableRecord};

/// When offsets are committed relative to emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySemantics {
    /// Commit before the record is emitted; loss possible, duplication not
    AtMostOnce,
    /// Emit a commit handle; downstream commits after processing
    AtLeastOnce,
    /// Never commit; the caller persists offsets itself
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Unstarted,
    Polling,
    SuspendedBackpressure,
    Stopping,
    Stopped,
}

impl SourceState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Unstarted => 0,
            Self::Polling => 1,
            Self::SuspendedBackpressure => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unstarted,
            1 => Self::Polling,
            2 => Self::SuspendedBackpressure,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Clone)]
pub struct SourceSettings {
    pub poll_timeout: Duration,
    /// Records buffered between the poll loop and the stream consumer
    pub buffer_size: usize,
    /// Upper bound for a single poll
    pub max_poll_records: usize,
    /// Pause after a transient broker error before polling again
    pub error_backoff: Duration,
    /// Caller supplied listeners, invoked after the pipeline's own
    pub listeners: Vec<Arc<dyn RebalanceListener>>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            buffer_size: 100,
            max_poll_records: 500,
            error_backoff: Duration::from_millis(500),
            listeners: Vec::new(),
        }
    }
}

impl std::fmt::Debug for SourceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceSettings")
            .field("poll_timeout", &self.poll_timeout)
            .field("buffer_size", &self.buffer_size)
            .field("max_poll_records", &self.max_poll_records)
            .field("error_backoff", &self.error_backoff)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Lazy sequence of records produced by a [`PullSource`]
pub struct RecordStream<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> RecordStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Stream for RecordStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

struct SourceShared {
    state: AtomicU8,
    signals: Signals,
    metrics: Arc<PipelineMetrics>,
    client: Arc<dyn ConsumerClient>,
}

impl SourceShared {
    fn set_state(&self, state: SourceState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Control over a running source
#[derive(Clone)]
pub struct SourceControl {
    shared: Arc<SourceShared>,
    task: StageHandle<PipelineSummary>,
}

impl SourceControl {
    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Stop polling. Records already fetched are still delivered, then the
    /// stream ends.
    pub fn stop(&self) {
        self.shared.signals.drain.cancel();
    }

    /// Stop immediately, dropping anything not yet emitted
    pub fn shutdown(&self) {
        self.shared.signals.shutdown.cancel();
    }

    /// Resolves when the poll loop has exited
    pub async fn wait(&self) -> Result<PipelineSummary, PipelineError> {
        self.task.wait().await
    }

    pub(crate) fn stage(&self) -> StageHandle<PipelineSummary> {
        self.task.clone()
    }

    pub fn metrics(&self) -> HashMap<String, f64> {
        let mut snapshot = self.shared.client.metrics();
        snapshot.extend(self.shared.metrics.snapshot());
        snapshot
    }
}

/// Pulls records from a [`ConsumerClient`]
pub struct PullSource {
    client: Arc<dyn ConsumerClient>,
    settings: SourceSettings,
    metrics: Arc<PipelineMetrics>,
    signals: Signals,
    listeners: ListenerChain,
}

impl PullSource {
    pub fn new(client: Arc<dyn ConsumerClient>, settings: SourceSettings) -> Self {
        Self {
            client,
            settings,
            metrics: Arc::new(PipelineMetrics::new()),
            signals: Signals::new(),
            listeners: ListenerChain::new(),
        }
    }

    /// Share counters with an enclosing pipeline
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share stop signals with an enclosing pipeline
    pub fn with_signals(mut self, signals: Signals) -> Self {
        self.signals = signals;
        self
    }

    /// Register a pipeline-internal listener. These run before the caller's
    /// listeners from the settings.
    pub fn with_listener(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        self.listeners = self.listeners.with(listener);
        self
    }

    /// Emit records with their commit handles (at-least-once)
    pub fn committable(
        self,
        subscription: Subscription,
    ) -> Result<(RecordStream<CommittableRecord>, SourceControl), PipelineError> {
        let client = Arc::downgrade(&self.client);
        self.start(subscription, DeliverySemantics::AtLeastOnce, move |record, generation| {
            let handle = CommitHandle::new(
                record.partition().clone(),
                record.offset(),
                generation,
                client.clone(),
            );
            CommittableRecord::new(record, handle)
        })
    }

    /// Commit every record before emitting it
    pub fn at_most_once(
        self,
        subscription: Subscription,
    ) -> Result<(RecordStream<Record>, SourceControl), PipelineError> {
        self.start(subscription, DeliverySemantics::AtMostOnce, |record, _| record)
    }

    /// Emit bare records and never commit
    pub fn plain(
        self,
        subscription: Subscription,
    ) -> Result<(RecordStream<Record>, SourceControl), PipelineError> {
        self.start(subscription, DeliverySemantics::Plain, |record, _| record)
    }

    fn start<T, F>(
        self,
        subscription: Subscription,
        semantics: DeliverySemantics,
        emit: F,
    ) -> Result<(RecordStream<T>, SourceControl), PipelineError>
    where
        T: Send + Sync + 'static,
        F: Fn(Record, u64) -> T + Send + Sync + 'static,
    {
        let shared = Arc::new(SourceShared {
            state: AtomicU8::new(SourceState::Unstarted.as_u8()),
            signals: self.signals.clone(),
            metrics: self.metrics.clone(),
            client: self.client.clone(),
        });

        if subscription.is_group_managed() {
            let listener = self.listeners.extend(self.settings.listeners.iter().cloned());
            self.client
                .subscribe(&subscription, Arc::new(listener))
                .map_err(PipelineError::from)?;
        }

        let (tx, rx) = mpsc::channel(self.settings.buffer_size.max(1));
        let poll_loop = PollLoop {
            client: self.client,
            settings: self.settings,
            shared: shared.clone(),
            semantics,
            tx,
            pending: VecDeque::new(),
            paused: Vec::new(),
            emitted: 0,
        };
        let task = StageHandle::spawn("source", poll_loop.run(subscription, emit));

        Ok((RecordStream { rx }, SourceControl { shared, task }))
    }
}

struct PollLoop<T> {
    client: Arc<dyn ConsumerClient>,
    settings: SourceSettings,
    shared: Arc<SourceShared>,
    semantics: DeliverySemantics,
    tx: mpsc::Sender<T>,
    pending: VecDeque<T>,
    /// Partitions paused by backpressure, resumed when demand returns
    paused: Vec<Partition>,
    emitted: u64,
}

enum Flow {
    Continue,
    Stop,
}

impl<T: Send + Sync + 'static> PollLoop<T> {
    async fn run<F>(mut self, subscription: Subscription, emit: F) -> Result<PipelineSummary, PipelineError>
    where
        F: Fn(Record, u64) -> T + Send + Sync + 'static,
    {
        if let Subscription::Assignment(starts) = &subscription {
            self.client.assign(starts).await?;
        }

        info!(semantics = ?self.semantics, "Starting source poll loop");
        self.shared.set_state(SourceState::Polling);

        let result = self.poll_until_stopped(&emit).await;

        self.shared.set_state(SourceState::Stopping);
        if result.is_ok() && !self.shared.signals.shutdown.is_cancelled() {
            self.deliver_pending().await;
        }
        // Dropping the sender ends the stream
        let emitted = self.emitted;
        drop(self);

        match &result {
            Ok(()) => info!(emitted = emitted, "Source stopped"),
            Err(e) => error!(error = %e, "Source failed"),
        }
        result.map(|()| PipelineSummary {
            records_emitted: emitted,
            ..Default::default()
        })
    }

    async fn poll_until_stopped<F>(&mut self, emit: &F) -> Result<(), PipelineError>
    where
        F: Fn(Record, u64) -> T,
    {
        let mut consecutive_errors: u32 = 0;

        loop {
            if self.shared.signals.shutdown.is_cancelled() {
                return Ok(());
            }

            if let Flow::Stop = self.offer_pending() {
                return Ok(());
            }

            let blocked = !self.pending.is_empty() || self.tx.capacity() == 0;
            if blocked {
                self.suspend();
                match self.wait_for_demand().await {
                    Flow::Stop => return Ok(()),
                    Flow::Continue => {}
                }
                if !self.pending.is_empty() || self.tx.capacity() == 0 {
                    // Still blocked: heartbeat poll without fetching
                    let records = match self.poll(0).await {
                        Some(result) => result,
                        None => return Ok(()),
                    };
                    self.handle_poll(records, emit, &mut consecutive_errors).await?;
                }
                continue;
            }

            if self.shared.signals.drain.is_cancelled() {
                return Ok(());
            }

            self.resume();
            let budget = self.tx.capacity().min(self.settings.max_poll_records);
            let records = match self.poll(budget).await {
                Some(result) => result,
                None => return Ok(()),
            };
            self.handle_poll(records, emit, &mut consecutive_errors).await?;
        }
    }

    /// Poll the client. Only shutdown interrupts an in-flight poll.
    async fn poll(&self, budget: usize) -> Option<Result<Vec<Record>, BrokerError>> {
        tokio::select! {
            biased;
            _ = self.shared.signals.shutdown.cancelled() => None,
            result = self.client.poll(self.settings.poll_timeout, budget) => Some(result),
        }
    }

    async fn handle_poll<F>(
        &mut self,
        result: Result<Vec<Record>, BrokerError>,
        emit: &F,
        consecutive_errors: &mut u32,
    ) -> Result<(), PipelineError>
    where
        F: Fn(Record, u64) -> T,
    {
        match result {
            Ok(records) => {
                *consecutive_errors = 0;
                self.admit(records, emit).await
            }
            Err(BrokerError::Transient(reason)) => {
                *consecutive_errors += 1;
                metrics::counter!(POLL_ERRORS_COUNTER, "error_type" => "transient").increment(1);
                let backoff = self.settings.error_backoff * (*consecutive_errors).min(10);
                warn!(
                    reason = %reason,
                    consecutive_errors = *consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "Transient poll error"
                );
                tokio::select! {
                    _ = self.shared.signals.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(backoff) => {}
                }
                Ok(())
            }
            Err(e) => {
                metrics::counter!(POLL_ERRORS_COUNTER, "error_type" => e.error_type()).increment(1);
                Err(e.into())
            }
        }
    }

    /// Turn polled records into stream elements, committing first in
    /// at-most-once mode
    async fn admit<F>(&mut self, records: Vec<Record>, emit: &F) -> Result<(), PipelineError>
    where
        F: Fn(Record, u64) -> T,
    {
        if records.is_empty() {
            return Ok(());
        }
        metrics::counter!(RECORDS_POLLED_COUNTER).increment(records.len() as u64);
        metrics::histogram!(POLL_BATCH_SIZE_HISTOGRAM).record(records.len() as f64);
        self.shared.metrics.records_polled(records.len() as u64);

        let mut admitted = Vec::with_capacity(records.len());
        for record in records {
            match self.client.generation(record.partition()) {
                Some(generation) => admitted.push((record, generation)),
                None => {
                    debug!(
                        topic = record.topic(),
                        partition = record.partition_number(),
                        offset = record.offset(),
                        "Dropping record of a partition no longer assigned"
                    );
                    metrics::counter!(STALE_RECORDS_DROPPED_COUNTER).increment(1);
                    self.shared.metrics.stale_record_dropped();
                }
            }
        }

        if self.semantics == DeliverySemantics::AtMostOnce && !admitted.is_empty() {
            self.commit_before_emit(&admitted).await?;
        }

        self.pending
            .extend(admitted.into_iter().map(|(record, generation)| emit(record, generation)));
        Ok(())
    }

    async fn commit_before_emit(&self, admitted: &[(Record, u64)]) -> Result<(), PipelineError> {
        let mut positions: HashMap<Partition, CommitPosition> = HashMap::new();
        for (record, generation) in admitted {
            let position = CommitPosition {
                next_offset: record.offset() + 1,
                generation: *generation,
            };
            positions
                .entry(record.partition().clone())
                .and_modify(|p| {
                    if position.next_offset > p.next_offset {
                        *p = position;
                    }
                })
                .or_insert(position);
        }

        let results = self.client.commit(positions).await;
        self.shared
            .metrics
            .commit_call(results.values().filter(|r| r.is_ok()).count() as u64);
        for (partition, result) in results {
            if let Err(e) = result {
                // Nothing from this poll may be emitted uncommitted
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    error = %e,
                    "At-most-once commit failed"
                );
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Move pending elements into the channel while it has room
    fn offer_pending(&mut self) -> Flow {
        while let Some(item) = self.pending.pop_front() {
            match self.tx.try_send(item) {
                Ok(()) => self.count_emitted(),
                Err(mpsc::error::TrySendError::Full(item)) => {
                    self.pending.push_front(item);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!("Record stream dropped, stopping source");
                    return Flow::Stop;
                }
            }
        }
        Flow::Continue
    }

    /// Wait until downstream takes an element, or a poll interval passes
    async fn wait_for_demand(&mut self) -> Flow {
        // An owned permit keeps `self` free for the bookkeeping below
        let permit = tokio::select! {
            biased;
            _ = self.shared.signals.shutdown.cancelled() => return Flow::Stop,
            permit = self.tx.clone().reserve_owned() => permit,
            _ = tokio::time::sleep(self.settings.poll_timeout) => return Flow::Continue,
        };

        match permit {
            Ok(permit) => {
                if let Some(item) = self.pending.pop_front() {
                    permit.send(item);
                    self.count_emitted();
                }
                Flow::Continue
            }
            Err(_) => {
                info!("Record stream dropped, stopping source");
                Flow::Stop
            }
        }
    }

    /// Hand over what was already fetched before the stream ends
    async fn deliver_pending(&mut self) {
        while let Some(item) = self.pending.pop_front() {
            let sent = tokio::select! {
                biased;
                _ = self.shared.signals.shutdown.cancelled() => return,
                sent = self.tx.send(item) => sent,
            };
            if sent.is_err() {
                return;
            }
            self.count_emitted();
        }
    }

    fn count_emitted(&mut self) {
        self.emitted += 1;
        self.shared.metrics.record_emitted();
        metrics::counter!(RECORDS_EMITTED_COUNTER).increment(1);
    }

    fn suspend(&mut self) {
        if !self.paused.is_empty() {
            return;
        }
        let assigned = self.client.assignment();
        if assigned.is_empty() {
            return;
        }
        match self.client.pause(&assigned, PauseReason::Backpressure) {
            Ok(()) => {
                debug!(partitions = assigned.len(), "Downstream saturated, pausing partitions");
                metrics::counter!(SOURCE_BACKPRESSURE_COUNTER).increment(1);
                self.shared.metrics.backpressure();
                self.shared.set_state(SourceState::SuspendedBackpressure);
                self.paused = assigned;
            }
            Err(e) => warn!(error = %e, "Failed to pause partitions"),
        }
    }

    fn resume(&mut self) {
        if self.paused.is_empty() {
            return;
        }
        // Partitions revoked while paused are gone from the assignment
        let assigned = self.client.assignment();
        let to_resume: Vec<Partition> = std::mem::take(&mut self.paused)
            .into_iter()
            .filter(|p| assigned.contains(p))
            .collect();
        // Pauses held for other reasons stay in place
        if let Err(e) = self.client.resume(&to_resume, PauseReason::Backpressure) {
            warn!(error = %e, "Failed to resume partitions");
        }
        debug!(partitions = to_resume.len(), "Demand returned, resuming partitions");
        self.shared.set_state(SourceState::Polling);
    }
}

impl<T> Drop for PollLoop<T> {
    fn drop(&mut self) {
        self.shared.set_state(SourceState::Stopped);
    }
}
