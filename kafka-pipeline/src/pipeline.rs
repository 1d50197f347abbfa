//! Ready-made pipeline compositions.
//!
//! Every composition spawns its stages, hands them to a
//! [`PipelineControl`] and returns immediately. Stages are connected by
//! bounded channels and stop on the shared drain and shutdown signals.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::control::{PipelineControl, PipelineSummary, Signals, StageHandle};
use crate::error::{BrokerError, PipelineError};
use crate::kafka::client::{ConsumerClient, ProducerClient};
use crate::kafka::types::{ProducerRecord, Record, Subscription};
use crate::metrics::PipelineMetrics;
use crate::metrics_consts::{PROCESSING_ERRORS_COUNTER, RECORDS_PROCESSED_COUNTER};
use crate::offset::{CommitHandle, CommittableRecord, CommitSummary, Committer, CommitterSettings};
use crate::partition::{PartitionRouter, WorkerContext};
use crate::sink::{ProducerMessage, PushSink};
use crate::source::{PullSource, RecordStream, SourceControl, SourceSettings};

/// User processing of one consumed record. An error stops the pipeline.
#[async_trait]
pub trait RecordProcessor: Send + Sync + 'static {
    async fn process(&self, record: &Record) -> anyhow::Result<()>;
}

/// Maps a consumed record to the record to produce, or `None` to skip it.
/// Skipped records are still committed.
#[async_trait]
pub trait RecordTransformer: Send + Sync + 'static {
    async fn transform(&self, record: &Record) -> anyhow::Result<Option<ProducerRecord>>;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub source: SourceSettings,
    pub committer: CommitterSettings,
    /// User operations in flight at once, results kept in source order
    pub processing_parallelism: usize,
    /// Sends in flight at once
    pub producer_parallelism: usize,
    pub max_concurrent_partitions: usize,
    /// Records buffered per partition worker
    pub partition_buffer_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            committer: CommitterSettings::default(),
            processing_parallelism: 1,
            producer_parallelism: 100,
            max_concurrent_partitions: 16,
            partition_buffer_size: 100,
        }
    }
}

/// Constructors for the supported compositions
pub struct Pipeline;

impl Pipeline {
    /// Source with commit handles, user processing, then batched commits.
    /// An offset is committed only after its record was processed.
    pub fn at_least_once(
        consumer: Arc<dyn ConsumerClient>,
        subscription: Subscription,
        settings: PipelineSettings,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<PipelineControl, PipelineError> {
        let signals = Signals::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let (committer, commit_stage) = spawn_committer(&settings, &metrics, &signals);

        let (stream, source) = PullSource::new(consumer.clone(), settings.source.clone())
            .with_metrics(metrics.clone())
            .with_signals(signals.clone())
            .with_listener(Arc::new(committer.revocation_listener()))
            .committable(subscription)?;

        let processing = StageHandle::spawn(
            "processing",
            process_committable(
                stream,
                processor,
                settings.processing_parallelism,
                committer.input(),
                metrics.clone(),
                signals.shutdown.clone(),
            ),
        );
        // The committer's input closes once the processing stage is done
        drop(committer);

        info!(semantics = "at_least_once", "Pipeline started");
        Ok(PipelineControl::launch(
            vec![source.stage(), processing, commit_stage],
            signals,
            consumer,
            None,
            metrics,
        ))
    }

    /// Offsets are committed before records reach the processor
    pub fn at_most_once(
        consumer: Arc<dyn ConsumerClient>,
        subscription: Subscription,
        settings: PipelineSettings,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<PipelineControl, PipelineError> {
        let signals = Signals::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let (stream, source) = PullSource::new(consumer.clone(), settings.source.clone())
            .with_metrics(metrics.clone())
            .with_signals(signals.clone())
            .at_most_once(subscription)?;

        info!(semantics = "at_most_once", "Pipeline started");
        Ok(launch_record_pipeline(
            stream,
            source,
            processor,
            &settings,
            signals,
            consumer,
            metrics,
        ))
    }

    /// Nothing is committed. The processor persists offsets itself, usually
    /// together with its results, and resumes with an explicit assignment.
    pub fn plain(
        consumer: Arc<dyn ConsumerClient>,
        subscription: Subscription,
        settings: PipelineSettings,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<PipelineControl, PipelineError> {
        let signals = Signals::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let (stream, source) = PullSource::new(consumer.clone(), settings.source.clone())
            .with_metrics(metrics.clone())
            .with_signals(signals.clone())
            .plain(subscription)?;

        info!(semantics = "plain", "Pipeline started");
        Ok(launch_record_pipeline(
            stream,
            source,
            processor,
            &settings,
            signals,
            consumer,
            metrics,
        ))
    }

    /// Consume, transform, produce, then commit the consumed offset once the
    /// produced record is acknowledged
    pub fn consume_produce(
        consumer: Arc<dyn ConsumerClient>,
        producer: Arc<dyn ProducerClient>,
        subscription: Subscription,
        settings: PipelineSettings,
        transformer: Arc<dyn RecordTransformer>,
    ) -> Result<PipelineControl, PipelineError> {
        let signals = Signals::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let (committer, commit_stage) = spawn_committer(&settings, &metrics, &signals);

        let (stream, source) = PullSource::new(consumer.clone(), settings.source.clone())
            .with_metrics(metrics.clone())
            .with_signals(signals.clone())
            .with_listener(Arc::new(committer.revocation_listener()))
            .committable(subscription)?;

        let sink = PushSink::new(producer.clone()).with_metrics(metrics.clone());
        let producing = StageHandle::spawn(
            "producing",
            transform_and_send(
                stream,
                transformer,
                sink,
                (settings.processing_parallelism, settings.producer_parallelism),
                committer.input(),
                metrics.clone(),
                signals.shutdown.clone(),
            ),
        );
        drop(committer);

        info!(semantics = "consume_produce", "Pipeline started");
        Ok(PipelineControl::launch(
            vec![source.stage(), producing, commit_stage],
            signals,
            consumer,
            Some(producer),
            metrics,
        ))
    }

    /// One worker per assigned partition, each committing its own offsets.
    /// Requires a topic or pattern subscription.
    pub fn partitioned(
        consumer: Arc<dyn ConsumerClient>,
        subscription: Subscription,
        settings: PipelineSettings,
        processor: Arc<dyn RecordProcessor>,
    ) -> Result<PipelineControl, PipelineError> {
        if !subscription.is_group_managed() {
            return Err(BrokerError::InvalidSubscription(
                "partitioned pipelines need a topic or pattern subscription".to_string(),
            )
            .into());
        }

        let signals = Signals::new();
        let metrics = Arc::new(PipelineMetrics::new());
        let context = WorkerContext {
            processor,
            committer: settings.committer.clone(),
            buffer_size: settings.partition_buffer_size,
            metrics: metrics.clone(),
            shutdown: signals.shutdown.clone(),
        };
        let router = Arc::new(PartitionRouter::new(
            Arc::downgrade(&consumer),
            context,
            settings.max_concurrent_partitions,
        ));

        let (stream, source) = PullSource::new(consumer.clone(), settings.source.clone())
            .with_metrics(metrics.clone())
            .with_signals(signals.clone())
            .with_listener(router.clone())
            .committable(subscription)?;

        let dispatcher = StageHandle::spawn("dispatcher", router.dispatch(stream));

        info!(
            semantics = "partitioned",
            max_concurrent_partitions = settings.max_concurrent_partitions,
            "Pipeline started"
        );
        Ok(PipelineControl::launch(
            vec![source.stage(), dispatcher],
            signals,
            consumer,
            None,
            metrics,
        ))
    }
}

fn spawn_committer(
    settings: &PipelineSettings,
    metrics: &Arc<PipelineMetrics>,
    signals: &Signals,
) -> (Committer, StageHandle<PipelineSummary>) {
    let (committer, task) = Committer::new(
        settings.committer.clone(),
        metrics.clone(),
        signals.shutdown.clone(),
        settings.committer.max_batch.max(1) * 2,
    );
    let stage = StageHandle::spawn("committer", async move {
        let commits: CommitSummary = task.await?;
        Ok(PipelineSummary {
            commits,
            ..Default::default()
        })
    });
    (committer, stage)
}

fn launch_record_pipeline(
    stream: RecordStream<Record>,
    source: SourceControl,
    processor: Arc<dyn RecordProcessor>,
    settings: &PipelineSettings,
    signals: Signals,
    consumer: Arc<dyn ConsumerClient>,
    metrics: Arc<PipelineMetrics>,
) -> PipelineControl {
    let processing = StageHandle::spawn(
        "processing",
        process_records(
            stream,
            processor,
            settings.processing_parallelism,
            metrics.clone(),
            signals.shutdown.clone(),
        ),
    );
    PipelineControl::launch(vec![source.stage(), processing], signals, consumer, None, metrics)
}

async fn process_one(processor: &dyn RecordProcessor, record: &Record) -> Result<(), PipelineError> {
    processor.process(record).await.map_err(|e| {
        metrics::counter!(PROCESSING_ERRORS_COUNTER).increment(1);
        PipelineError::processing(record.partition().clone(), record.offset(), e)
    })
}

fn count_processed(metrics: &PipelineMetrics, summary: &mut PipelineSummary) {
    metrics::counter!(RECORDS_PROCESSED_COUNTER).increment(1);
    metrics.record_processed();
    summary.records_processed += 1;
}

async fn process_records(
    stream: RecordStream<Record>,
    processor: Arc<dyn RecordProcessor>,
    parallelism: usize,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<PipelineSummary, PipelineError> {
    let processed = stream
        .map(|record| {
            let processor = processor.clone();
            async move { process_one(processor.as_ref(), &record).await }
        })
        .buffered(parallelism.max(1));
    tokio::pin!(processed);

    let mut summary = PipelineSummary::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = processed.next() => next,
        };
        let Some(result) = next else {
            break;
        };
        result?;
        count_processed(&metrics, &mut summary);
    }
    Ok(summary)
}

async fn process_committable(
    stream: RecordStream<CommittableRecord>,
    processor: Arc<dyn RecordProcessor>,
    parallelism: usize,
    commits: mpsc::Sender<CommitHandle>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<PipelineSummary, PipelineError> {
    let processed = stream
        .map(|committable| {
            let processor = processor.clone();
            async move {
                let (record, handle) = committable.into_parts();
                process_one(processor.as_ref(), &record).await?;
                Ok::<_, PipelineError>(handle)
            }
        })
        .buffered(parallelism.max(1));
    tokio::pin!(processed);

    let mut summary = PipelineSummary::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = processed.next() => next,
        };
        let Some(result) = next else {
            break;
        };
        let handle = result?;
        count_processed(&metrics, &mut summary);

        if !forward_handle(&commits, handle, &shutdown).await {
            break;
        }
    }
    Ok(summary)
}

/// Returns false when the pipeline is stopping
async fn forward_handle(
    commits: &mpsc::Sender<CommitHandle>,
    handle: CommitHandle,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = commits.send(handle) => sent.is_ok(),
    }
}

async fn transform_and_send(
    stream: RecordStream<CommittableRecord>,
    transformer: Arc<dyn RecordTransformer>,
    sink: PushSink,
    (processing_parallelism, producer_parallelism): (usize, usize),
    commits: mpsc::Sender<CommitHandle>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) -> Result<PipelineSummary, PipelineError> {
    let transformed = stream
        .map(|committable| {
            let transformer = transformer.clone();
            async move {
                let (record, handle) = committable.into_parts();
                let message = match transformer.transform(&record).await {
                    Ok(Some(output)) => ProducerMessage::single(output, handle),
                    Ok(None) => ProducerMessage::pass_through(handle),
                    Err(e) => {
                        metrics::counter!(PROCESSING_ERRORS_COUNTER).increment(1);
                        return Err(PipelineError::processing(
                            record.partition().clone(),
                            record.offset(),
                            e,
                        ));
                    }
                };
                Ok(message)
            }
        })
        .buffered(processing_parallelism.max(1));

    let sent = transformed
        .map(move |result| match result {
            Ok(message) => sink
                .enqueue(message)
                .map(|r| r.map_err(PipelineError::from))
                .boxed(),
            Err(e) => futures::future::ready(Err(e)).boxed(),
        })
        .buffered(producer_parallelism.max(1));
    tokio::pin!(sent);

    let mut summary = PipelineSummary::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = sent.next() => next,
        };
        let Some(result) = next else {
            break;
        };
        let delivered = result?;
        count_processed(&metrics, &mut summary);
        summary.records_sent += delivered.acks.len() as u64;

        if !forward_handle(&commits, delivered.pass_through, &shutdown).await {
            break;
        }
    }
    Ok(summary)
}
