use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use kafka_pipeline::kafka::test_utils::{InMemoryBroker, InMemoryConsumerSettings};
use kafka_pipeline::source::SourceState;
use kafka_pipeline::{
    ConsumerClient, Pipeline, PipelineError, PipelineState, PullSource, SourceSettings,
    Subscription,
};

mod common;
use common::{fast_settings, p, wait_until, GatedProcessor};

fn source_settings() -> SourceSettings {
    SourceSettings {
        poll_timeout: Duration::from_millis(5),
        buffer_size: 16,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_assigned_partition_is_read_in_offset_order() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 2);
    broker.produce_many("events", 0, 100);

    let consumer: Arc<dyn ConsumerClient> = Arc::new(broker.consumer("group"));
    let (stream, control) = PullSource::new(consumer, source_settings())
        .plain(Subscription::assignment_with_offset(p(0), 0))
        .unwrap();

    let offsets: Vec<i64> = stream.take(100).map(|r| r.offset()).collect().await;
    assert_eq!(offsets, (0..100).collect::<Vec<_>>());

    control.shutdown();
    control.wait().await.unwrap();
}

#[tokio::test]
async fn test_start_from_offset_and_timestamp() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    for i in 0..10 {
        broker.produce_at("events", 0, None, &i.to_string(), 1_000 + i * 10);
    }

    let consumer: Arc<dyn ConsumerClient> = Arc::new(broker.consumer("by-offset"));
    let (mut stream, control) = PullSource::new(consumer, source_settings())
        .plain(Subscription::assignment_with_offset(p(0), 7))
        .unwrap();
    assert_eq!(stream.recv().await.unwrap().offset(), 7);
    control.shutdown();

    let consumer: Arc<dyn ConsumerClient> = Arc::new(broker.consumer("by-time"));
    let (mut stream, control) = PullSource::new(consumer, source_settings())
        .plain(Subscription::assignment_offsets_for_times([(p(0), 1_045)]))
        .unwrap();
    let first = stream.recv().await.unwrap();
    assert_eq!(first.offset(), 5);
    assert_eq!(first.timestamp_millis(), Some(1_050));
    control.shutdown();
}

#[tokio::test]
async fn test_committed_offset_is_resumed() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 10);
    broker.set_committed("group", &p(0), 6);

    let consumer: Arc<dyn ConsumerClient> = Arc::new(broker.consumer("group"));
    let (stream, control) = PullSource::new(consumer, source_settings())
        .committable(Subscription::assignment([p(0)]))
        .unwrap();

    let offsets: Vec<i64> = stream.take(4).map(|c| c.record.offset()).collect().await;
    assert_eq!(offsets, vec![6, 7, 8, 9]);
    control.shutdown();
}

#[tokio::test]
async fn test_slow_processing_bounds_what_is_fetched() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 500);

    let consumer = Arc::new(broker.consumer("group"));
    let mut settings = fast_settings();
    settings.source.buffer_size = 10;
    settings.source.max_poll_records = 5;

    let processor = GatedProcessor::new();
    let control = Pipeline::at_least_once(
        consumer.clone(),
        Subscription::assignment([p(0)]),
        settings,
        processor.clone(),
    )
    .unwrap();

    wait_until(|| consumer.is_paused(&p(0))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Buffer, one pending poll and the record being processed
    let fetched = consumer.position(&p(0)).unwrap_or(0);
    assert!(fetched <= 10 + 5 + 1, "fetched {fetched} records while blocked");
    assert_eq!(processor.started(), 1);

    processor.release(500);
    wait_until(|| processor.finished() == 500).await;
    wait_until(|| !consumer.is_paused(&p(0))).await;

    let summary = control.drain_and_shutdown().await.unwrap();
    assert_eq!(summary.records_processed, 500);
    assert_eq!(broker.committed("group", &p(0)), Some(500));
}

#[tokio::test]
async fn test_exceeding_max_poll_interval_fails_pipeline() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 50);

    let consumer = Arc::new(broker.consumer_with(
        "group",
        InMemoryConsumerSettings {
            max_poll_interval: Duration::from_millis(20),
            ..Default::default()
        },
    ));
    let mut settings = fast_settings();
    settings.source.buffer_size = 4;
    // While blocked on a full buffer the source only polls once per timeout,
    // which is longer than the group allows between polls
    settings.source.poll_timeout = Duration::from_millis(50);

    let processor = GatedProcessor::new();
    let control = Pipeline::at_least_once(
        consumer,
        Subscription::assignment([p(0)]),
        settings,
        processor.clone(),
    )
    .unwrap();

    let err = control.wait().await.unwrap_err();
    assert!(matches!(err, PipelineError::ConsumerEvicted(_)));
    assert_eq!(control.state(), PipelineState::Failed);
    assert_eq!(broker.committed("group", &p(0)), None);
    processor.release(50);
}

#[tokio::test]
async fn test_stop_completes_source() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 3);

    let consumer: Arc<dyn ConsumerClient> = Arc::new(broker.consumer("group"));
    let (stream, control) = PullSource::new(consumer, source_settings())
        .plain(Subscription::assignment([p(0)]))
        .unwrap();

    wait_until(|| control.metrics().get("records_emitted").copied().unwrap_or(0.0) >= 3.0).await;
    control.stop();

    let offsets: Vec<i64> = stream.map(|r| r.offset()).collect().await;
    assert_eq!(offsets, vec![0, 1, 2]);
    control.wait().await.unwrap();
    assert_eq!(control.state(), SourceState::Stopped);
}
