use std::sync::Arc;
use std::time::Duration;

use kafka_pipeline::kafka::test_utils::{BrokerEvent, InMemoryBroker};
use kafka_pipeline::{ConsumerClient, Pipeline, PipelineError, Subscription};

mod common;
use common::{fast_settings, p, wait_until, RecordingProcessor};

#[tokio::test]
async fn test_at_least_once_resumes_after_failure_without_gaps() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 20);

    let failing = Arc::new(RecordingProcessor::failing_at(7));
    let control = Pipeline::at_least_once(
        Arc::new(broker.consumer("group")),
        Subscription::assignment([p(0)]),
        fast_settings(),
        failing.clone(),
    )
    .unwrap();

    let err = control.wait().await.unwrap_err();
    assert!(matches!(err, PipelineError::Processing { offset: 7, .. }));
    assert_eq!(failing.offsets(&p(0)), (0..7).collect::<Vec<_>>());

    // Nothing at or past the failed record may have been committed
    let resume_from = broker.committed("group", &p(0)).unwrap_or(0);
    assert!(resume_from <= 7, "committed {resume_from} past the failed record");

    let processor = Arc::new(RecordingProcessor::default());
    let control = Pipeline::at_least_once(
        Arc::new(broker.consumer("group")),
        Subscription::assignment([p(0)]),
        fast_settings(),
        processor.clone(),
    )
    .unwrap();

    wait_until(|| processor.count() == (20 - resume_from) as usize).await;
    control.drain_and_shutdown().await.unwrap();

    assert_eq!(processor.offsets(&p(0)), (resume_from..20).collect::<Vec<_>>());
    assert_eq!(broker.committed("group", &p(0)), Some(20));
}

#[tokio::test]
async fn test_at_most_once_never_redelivers_failed_record() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 10);

    let failing = Arc::new(RecordingProcessor::failing_at(3));
    let control = Pipeline::at_most_once(
        Arc::new(broker.consumer("group")),
        Subscription::assignment([p(0)]),
        fast_settings(),
        failing,
    )
    .unwrap();

    assert!(control.wait().await.is_err());
    let committed = broker.committed("group", &p(0)).unwrap();
    assert!(committed >= 4, "record 3 was emitted before its commit ({committed})");

    let processor = Arc::new(RecordingProcessor::default());
    let control = Pipeline::at_most_once(
        Arc::new(broker.consumer("group")),
        Subscription::assignment([p(0)]),
        fast_settings(),
        processor.clone(),
    )
    .unwrap();

    wait_until(|| processor.count() == (10 - committed) as usize).await;
    control.drain_and_shutdown().await.unwrap();

    assert!(!processor.offsets(&p(0)).contains(&3));
    assert_eq!(broker.committed("group", &p(0)), Some(10));
}

#[tokio::test]
async fn test_revoked_partition_is_committed_before_revocation_completes() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 2);
    broker.produce_many("events", 0, 10);
    broker.produce_many("events", 1, 10);

    let consumer = Arc::new(broker.consumer("group"));
    let mut settings = fast_settings();
    // Only the revocation or the final drain can trigger a commit
    settings.committer.max_batch = 1000;
    settings.committer.max_interval = Duration::from_secs(60);

    let processor = Arc::new(RecordingProcessor::default());
    let control = Pipeline::at_least_once(
        consumer.clone(),
        Subscription::topics(["events"]),
        settings,
        processor.clone(),
    )
    .unwrap();

    wait_until(|| processor.count() == 20).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.commit_log().is_empty());

    consumer
        .schedule_rebalance(vec![p(1)], vec![])
        .await
        .unwrap();
    assert_eq!(broker.committed("group", &p(1)), Some(10));
    assert_eq!(broker.committed("group", &p(0)), None);

    let events = broker.events();
    let committed_at = events
        .iter()
        .position(|e| matches!(e, BrokerEvent::Committed { partition, next_offset: 10, .. } if *partition == p(1)))
        .unwrap();
    let revoked_at = events
        .iter()
        .position(|e| matches!(e, BrokerEvent::RevocationCompleted { partitions, .. } if partitions.contains(&p(1))))
        .unwrap();
    assert!(committed_at < revoked_at);

    control.drain_and_shutdown().await.unwrap();
    assert_eq!(broker.committed("group", &p(0)), Some(10));
}

#[tokio::test]
async fn test_hand_off_commits_before_new_owner_is_assigned() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 10);

    let mut settings = fast_settings();
    // Only the revocation can trigger a commit before the hand-off
    settings.committer.max_batch = 1000;
    settings.committer.max_interval = Duration::from_secs(60);

    let first = Arc::new(broker.consumer("group"));
    let first_processor = Arc::new(RecordingProcessor::default());
    let first_control = Pipeline::at_least_once(
        first.clone(),
        Subscription::topics(["events"]),
        settings.clone(),
        first_processor.clone(),
    )
    .unwrap();
    wait_until(|| first_processor.count() == 10).await;

    // Joins the group after every partition was taken
    let second = Arc::new(broker.consumer("group"));
    let second_processor = Arc::new(RecordingProcessor::default());
    let second_control = Pipeline::at_least_once(
        second.clone(),
        Subscription::topics(["events"]),
        settings,
        second_processor.clone(),
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(second.assignment().is_empty());
    assert_eq!(broker.committed("group", &p(0)), None);

    tokio::time::timeout(
        Duration::from_secs(5),
        broker.hand_off(&first, &second, vec![p(0)]),
    )
    .await
    .unwrap()
    .unwrap();

    let events = broker.events();
    let committed_at = events
        .iter()
        .position(|e| matches!(e, BrokerEvent::Committed { member, partition, next_offset: 10 } if member == first.member_id() && *partition == p(0)))
        .unwrap();
    let assigned_at = events
        .iter()
        .position(|e| matches!(e, BrokerEvent::Assigned { member, partitions } if member == second.member_id() && partitions.contains(&p(0))))
        .unwrap();
    assert!(committed_at < assigned_at);

    // The new owner continues after the handed-over commit
    broker.produce_many("events", 0, 5);
    wait_until(|| second_processor.count() == 5).await;
    assert_eq!(second_processor.offsets(&p(0)), (10..15).collect::<Vec<_>>());
    assert_eq!(first_processor.count(), 10);

    first_control.drain_and_shutdown().await.unwrap();
    second_control.drain_and_shutdown().await.unwrap();
    assert_eq!(broker.committed("group", &p(0)), Some(15));
}

#[tokio::test]
async fn test_transient_commit_failures_are_retried_in_pipeline() {
    let broker = InMemoryBroker::new();
    broker.create_topic("events", 1);
    broker.produce_many("events", 0, 10);
    broker.fail_next_commits(2);

    let processor = Arc::new(RecordingProcessor::default());
    let control = Pipeline::at_least_once(
        Arc::new(broker.consumer("group")),
        Subscription::assignment([p(0)]),
        fast_settings(),
        processor.clone(),
    )
    .unwrap();

    wait_until(|| broker.committed("group", &p(0)) == Some(10)).await;
    let summary = control.drain_and_shutdown().await.unwrap();

    assert_eq!(summary.records_processed, 10);
    assert!(broker.commit_log().len() >= 3);
    assert_eq!(control.metrics()["commit_failures"], 2.0);
}
