// ==== Source metrics ====
/// Counter for records returned by broker polls
pub const RECORDS_POLLED_COUNTER: &str = "kafka_pipeline_records_polled_total";

/// Counter for records handed to downstream stages
pub const RECORDS_EMITTED_COUNTER: &str = "kafka_pipeline_records_emitted_total";

/// Counter for records dropped because their partition was revoked or reassigned
pub const STALE_RECORDS_DROPPED_COUNTER: &str = "kafka_pipeline_stale_records_dropped_total";

/// Counter for polls that found the downstream buffer full
pub const SOURCE_BACKPRESSURE_COUNTER: &str = "kafka_pipeline_source_backpressure_total";

/// Counter for broker errors seen by the poll loop, labelled by error type
pub const POLL_ERRORS_COUNTER: &str = "kafka_pipeline_poll_errors_total";

/// Histogram for number of records returned by a single poll
pub const POLL_BATCH_SIZE_HISTOGRAM: &str = "kafka_pipeline_poll_batch_size";

// ==== Commit metrics ====
/// Counter for commit calls issued to the broker
pub const COMMIT_CALLS_COUNTER: &str = "kafka_pipeline_commit_calls_total";

/// Counter for commit failures, labelled by error type
pub const COMMIT_FAILURES_COUNTER: &str = "kafka_pipeline_commit_failures_total";

/// Histogram for number of handles folded into one committed batch
pub const COMMIT_BATCH_SIZE_HISTOGRAM: &str = "kafka_pipeline_commit_batch_size";

/// Histogram for commit call latency
pub const COMMIT_DURATION_HISTOGRAM: &str = "kafka_pipeline_commit_duration_seconds";

/// Gauge for the last committed offset per partition
pub const COMMITTED_OFFSET_GAUGE: &str = "kafka_pipeline_committed_offset";

// ==== Processing metrics ====
/// Counter for records processed successfully
pub const RECORDS_PROCESSED_COUNTER: &str = "kafka_pipeline_records_processed_total";

/// Counter for processing failures
pub const PROCESSING_ERRORS_COUNTER: &str = "kafka_pipeline_processing_errors_total";

// ==== Partition routing metrics ====
/// Gauge for partitions with a running worker
pub const ACTIVE_PARTITIONS_GAUGE: &str = "kafka_pipeline_active_partitions";

/// Gauge for assigned partitions waiting for a free worker slot
pub const QUEUED_PARTITIONS_GAUGE: &str = "kafka_pipeline_queued_partitions";

/// Counter for records dropped because their partition had no worker yet,
/// including records fetched ahead of a rewind
pub const QUEUED_RECORDS_DROPPED_COUNTER: &str = "kafka_pipeline_queued_records_dropped_total";

/// Counter for rebalance callbacks, labelled by event type
pub const REBALANCE_EVENTS_COUNTER: &str = "kafka_pipeline_rebalance_events_total";

/// Counter for times routing had to wait on a full partition worker channel
pub const PARTITION_BACKPRESSURE_COUNTER: &str = "kafka_pipeline_partition_backpressure_total";

/// Counter for rebalance callbacks carrying no partitions
pub const REBALANCE_EMPTY_SKIPPED_COUNTER: &str = "kafka_pipeline_rebalance_empty_skipped_total";

/// Counter for errors returned by the consumer client, labelled by level and error
pub const CONSUMER_ERRORS_COUNTER: &str = "kafka_pipeline_consumer_errors_total";

/// Gauge for librdkafka's callback queue depth from the statistics callback
pub const CONSUMER_CALLBACK_QUEUE_GAUGE: &str = "kafka_pipeline_consumer_callback_queue_depth";

// ==== Sink metrics ====
/// Counter for records acknowledged by the producer
pub const RECORDS_SENT_COUNTER: &str = "kafka_pipeline_records_sent_total";

/// Counter for producer failures, labelled by error type
pub const SEND_ERRORS_COUNTER: &str = "kafka_pipeline_send_errors_total";

/// Histogram for time from enqueue to broker acknowledgement
pub const SEND_DURATION_HISTOGRAM: &str = "kafka_pipeline_send_duration_seconds";

// ==== Lifecycle metrics ====
/// Counter for pipelines reaching a terminal state, labelled by outcome
pub const PIPELINE_TERMINATED_COUNTER: &str = "kafka_pipeline_terminated_total";

/// Counter for pipeline restarts performed by the supervisor
pub const PIPELINE_RESTARTS_COUNTER: &str = "kafka_pipeline_restarts_total";

// ==== HTTP metrics ====
pub const HTTP_REQUESTS_COUNTER: &str = "kafka_pipeline_http_requests_total";

pub const HTTP_REQUEST_DURATION_HISTOGRAM: &str = "kafka_pipeline_http_request_duration_seconds";
