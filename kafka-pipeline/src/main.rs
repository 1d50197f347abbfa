use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use kafka_pipeline::backoff::RestartBackoff;
use kafka_pipeline::config::Config;
use kafka_pipeline::kafka::{KafkaConsumerClient, KafkaProducerClient};
use kafka_pipeline::metrics_consts::PIPELINE_RESTARTS_COUNTER;
use kafka_pipeline::server::{self, HealthState};
use kafka_pipeline::{
    ConsumerClient, Pipeline, PipelineControl, ProducerClient, ProducerRecord, Record,
    RecordProcessor, RecordTransformer,
};

/// A pipeline that stayed up this long resets the restart backoff
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Logs every record it sees
struct LoggingProcessor;

#[async_trait]
impl RecordProcessor for LoggingProcessor {
    async fn process(&self, record: &Record) -> anyhow::Result<()> {
        debug!(
            topic = record.topic(),
            partition = record.partition_number(),
            offset = record.offset(),
            bytes = record.payload().map_or(0, <[u8]>::len),
            "Consumed record"
        );
        Ok(())
    }
}

/// Forwards JSON payloads to the output topic, keeping the key. Records
/// without a payload are skipped.
struct JsonForwarder {
    output_topic: String,
}

#[async_trait]
impl RecordTransformer for JsonForwarder {
    async fn transform(&self, record: &Record) -> anyhow::Result<Option<ProducerRecord>> {
        let Some(value) = record
            .payload_json::<serde_json::Value>()
            .with_context(|| format!("invalid JSON at {} offset {}", record.partition(), record.offset()))?
        else {
            return Ok(None);
        };

        let mut out = ProducerRecord::json(&self.output_topic, &value)?;
        if let Some(key) = record.key() {
            out = out.with_key(key);
        }
        Ok(Some(out))
    }
}

fn start_server(
    config: &Config,
    health: HealthState,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let recorder = server::setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let router = server::setup_metrics_routes(server::router(health), recorder);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = server::serve(router, &bind, shutdown).await {
            error!("Metrics server failed: {e:#}");
        }
    }))
}

fn shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received ctrl-c"),
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {e}");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for ctrl-c: {e}");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {e}");
            }
            info!("Received ctrl-c");
        }
        trigger.cancel();
    });

    token
}

fn start_pipeline(config: &Config) -> Result<PipelineControl> {
    let consumer: Arc<dyn ConsumerClient> = Arc::new(
        KafkaConsumerClient::new(&config.consumer_config()?).context("Failed to create Kafka consumer")?,
    );
    let subscription = config.subscription()?;
    let settings = config.pipeline_settings();

    let control = match &config.output_topic {
        Some(output_topic) => {
            let producer: Arc<dyn ProducerClient> = Arc::new(
                KafkaProducerClient::new(&config.producer_config())
                    .context("Failed to create Kafka producer")?,
            );
            let transformer = Arc::new(JsonForwarder {
                output_topic: output_topic.clone(),
            });
            Pipeline::consume_produce(consumer, producer, subscription, settings, transformer)?
        }
        None if config.partitioned => {
            Pipeline::partitioned(consumer, subscription, settings, Arc::new(LoggingProcessor))?
        }
        None => Pipeline::at_least_once(consumer, subscription, settings, Arc::new(LoggingProcessor))?,
    };
    Ok(control)
}

async fn stop_pipeline(control: &PipelineControl, timeout: Duration) {
    match tokio::time::timeout(timeout, control.drain_and_shutdown()).await {
        Ok(Ok(summary)) => info!(
            emitted = summary.records_emitted,
            processed = summary.records_processed,
            sent = summary.records_sent,
            commit_batches = summary.commits.batches,
            "Pipeline drained"
        ),
        Ok(Err(e)) => error!("Pipeline failed while draining: {e:#}"),
        Err(_) => {
            warn!(?timeout, "Drain timed out, shutting down");
            if let Err(e) = control.shutdown().await {
                error!("Pipeline failed during shutdown: {e:#}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Kafka pipeline");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;
    config.validate().context("Invalid configuration")?;
    info!("Configuration loaded: {:?}", config);

    let shutdown = shutdown_signal();
    let health = HealthState::new();
    let server_handle = start_server(&config, health.clone(), shutdown.clone())?;
    info!("Started metrics server on {}", config.bind_address());

    let mut backoff = RestartBackoff::default();

    while !shutdown.is_cancelled() {
        let started = Instant::now();
        let control = match start_pipeline(&config) {
            Ok(control) => control,
            Err(e) => {
                error!("Failed to start pipeline: {e:#}");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        health.set_ready(true);

        let outcome = tokio::select! {
            _ = shutdown.cancelled() => {
                health.set_ready(false);
                stop_pipeline(&control, config.shutdown_timeout()).await;
                break;
            }
            outcome = control.wait() => outcome,
        };
        health.set_ready(false);

        match outcome {
            Ok(summary) => {
                info!(processed = summary.records_processed, "Pipeline completed");
                break;
            }
            Err(e) => {
                if started.elapsed() >= HEALTHY_RUN {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                error!(
                    error_type = e.error_type(),
                    attempt = backoff.attempt(),
                    ?delay,
                    "Pipeline failed, restarting: {e:#}"
                );
                metrics::counter!(PIPELINE_RESTARTS_COUNTER, "reason" => e.error_type()).increment(1);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // Also stops the server when the pipeline completed on its own
    shutdown.cancel();
    if let Err(e) = server_handle.await {
        error!("Metrics server task failed: {e}");
    }
    info!("Kafka pipeline stopped");
    Ok(())
}
