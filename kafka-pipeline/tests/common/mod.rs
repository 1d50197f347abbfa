#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use kafka_pipeline::offset::CommitterSettings;
use kafka_pipeline::{Partition, PipelineSettings, Record, RecordProcessor, SourceSettings};

pub fn p(n: i32) -> Partition {
    Partition::new("events", n)
}

/// Small buffers and short timeouts so tests stay fast
pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        source: SourceSettings {
            poll_timeout: Duration::from_millis(5),
            buffer_size: 16,
            ..Default::default()
        },
        committer: CommitterSettings {
            max_batch: 10,
            max_interval: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(5),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

/// Records every processed offset per partition, optionally failing at one
#[derive(Default)]
pub struct RecordingProcessor {
    pub seen: Mutex<Vec<(Partition, i64)>>,
    pub fail_at: Option<i64>,
}

impl RecordingProcessor {
    pub fn failing_at(offset: i64) -> Self {
        Self {
            fail_at: Some(offset),
            ..Default::default()
        }
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn offsets(&self, partition: &Partition) -> Vec<i64> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == partition)
            .map(|(_, o)| *o)
            .collect()
    }
}

#[async_trait]
impl RecordProcessor for RecordingProcessor {
    async fn process(&self, record: &Record) -> anyhow::Result<()> {
        if Some(record.offset()) == self.fail_at {
            return Err(anyhow!("refusing offset {}", record.offset()));
        }
        self.seen
            .lock()
            .unwrap()
            .push((record.partition().clone(), record.offset()));
        Ok(())
    }
}

/// Blocks every record until permits are released
pub struct GatedProcessor {
    pub gate: Semaphore,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
}

impl GatedProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        })
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl RecordProcessor for GatedProcessor {
    async fn process(&self, _record: &Record) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await?.forget();
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
