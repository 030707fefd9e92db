// Helpers shared by the facade and route tests

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::progress::BroadcastChannel;
use crate::queue_engine::QueueEngine;
use crate::repository::MemoryRepository;
use crate::worker::{ProgressSink, Worker, WorkerError, WorkerJob};

/// Worker that accepts `.mkv` inputs and runs until cancelled
pub struct HoldWorker {
    pub name: &'static str,
}

#[async_trait]
impl Worker for HoldWorker {
    fn name(&self) -> &'static str {
        self.name
    }

    fn output_ref_for(&self, input_ref: &str) -> Result<String, String> {
        input_ref
            .strip_suffix(".mkv")
            .map(|stem| format!("{}.mp4", stem))
            .ok_or_else(|| format!("Unsupported file type: {}", input_ref))
    }

    async fn is_already_produced(&self, _job: &WorkerJob) -> bool {
        false
    }

    async fn run(
        &self,
        _job: &WorkerJob,
        _progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        cancel.cancelled().await;
        Err(WorkerError::Cancelled)
    }
}

pub async fn hold_engine(name: &'static str, channel: &BroadcastChannel) -> QueueEngine {
    QueueEngine::start(
        Arc::new(HoldWorker { name }),
        Arc::new(MemoryRepository::new(name)),
        Arc::new(channel.clone()),
        EngineConfig {
            progress_interval: Duration::from_millis(100),
            reschedule_delay: Duration::from_millis(5),
        },
    )
    .await
    .unwrap()
}

/// Wait until the engine hands a job to the worker
pub async fn wait_for_processing(engine: &QueueEngine) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while engine.current().await.unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no job started processing");
}
