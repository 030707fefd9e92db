//! Queue engine for media jobs
//!
//! This module implements the FIFO scheduler shared by every queue kind. Each
//! queue instance runs as a single actor task: caller operations, worker
//! notifications and timer ticks all arrive as messages on one channel and are
//! handled one at a time, so the in-memory list never sees interleaved
//! mutations. Exactly one job is handed to the worker at a time.
//!
//! The in-memory list is authoritative while the process runs; the repository
//! is a write-through mirror read back only by [`QueueEngine::start`].

use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::models::{JobStatus, QueueItem};
use crate::progress::{ProgressChannel, ProgressThrottle};
use crate::repository::{QueueRepository, RepositoryError};
use crate::worker::{run_job, JobOutcome, ProgressSink, Worker, WorkerJob};

/// Queue engine error types
#[derive(Error, Debug)]
pub enum QueueError {
    /// The request is malformed or the input is not eligible
    #[error("Invalid request: {0}")]
    Validation(String),
    /// The job's current state does not allow the transition
    #[error("Conflict: {0}")]
    Conflict(String),
    /// No job with this id is queued
    #[error("Job not found: {0}")]
    NotFound(String),
    /// The repository failed; memory and store may disagree
    #[error("Persistence error: {0}")]
    Persistence(#[from] RepositoryError),
    /// The engine task is gone
    #[error("Queue engine is not running")]
    EngineStopped,
}

impl QueueError {
    /// Short category name used in API responses
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "validation",
            QueueError::Conflict(_) => "conflict",
            QueueError::NotFound(_) => "not_found",
            QueueError::Persistence(_) => "persistence",
            QueueError::EngineStopped => "unavailable",
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

/// Messages processed by the engine task
enum Command {
    Add {
        input_ref: String,
        output_ref: String,
        reply: Reply<Vec<QueueItem>>,
    },
    Pause {
        id: String,
        reply: Reply<Vec<QueueItem>>,
    },
    Unpause {
        id: String,
        reply: Reply<Vec<QueueItem>>,
    },
    Remove {
        id: String,
        reply: Reply<Vec<QueueItem>>,
    },
    Swap {
        first: String,
        second: String,
        reply: Reply<Vec<QueueItem>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<QueueItem>>,
    },
    Current {
        reply: oneshot::Sender<Option<QueueItem>>,
    },
    IsPaused {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Schedule,
    Progress {
        id: String,
        percent: f64,
    },
    FlushProgress {
        id: String,
    },
    Finished {
        id: String,
        outcome: JobOutcome,
    },
}

/// Handle to a running queue engine
///
/// Cloning the handle is cheap; the engine task stops once every handle is
/// dropped and no job is running.
#[derive(Clone)]
pub struct QueueEngine {
    name: &'static str,
    worker: Arc<dyn Worker>,
    tx: mpsc::UnboundedSender<Command>,
}

impl QueueEngine {
    /// Load persisted jobs, recover interrupted ones and start scheduling
    pub async fn start(
        worker: Arc<dyn Worker>,
        repository: Arc<dyn QueueRepository>,
        channel: Arc<dyn ProgressChannel>,
        config: EngineConfig,
    ) -> Result<Self, QueueError> {
        let name = worker.name();
        let items = recover_items(repository.as_ref()).await?;
        let next_index = items
            .iter()
            .filter_map(|item| item.queue_index)
            .max()
            .map_or(0, |max| max + 1);

        info!(
            "Starting {} queue with {} persisted jobs (collection {})",
            name,
            items.len(),
            repository.collection()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = EngineActor {
            name,
            worker: Arc::clone(&worker),
            repository,
            channel,
            throttle: ProgressThrottle::new(config.progress_interval),
            config,
            items,
            scheduling_in_progress: false,
            current: None,
            flush_scheduled_for: None,
            next_index,
            self_tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        let _ = tx.send(Command::Schedule);
        Ok(Self { name, worker, tx })
    }

    /// Name of the queue (also its collection and topic prefix)
    pub fn name(&self) -> &'static str {
        self.name
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| QueueError::EngineStopped)?;
        rx.await.map_err(|_| QueueError::EngineStopped)?
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| QueueError::EngineStopped)?;
        rx.await.map_err(|_| QueueError::EngineStopped)
    }

    /// Queue a new job for `input_ref`
    ///
    /// The input must be accepted by the worker and its output must not already
    /// exist. Scheduling happens after the reply; the returned snapshot shows
    /// the new job as pending.
    pub async fn add(&self, input_ref: &str) -> Result<Vec<QueueItem>, QueueError> {
        let output_ref = self
            .worker
            .output_ref_for(input_ref)
            .map_err(QueueError::Validation)?;

        let candidate = WorkerJob {
            id: String::new(),
            input_ref: input_ref.to_string(),
            output_ref: output_ref.clone(),
        };
        if self.worker.is_already_produced(&candidate).await {
            return Err(QueueError::Validation(format!(
                "{} has already been produced",
                output_ref
            )));
        }

        let input_ref = input_ref.to_string();
        self.request(|reply| Command::Add {
            input_ref,
            output_ref,
            reply,
        })
        .await
    }

    /// Hold back a pending job
    pub async fn pause(&self, id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let id = id.to_string();
        self.request(|reply| Command::Pause { id, reply }).await
    }

    /// Make a paused job eligible again
    pub async fn unpause(&self, id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let id = id.to_string();
        self.request(|reply| Command::Unpause { id, reply }).await
    }

    /// Remove a job, cancelling its worker when it is running
    pub async fn remove(&self, id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let id = id.to_string();
        self.request(|reply| Command::Remove { id, reply }).await
    }

    /// Exchange the positions of two pending jobs
    pub async fn swap(&self, first: &str, second: &str) -> Result<Vec<QueueItem>, QueueError> {
        let first = first.to_string();
        let second = second.to_string();
        self.request(|reply| Command::Swap {
            first,
            second,
            reply,
        })
        .await
    }

    /// Snapshot of the queue, processing job first
    pub async fn queue(&self) -> Result<Vec<QueueItem>, QueueError> {
        self.query(|reply| Command::Snapshot { reply }).await
    }

    /// The job currently handed to the worker, if any
    pub async fn current(&self) -> Result<Option<QueueItem>, QueueError> {
        self.query(|reply| Command::Current { reply }).await
    }

    /// Whether the job exists and is paused
    pub async fn is_paused(&self, id: &str) -> Result<bool, QueueError> {
        let id = id.to_string();
        self.query(|reply| Command::IsPaused { id, reply }).await
    }
}

/// Read every persisted job, demoting interrupted ones back to pending
///
/// A job stored as processing was running when the process died; its worker is
/// gone and its partial effects are treated as not done.
pub(crate) async fn recover_items(
    repository: &dyn QueueRepository,
) -> Result<Vec<QueueItem>, QueueError> {
    let mut items = repository.get_all().await?;

    for item in items.iter_mut().filter(|item| item.is_processing()) {
        info!("Recovering interrupted job {} as pending", item.id);
        item.status = JobStatus::Pending;
        item.progress_percent = None;
        repository.put(item).await?;
    }

    items.sort_by(|a, b| {
        (a.queue_index.is_none(), a.queue_index, a.created_at).cmp(&(
            b.queue_index.is_none(),
            b.queue_index,
            b.created_at,
        ))
    });
    Ok(items)
}

/// The job currently running on the worker
struct RunningJob {
    id: String,
    cancel: CancellationToken,
}

/// State owned by the engine task
struct EngineActor {
    name: &'static str,
    worker: Arc<dyn Worker>,
    repository: Arc<dyn QueueRepository>,
    channel: Arc<dyn ProgressChannel>,
    config: EngineConfig,
    /// Jobs in scheduling order
    items: Vec<QueueItem>,
    /// Re-entry guard: set from the moment a job is picked until it ends
    scheduling_in_progress: bool,
    current: Option<RunningJob>,
    throttle: ProgressThrottle,
    flush_scheduled_for: Option<String>,
    next_index: u64,
    self_tx: mpsc::WeakUnboundedSender<Command>,
}

impl EngineActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("{} queue engine running", self.name);

        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }

        if let Some(job) = self.current.take() {
            job.cancel.cancel();
        }
        info!("{} queue engine stopped", self.name);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Add {
                input_ref,
                output_ref,
                reply,
            } => {
                let _ = reply.send(self.add(input_ref, output_ref).await);
            }
            Command::Pause { id, reply } => {
                let _ = reply.send(self.pause(&id).await);
            }
            Command::Unpause { id, reply } => {
                let _ = reply.send(self.unpause(&id).await);
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(&id).await);
            }
            Command::Swap {
                first,
                second,
                reply,
            } => {
                let _ = reply.send(self.swap(&first, &second).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Current { reply } => {
                let current = self.items.iter().find(|item| item.is_processing()).cloned();
                let _ = reply.send(current);
            }
            Command::IsPaused { id, reply } => {
                let paused = self.find(&id).map_or(false, |idx| self.items[idx].is_paused());
                let _ = reply.send(paused);
            }
            Command::Schedule => self.schedule_next().await,
            Command::Progress { id, percent } => self.on_progress(&id, percent),
            Command::FlushProgress { id } => self.on_flush(&id),
            Command::Finished { id, outcome } => self.on_finished(&id, outcome).await,
        }
    }

    fn find(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn find_or_not_found(&self, id: &str) -> Result<usize, QueueError> {
        self.find(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    fn is_current(&self, id: &str) -> bool {
        self.current.as_ref().map_or(false, |job| job.id == id)
    }

    /// Queue copy with processing jobs first, otherwise in scheduling order
    fn snapshot(&self) -> Vec<QueueItem> {
        let mut queue = self.items.clone();
        queue.sort_by_key(|item| !item.is_processing());
        queue
    }

    fn topic(&self, event: &str) -> String {
        format!("{}:{}", self.name, event)
    }

    fn publish_changed(&self) {
        self.channel
            .publish(&self.topic("changed"), json!({ "queue": self.snapshot() }));
    }

    fn publish_progress(&self) {
        self.channel
            .publish(&self.topic("progress"), json!({ "queue": self.snapshot() }));
    }

    fn send_to_self(&self, command: Command) {
        if let Some(tx) = self.self_tx.upgrade() {
            let _ = tx.send(command);
        }
    }

    fn send_to_self_after(&self, delay: Duration, command: Command) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        if delay.is_zero() {
            let _ = tx.send(command);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command);
        });
    }

    async fn add(
        &mut self,
        input_ref: String,
        output_ref: String,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let item = QueueItem::new(
            Uuid::new_v4().to_string(),
            input_ref,
            output_ref,
            self.next_index,
        );

        if let Err(e) = self.repository.put(&item).await {
            error!("Failed to persist new {} job {}: {}", self.name, item.id, e);
            return Err(e.into());
        }

        info!(
            "Job {} added to {} queue: {} -> {}",
            item.id, self.name, item.input_ref, item.output_ref
        );
        self.next_index += 1;
        self.items.push(item);
        self.publish_changed();
        self.send_to_self(Command::Schedule);
        Ok(self.snapshot())
    }

    /// Persist `status` for the job at `idx`, then apply it in memory
    async fn transition(&mut self, idx: usize, status: JobStatus) -> Result<(), QueueError> {
        let mut updated = self.items[idx].clone();
        updated.status = status;

        if let Err(e) = self.repository.put(&updated).await {
            error!(
                "Failed to persist {} for job {}: {}",
                updated.status, updated.id, e
            );
            return Err(e.into());
        }
        self.items[idx] = updated;
        Ok(())
    }

    async fn pause(&mut self, id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let idx = self.find_or_not_found(id)?;
        let status = &self.items[idx].status;
        if *status != JobStatus::Pending {
            return Err(QueueError::Conflict(format!(
                "Job {} is {} and cannot be paused",
                id, status
            )));
        }

        self.transition(idx, JobStatus::Paused).await?;
        info!("Paused job {}", id);
        self.publish_changed();
        Ok(self.snapshot())
    }

    async fn unpause(&mut self, id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let idx = self.find_or_not_found(id)?;
        let status = &self.items[idx].status;
        if *status != JobStatus::Paused {
            return Err(QueueError::Conflict(format!(
                "Job {} is {} and cannot be resumed",
                id, status
            )));
        }

        self.transition(idx, JobStatus::Pending).await?;
        info!("Resumed job {}", id);
        self.publish_changed();
        self.send_to_self(Command::Schedule);
        Ok(self.snapshot())
    }

    async fn remove(&mut self, id: &str) -> Result<Vec<QueueItem>, QueueError> {
        let idx = self.find_or_not_found(id)?;

        if self.is_current(id) {
            if let Some(job) = self.current.take() {
                info!("Cancelling running job {}", id);
                job.cancel.cancel();
            }
            let output_ref = &self.items[idx].output_ref;
            if let Err(e) = self.worker.discard_output(output_ref).await {
                warn!("Failed to delete partial output {}: {}", output_ref, e);
            }
            self.scheduling_in_progress = false;
            self.throttle.reset();
            self.flush_scheduled_for = None;
        }

        let removed = self.items.remove(idx);
        let stored = self.repository.delete(&removed.id).await;

        info!("Removed job {} from {} queue", removed.id, self.name);
        self.publish_changed();
        self.send_to_self(Command::Schedule);

        if let Err(e) = stored {
            error!(
                "Failed to delete job {} from storage, it will reappear on restart: {}",
                removed.id, e
            );
            return Err(e.into());
        }
        Ok(self.snapshot())
    }

    async fn swap(&mut self, first: &str, second: &str) -> Result<Vec<QueueItem>, QueueError> {
        let a = self.find_or_not_found(first)?;
        let b = self.find_or_not_found(second)?;

        for idx in [a, b] {
            let item = &self.items[idx];
            if !item.is_pending() {
                return Err(QueueError::Conflict(format!(
                    "Job {} is {}; only pending jobs can be reordered",
                    item.id, item.status
                )));
            }
        }
        if a == b {
            return Ok(self.snapshot());
        }

        let mut moved_a = self.items[a].clone();
        let mut moved_b = self.items[b].clone();
        std::mem::swap(&mut moved_a.queue_index, &mut moved_b.queue_index);

        self.repository.put(&moved_a).await.map_err(|e| {
            error!("Failed to persist swap of {} and {}: {}", first, second, e);
            QueueError::from(e)
        })?;
        if let Err(e) = self.repository.put(&moved_b).await {
            error!("Failed to persist swap of {} and {}: {}", first, second, e);
            // Put the first job back the way it was stored
            if let Err(e) = self.repository.put(&self.items[a]).await {
                error!("Failed to roll back job {}: {}", first, e);
            }
            return Err(e.into());
        }

        self.items[a] = moved_b;
        self.items[b] = moved_a;
        info!("Swapped jobs {} and {}", first, second);
        self.publish_changed();
        Ok(self.snapshot())
    }

    /// Pick the first pending job and hand it to the worker
    async fn schedule_next(&mut self) {
        if self.scheduling_in_progress || self.items.is_empty() {
            return;
        }
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        self.scheduling_in_progress = true;

        let Some(idx) = self.items.iter().position(|item| item.is_pending()) else {
            debug!("No pending job in {} queue", self.name);
            self.scheduling_in_progress = false;
            return;
        };

        let mut item = self.items[idx].clone();
        item.status = JobStatus::Processing;
        // Progress is never stored
        item.progress_percent = None;
        if let Err(e) = self.repository.put(&item).await {
            error!(
                "Failed to persist processing state of job {}, stored copy is stale: {}",
                item.id, e
            );
        }
        item.progress_percent = Some(0.0);
        self.items[idx] = item.clone();

        let cancel = CancellationToken::new();
        self.current = Some(RunningJob {
            id: item.id.clone(),
            cancel: cancel.clone(),
        });
        self.throttle.reset();
        self.flush_scheduled_for = None;

        info!("Processing job {}: {}", item.id, item.input_ref);
        self.publish_changed();

        let job = WorkerJob {
            id: item.id,
            input_ref: item.input_ref,
            output_ref: item.output_ref,
        };
        let progress = {
            let tx = tx.clone();
            let id = job.id.clone();
            ProgressSink::new(cancel.clone(), move |percent| {
                let _ = tx.send(Command::Progress {
                    id: id.clone(),
                    percent,
                });
            })
        };
        let worker = Arc::clone(&self.worker);

        tokio::spawn(async move {
            let outcome = run_job(worker.as_ref(), &job, progress, cancel).await;
            let _ = tx.send(Command::Finished { id: job.id, outcome });
        });
    }

    fn on_progress(&mut self, id: &str, percent: f64) {
        if !self.is_current(id) {
            return;
        }
        let Some(idx) = self.find(id) else {
            return;
        };

        let item = &mut self.items[idx];
        if percent <= item.progress_percent.unwrap_or(0.0) {
            return;
        }
        item.progress_percent = Some(percent);

        match self.throttle.offer(Instant::now()) {
            Ok(()) => {
                debug!("Job {} at {:.1}%", id, percent);
                self.publish_progress();
            }
            Err(wait) => {
                if self.flush_scheduled_for.as_deref() != Some(id) {
                    self.flush_scheduled_for = Some(id.to_string());
                    self.send_to_self_after(wait, Command::FlushProgress { id: id.to_string() });
                }
            }
        }
    }

    fn on_flush(&mut self, id: &str) {
        if self.flush_scheduled_for.as_deref() != Some(id) {
            return;
        }
        self.flush_scheduled_for = None;
        if !self.is_current(id) {
            return;
        }

        if self.throttle.flush_due(Instant::now()) {
            self.publish_progress();
        } else if self.throttle.has_pending() {
            self.flush_scheduled_for = Some(id.to_string());
            self.send_to_self_after(
                Duration::from_millis(10),
                Command::FlushProgress { id: id.to_string() },
            );
        }
    }

    async fn on_finished(&mut self, id: &str, outcome: JobOutcome) {
        if !self.is_current(id) {
            debug!("Ignoring outcome of job {} which is no longer running", id);
            return;
        }
        self.current = None;
        self.flush_scheduled_for = None;
        self.throttle.reset();

        if let Some(idx) = self.find(id) {
            let skipped = matches!(outcome, JobOutcome::AlreadyProduced);
            match outcome {
                JobOutcome::Completed | JobOutcome::AlreadyProduced => {
                    if skipped {
                        info!("Job {} output already present, marked completed", id);
                    } else {
                        info!("Job {} completed successfully", id);
                    }

                    let mut completed = self.items.remove(idx);
                    completed.status = JobStatus::Completed;
                    completed.progress_percent = Some(100.0);
                    if let Err(e) = self.repository.delete(id).await {
                        error!(
                            "Failed to delete completed job {} from storage: {}",
                            id, e
                        );
                    }
                    self.channel.publish(
                        &self.topic("completed"),
                        json!({ "completedItem": completed, "queue": self.snapshot() }),
                    );
                }
                JobOutcome::Failed(e) => {
                    error!("Job {} failed: {}", id, e);

                    let item = &mut self.items[idx];
                    item.status = JobStatus::Failed {
                        reason: e.to_string(),
                    };
                    item.progress_percent = None;
                    if let Err(e) = self.repository.put(&self.items[idx]).await {
                        error!("Failed to persist failure of job {}: {}", id, e);
                    }
                    self.channel.publish(
                        &self.topic("failed"),
                        json!({ "failedItem": self.items[idx], "queue": self.snapshot() }),
                    );
                }
            }
        }

        self.scheduling_in_progress = false;
        if self.items.iter().any(|item| item.is_pending()) {
            self.send_to_self_after(self.config.reschedule_delay, Command::Schedule);
        }
    }
}

#[cfg(test)]
mod tests;
