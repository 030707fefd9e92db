//! Workers executing queued jobs
//!
//! A [`Worker`] is one kind of external work (transcode, download). The engine
//! owns the scheduling; a worker only knows how to validate an input, derive
//! its output, check whether the output already exists, and run one job until
//! it either finishes or is cancelled.

pub mod download;
pub mod transcode;

use async_trait::async_trait;
use log::debug;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use download::DownloadWorker;
pub use transcode::TranscodeWorker;

/// Errors raised while running a job
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The external program could not be started
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    /// I/O error while reading or writing job files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The external program exited unsuccessfully
    #[error("Process exited with {}: {stderr}", describe_exit(.code))]
    Exit { code: Option<i32>, stderr: String },
    /// Network error during a download
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The remote server answered with an error status
    #[error("Server responded with status {0}")]
    Status(u16),
    /// The job was cancelled before it finished
    #[error("Job was cancelled")]
    Cancelled,
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {}", c),
        None => "a signal".to_string(),
    }
}

/// The references a worker needs to run one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub id: String,
    pub input_ref: String,
    pub output_ref: String,
}

/// Progress callback handed to a running worker
///
/// Reports are clamped to 0..=100 and silently dropped once the job has been
/// cancelled, so nothing is emitted after `cancel()`.
#[derive(Clone)]
pub struct ProgressSink {
    cancel: CancellationToken,
    report: Arc<dyn Fn(f64) + Send + Sync>,
}

impl ProgressSink {
    pub fn new<F>(cancel: CancellationToken, report: F) -> Self
    where
        F: Fn(f64) + Send + Sync + 'static,
    {
        Self {
            cancel,
            report: Arc::new(report),
        }
    }

    /// A sink that discards every report
    pub fn noop() -> Self {
        Self::new(CancellationToken::new(), |_| {})
    }

    pub fn report(&self, percent: f64) {
        if self.cancel.is_cancelled() || !percent.is_finite() {
            return;
        }
        (self.report)(percent.clamp(0.0, 100.0));
    }
}

/// One kind of externally executed work
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Queue name, used as repository collection and event topic prefix
    fn name(&self) -> &'static str;

    /// Validate an input and derive the output reference it will produce.
    /// Returns the rejection reason when the input is not eligible.
    fn output_ref_for(&self, input_ref: &str) -> Result<String, String>;

    /// Whether the output of `job` already exists and verifies as complete
    async fn is_already_produced(&self, job: &WorkerJob) -> bool;

    /// Run one job to its end. Must watch `cancel` and return promptly
    /// (typically with [`WorkerError::Cancelled`]) once it fires.
    async fn run(
        &self,
        job: &WorkerJob,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError>;

    /// Delete whatever the job produced so far
    async fn discard_output(&self, output_ref: &str) -> io::Result<()> {
        match tokio::fs::remove_file(output_ref).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Terminal outcome of one scheduled job
#[derive(Debug)]
pub enum JobOutcome {
    /// The worker ran and succeeded
    Completed,
    /// The output already existed; the worker was never started
    AlreadyProduced,
    Failed(WorkerError),
}

/// Drive one job: skip it when its output already verifies, otherwise run the
/// worker. Always yields exactly one outcome.
pub async fn run_job(
    worker: &dyn Worker,
    job: &WorkerJob,
    progress: ProgressSink,
    cancel: CancellationToken,
) -> JobOutcome {
    if cancel.is_cancelled() {
        return JobOutcome::Failed(WorkerError::Cancelled);
    }

    if worker.is_already_produced(job).await {
        debug!("Output {} already produced, skipping worker", job.output_ref);
        return JobOutcome::AlreadyProduced;
    }

    // Removed while the output check was running
    if cancel.is_cancelled() {
        return JobOutcome::Failed(WorkerError::Cancelled);
    }

    match worker.run(job, progress, cancel).await {
        Ok(()) => JobOutcome::Completed,
        Err(e) => JobOutcome::Failed(e),
    }
}
