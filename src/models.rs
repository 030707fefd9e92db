// Media queue data models
//
// This module contains the job model shared by the engine, the repository and
// the HTTP layer, plus the request and response bodies of the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued job
///
/// The legacy `paused` flag is derived from this value when an item is
/// serialized, so the two can never disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for the scheduler
    Pending,
    /// Currently handed to a worker
    Processing,
    /// Held back by the caller; never scheduled
    Paused,
    /// Worker finished successfully
    Completed,
    /// Worker reported an error
    Failed { reason: String },
}

impl JobStatus {
    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of schedulable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "QueueItemRecord", into = "QueueItemRecord")]
pub struct QueueItem {
    /// Unique identifier (UUID v4), never reused
    pub id: String,
    /// Source of the work (file path or URL)
    pub input_ref: String,
    /// Destination of the work, derived from `input_ref` at creation
    pub output_ref: String,
    pub status: JobStatus,
    /// Last known completion percentage while processing
    pub progress_percent: Option<f64>,
    /// Explicit ordering key, exchanged by swap
    pub queue_index: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Create a new pending item
    pub fn new(id: String, input_ref: String, output_ref: String, queue_index: u64) -> Self {
        Self {
            id,
            input_ref,
            output_ref,
            status: JobStatus::Pending,
            progress_percent: None,
            queue_index: Some(queue_index),
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == JobStatus::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.status == JobStatus::Processing
    }

    pub fn is_paused(&self) -> bool {
        self.status == JobStatus::Paused
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StatusTag {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
}

/// Wire and storage representation of a [`QueueItem`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueItemRecord {
    id: String,
    input_ref: String,
    output_ref: String,
    status: StatusTag,
    #[serde(default)]
    paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    queue_index: Option<u64>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

impl From<QueueItem> for QueueItemRecord {
    fn from(item: QueueItem) -> Self {
        let paused = item.is_paused();
        let (status, error) = match item.status {
            JobStatus::Pending => (StatusTag::Pending, None),
            JobStatus::Processing => (StatusTag::Processing, None),
            JobStatus::Paused => (StatusTag::Paused, None),
            JobStatus::Completed => (StatusTag::Completed, None),
            JobStatus::Failed { reason } => (StatusTag::Failed, Some(reason)),
        };

        Self {
            id: item.id,
            input_ref: item.input_ref,
            output_ref: item.output_ref,
            status,
            paused,
            error,
            progress_percent: item.progress_percent,
            queue_index: item.queue_index,
            created_at: item.created_at,
        }
    }
}

impl From<QueueItemRecord> for QueueItem {
    fn from(record: QueueItemRecord) -> Self {
        // Older writers only flipped the boolean
        let status = match record.status {
            StatusTag::Pending if record.paused => JobStatus::Paused,
            StatusTag::Pending => JobStatus::Pending,
            StatusTag::Processing => JobStatus::Processing,
            StatusTag::Paused => JobStatus::Paused,
            StatusTag::Completed => JobStatus::Completed,
            StatusTag::Failed => JobStatus::Failed {
                reason: record.error.unwrap_or_default(),
            },
        };

        Self {
            id: record.id,
            input_ref: record.input_ref,
            output_ref: record.output_ref,
            status,
            progress_percent: record.progress_percent,
            queue_index: record.queue_index,
            created_at: record.created_at,
        }
    }
}

/// Request body for adding a job
#[derive(Debug, Deserialize)]
pub struct AddJobRequest {
    /// Source path or URL of the job
    pub input: String,
}

/// Request body for swapping two jobs
#[derive(Debug, Deserialize)]
pub struct SwapJobsRequest {
    pub first: String,
    pub second: String,
}

/// Response shape shared by every queue operation
///
/// The queue snapshot is always present so callers can re-render regardless of
/// the outcome.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure category (validation, conflict, not_found, persistence)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    pub queue: Vec<QueueItem>,
}

impl QueueResponse {
    pub fn ok(queue: Vec<QueueItem>) -> Self {
        Self {
            success: true,
            error: None,
            kind: None,
            queue,
        }
    }

    pub fn failed(kind: &'static str, error: String, queue: Vec<QueueItem>) -> Self {
        Self {
            success: false,
            error: Some(error),
            kind: Some(kind),
            queue,
        }
    }
}

/// Response for pause state requests
#[derive(Debug, Serialize)]
pub struct PausedResponse {
    pub paused: bool,
}

/// Error response for API
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}
