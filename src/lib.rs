// Media Queue Library
//
// This crate provides durable job queues for long-running media work
// (transcoding with ffmpeg, HTTP downloads) with one job in flight per queue,
// pause/resume, cancellation with cleanup, crash recovery and throttled
// progress events, exposed over an HTTP API.

pub mod config;
pub mod config_loader;
pub mod error;
pub mod facade;
pub mod handlers;
pub mod models;
pub mod progress;
pub mod queue_engine;
pub mod repository;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export common types for easier access
pub use config::{DownloadConfig, EngineConfig, ServerConfig, StorageConfig, TranscodeConfig};
pub use error::HandlerError;
pub use facade::QueueFacade;
pub use handlers::QueueRegistry;
pub use models::{JobStatus, QueueItem, QueueResponse};
pub use progress::{BroadcastChannel, ProgressChannel, QueueEvent};
pub use queue_engine::{QueueEngine, QueueError};
pub use repository::{FileRepository, MemoryRepository, QueueRepository, RepositoryError};
pub use worker::{DownloadWorker, TranscodeWorker, Worker, WorkerError};
