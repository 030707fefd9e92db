//! Caller-facing queue operations
//!
//! The facade checks ids and inputs before they reach the engine and shapes
//! every mutation result into a [`QueueResponse`] that always carries the
//! current queue.

use log::{debug, warn};
use uuid::Uuid;

use crate::models::{QueueItem, QueueResponse};
use crate::queue_engine::{QueueEngine, QueueError};

#[derive(Clone)]
pub struct QueueFacade {
    engine: QueueEngine,
}

impl QueueFacade {
    pub fn new(engine: QueueEngine) -> Self {
        Self { engine }
    }

    pub fn name(&self) -> &'static str {
        self.engine.name()
    }

    pub async fn add_job(&self, input: &str) -> QueueResponse {
        let result = match validate_input(input) {
            Ok(input) => self.engine.add(input).await,
            Err(e) => Err(e),
        };
        self.respond(result).await
    }

    pub async fn pause_job(&self, id: &str) -> QueueResponse {
        let result = match validate_id(id) {
            Ok(()) => self.engine.pause(id).await,
            Err(e) => Err(e),
        };
        self.respond(result).await
    }

    pub async fn unpause_job(&self, id: &str) -> QueueResponse {
        let result = match validate_id(id) {
            Ok(()) => self.engine.unpause(id).await,
            Err(e) => Err(e),
        };
        self.respond(result).await
    }

    pub async fn remove_job(&self, id: &str) -> QueueResponse {
        let result = match validate_id(id) {
            Ok(()) => self.engine.remove(id).await,
            Err(e) => Err(e),
        };
        self.respond(result).await
    }

    pub async fn swap_jobs(&self, first: &str, second: &str) -> QueueResponse {
        let result = match validate_swap(first, second) {
            Ok(()) => self.engine.swap(first, second).await,
            Err(e) => Err(e),
        };
        self.respond(result).await
    }

    pub async fn get_queue(&self) -> QueueResponse {
        let result = self.engine.queue().await;
        self.respond(result).await
    }

    pub async fn is_paused(&self, id: &str) -> Result<bool, QueueError> {
        validate_id(id)?;
        self.engine.is_paused(id).await
    }

    pub async fn get_currently_processing(&self) -> Result<Option<QueueItem>, QueueError> {
        self.engine.current().await
    }

    async fn respond(&self, result: Result<Vec<QueueItem>, QueueError>) -> QueueResponse {
        match result {
            Ok(queue) => QueueResponse::ok(queue),
            Err(e) => {
                match e {
                    QueueError::Persistence(_) | QueueError::EngineStopped => {
                        warn!("{} queue operation failed: {}", self.name(), e)
                    }
                    _ => debug!("{} queue rejected request: {}", self.name(), e),
                }
                let queue = self.engine.queue().await.unwrap_or_default();
                QueueResponse::failed(e.kind(), e.to_string(), queue)
            }
        }
    }
}

fn validate_id(id: &str) -> Result<(), QueueError> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| QueueError::Validation(format!("Invalid job id: {}", id)))
}

fn validate_input(input: &str) -> Result<&str, QueueError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(QueueError::Validation("Input must not be empty".to_string()));
    }
    if input.contains('\0') {
        return Err(QueueError::Validation(
            "Input must not contain NUL characters".to_string(),
        ));
    }
    Ok(input)
}

fn validate_swap(first: &str, second: &str) -> Result<(), QueueError> {
    validate_id(first)?;
    validate_id(second)?;
    if first == second {
        return Err(QueueError::Validation(
            "Cannot swap a job with itself".to_string(),
        ));
    }
    Ok(())
}
