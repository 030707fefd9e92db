// Media queue HTTP handlers
//
// This module contains the HTTP handlers for the media queue service.
// It provides the interface between HTTP requests and the queue facades.

pub mod routes;

use actix_web::web;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::facade::QueueFacade;

/// The queue facades served by this process, keyed by queue name
#[derive(Clone, Default)]
pub struct QueueRegistry {
    queues: Arc<HashMap<&'static str, QueueFacade>>,
}

impl QueueRegistry {
    pub fn new(facades: impl IntoIterator<Item = QueueFacade>) -> Self {
        let queues = facades
            .into_iter()
            .map(|facade| (facade.name(), facade))
            .collect();
        Self {
            queues: Arc::new(queues),
        }
    }

    /// Look up a queue by the name used in the URL
    pub fn get(&self, name: &str) -> Result<&QueueFacade, HandlerError> {
        self.queues
            .get(name)
            .ok_or_else(|| HandlerError::UnknownQueue(name.to_string()))
    }

    /// Queue names in alphabetical order
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.queues.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Register every route on an actix `App` or scope
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(routes::health)
        .service(routes::events)
        .service(routes::get_queue)
        .service(routes::current_job)
        .service(routes::add_job)
        .service(routes::pause_job)
        .service(routes::unpause_job)
        .service(routes::job_paused)
        .service(routes::remove_job)
        .service(routes::swap_jobs);
}
