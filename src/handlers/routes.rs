// API route handlers for the media queue
//
// This module contains the route handlers for the media queue service.
// Every queue route starts with `/queues/{queue}`, where `{queue}` is the name
// of one of the running queues (`transcode` or `download`).

use actix_web::http::header;
use actix_web::{delete, get, post, web, HttpResponse};
use futures::stream;
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::broadcast;

use super::QueueRegistry;
use crate::error::{status_for_kind, HandlerError};
use crate::models::{AddJobRequest, PausedResponse, QueueResponse, SwapJobsRequest};
use crate::progress::BroadcastChannel;

/// Turn a facade response into an HTTP response
///
/// Failures keep the `{success, error, queue}` body and only change the status
/// code, so clients can always re-render the queue.
fn respond(response: QueueResponse) -> HttpResponse {
    if response.success {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::build(status_for_kind(response.kind)).json(response)
    }
}

/// Liveness check listing the running queues
#[get("/health")]
pub async fn health(registry: web::Data<QueueRegistry>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "queues": registry.names(),
    }))
}

/// Server-sent events stream of every published queue event
///
/// Each event is sent with its topic as the SSE event name and the full
/// `{topic, payload}` object as data. Clients that fall behind skip the events
/// they missed.
#[get("/events")]
pub async fn events(channel: web::Data<BroadcastChannel>) -> HttpResponse {
    info!("Event stream opened ({} observers)", channel.subscriber_count() + 1);
    let rx = channel.subscribe();

    let body = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = match serde_json::to_string(&event) {
                        Ok(data) => data,
                        Err(e) => {
                            warn!("Failed to encode {} event: {}", event.topic, e);
                            continue;
                        }
                    };
                    let chunk = web::Bytes::from(format!(
                        "event: {}\ndata: {}\n\n",
                        event.topic, data
                    ));
                    return Some((Ok::<_, actix_web::Error>(chunk), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event stream lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(body)
}

/// Current queue snapshot, processing job first
#[get("/queues/{queue}")]
pub async fn get_queue(
    queue: web::Path<String>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let facade = registry.get(&queue)?;
    Ok(respond(facade.get_queue().await))
}

/// The job being processed, or `null`
#[get("/queues/{queue}/current")]
pub async fn current_job(
    queue: web::Path<String>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let facade = registry.get(&queue)?;
    let current = facade.get_currently_processing().await?;
    Ok(HttpResponse::Ok().json(current))
}

/// Queue a new job
///
/// The body is `{"input": "..."}`: a file path for the transcode queue, an
/// http(s) URL for the download queue.
#[post("/queues/{queue}/jobs")]
pub async fn add_job(
    queue: web::Path<String>,
    body: web::Json<AddJobRequest>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let facade = registry.get(&queue)?;
    Ok(respond(facade.add_job(&body.input).await))
}

#[post("/queues/{queue}/jobs/{id}/pause")]
pub async fn pause_job(
    path: web::Path<(String, String)>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let (queue, id) = path.into_inner();
    let facade = registry.get(&queue)?;
    Ok(respond(facade.pause_job(&id).await))
}

#[post("/queues/{queue}/jobs/{id}/unpause")]
pub async fn unpause_job(
    path: web::Path<(String, String)>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let (queue, id) = path.into_inner();
    let facade = registry.get(&queue)?;
    Ok(respond(facade.unpause_job(&id).await))
}

#[get("/queues/{queue}/jobs/{id}/paused")]
pub async fn job_paused(
    path: web::Path<(String, String)>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let (queue, id) = path.into_inner();
    let facade = registry.get(&queue)?;
    let paused = facade.is_paused(&id).await?;
    Ok(HttpResponse::Ok().json(PausedResponse { paused }))
}

/// Remove a job in any state
///
/// A job that is being processed is cancelled and its partial output deleted.
#[delete("/queues/{queue}/jobs/{id}")]
pub async fn remove_job(
    path: web::Path<(String, String)>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let (queue, id) = path.into_inner();
    let facade = registry.get(&queue)?;
    Ok(respond(facade.remove_job(&id).await))
}

/// Exchange the positions of two pending jobs
#[post("/queues/{queue}/swap")]
pub async fn swap_jobs(
    queue: web::Path<String>,
    body: web::Json<SwapJobsRequest>,
    registry: web::Data<QueueRegistry>,
) -> Result<HttpResponse, HandlerError> {
    let facade = registry.get(&queue)?;
    Ok(respond(facade.swap_jobs(&body.first, &body.second).await))
}
