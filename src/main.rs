use actix_web::{middleware::Logger, web, App, HttpServer};
use env_logger::Env;
use log::{error, info};
use std::fmt::Display;
use std::io;
use std::sync::Arc;

use media_queue::config_loader::load_config;
use media_queue::handlers::configure;
use media_queue::{
    BroadcastChannel, DownloadConfig, DownloadWorker, EngineConfig, FileRepository, QueueEngine,
    QueueFacade, QueueRegistry, ServerConfig, StorageConfig, TranscodeConfig, TranscodeWorker,
    Worker,
};

/// Log a fatal startup error and turn it into the error returned by `main`
fn startup_error(context: &str, e: impl Display) -> io::Error {
    error!("{}: {}", context, e);
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, e))
}

/// Open the collection named after the worker and start its engine
async fn start_queue(
    worker: Arc<dyn Worker>,
    storage: &StorageConfig,
    channel: &BroadcastChannel,
    engine_config: &EngineConfig,
) -> io::Result<QueueFacade> {
    let name = worker.name();
    let repository = FileRepository::open(&storage.data_dir, name)
        .await
        .map_err(|e| startup_error(&format!("Failed to open {} collection", name), e))?;
    info!("{} queue stored in {}", name, repository.path().display());

    let engine = QueueEngine::start(
        worker,
        Arc::new(repository),
        Arc::new(channel.clone()),
        engine_config.clone(),
    )
    .await
    .map_err(|e| startup_error(&format!("Failed to start {} queue", name), e))?;

    Ok(QueueFacade::new(engine))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // Seed the environment from the config file, then build the configurations
    if !load_config() {
        info!("No configuration file loaded, using environment and defaults");
    }
    let engine_config = EngineConfig::default();
    let server_config = ServerConfig::default();
    let storage_config = StorageConfig::default();
    let transcode_config = TranscodeConfig::default();
    let download_config = DownloadConfig::default();

    engine_config
        .validate()
        .map_err(|e| startup_error("Invalid engine configuration", e))?;
    server_config
        .validate()
        .map_err(|e| startup_error("Invalid server configuration", e))?;
    transcode_config
        .validate()
        .map_err(|e| startup_error("Invalid transcode configuration", e))?;
    download_config
        .validate()
        .map_err(|e| startup_error("Invalid download configuration", e))?;

    info!("Data directory: {}", storage_config.data_dir);
    info!("ffmpeg command: {}", transcode_config.ffmpeg_path);
    info!("Download directory: {}", download_config.download_dir);
    info!(
        "Progress interval: {:?}, reschedule delay: {:?}",
        engine_config.progress_interval, engine_config.reschedule_delay
    );

    // One broadcast channel shared by every queue and every observer
    let channel = BroadcastChannel::default();

    let transcode_worker = Arc::new(TranscodeWorker::new(transcode_config));
    let download_worker = Arc::new(
        DownloadWorker::new(download_config)
            .map_err(|e| startup_error("Failed to build HTTP client", e))?,
    );

    let transcode = start_queue(transcode_worker, &storage_config, &channel, &engine_config).await?;
    let download = start_queue(download_worker, &storage_config, &channel, &engine_config).await?;
    let registry = QueueRegistry::new([transcode, download]);

    info!(
        "Starting media queue server on http://{}:{} with {} workers",
        server_config.host, server_config.port, server_config.workers
    );

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(channel.clone()))
            .configure(configure)
    })
    .workers(server_config.workers)
    .bind((server_config.host.as_str(), server_config.port))?
    .keep_alive(server_config.keep_alive)
    .run()
    .await
}
