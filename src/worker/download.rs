//! Download worker streaming HTTP(S) resources to disk

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ProgressSink, Worker, WorkerError, WorkerJob};
use crate::config::DownloadConfig;

/// File name used when a URL has no usable last path segment
const FALLBACK_FILE_NAME: &str = "download";

pub struct DownloadWorker {
    config: DownloadConfig,
    client: reqwest::Client,
}

impl DownloadWorker {
    pub fn new(config: DownloadConfig) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, client })
    }

    async fn remote_length(&self, url: &str) -> Option<u64> {
        match self.client.head(url).send().await {
            Ok(response) if response.status().is_success() => response.content_length(),
            Ok(response) => {
                debug!("HEAD {} answered {}", url, response.status());
                None
            }
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                None
            }
        }
    }
}

#[async_trait]
impl Worker for DownloadWorker {
    fn name(&self) -> &'static str {
        "download"
    }

    fn output_ref_for(&self, input_ref: &str) -> Result<String, String> {
        let url = Url::parse(input_ref).map_err(|e| format!("Invalid URL {}: {}", input_ref, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("Unsupported URL scheme: {}", url.scheme()));
        }

        let file_name = file_name_for(&url);
        Ok(Path::new(&self.config.download_dir)
            .join(file_name)
            .to_string_lossy()
            .to_string())
    }

    async fn is_already_produced(&self, job: &WorkerJob) -> bool {
        let local_length = match tokio::fs::metadata(&job.output_ref).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => metadata.len(),
            _ => return false,
        };
        self.remote_length(&job.input_ref).await == Some(local_length)
    }

    async fn run(
        &self,
        job: &WorkerJob,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        if let Some(parent) = Path::new(&job.output_ref).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Downloading {} to {}", job.input_ref, job.output_ref);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            response = self.client.get(&job.input_ref).send() => response?,
        };
        if !response.status().is_success() {
            return Err(WorkerError::Status(response.status().as_u16()));
        }

        let total = response.content_length().filter(|len| *len > 0);
        if total.is_none() {
            warn!(
                "No content length for {}, progress will not be reported",
                job.input_ref
            );
        }

        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        let mut file = tokio::fs::File::create(&job.output_ref).await?;
        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Download of job {} cancelled", job.id);
                    return Err(WorkerError::Cancelled);
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        file.write_all(&bytes).await?;
                        received += bytes.len() as u64;
                        if let Some(total) = total {
                            progress.report(received as f64 / total as f64 * 100.0);
                        }
                    }
                    Some(Err(e)) => return Err(WorkerError::Http(e)),
                    None => break,
                }
            }
        }

        file.flush().await?;
        info!("Downloaded {} bytes for job {}", received, job.id);
        Ok(())
    }
}

/// Derive a safe local file name from the last path segment of a URL
fn file_name_for(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("");

    let sanitized: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = sanitized.trim_matches('.');
    if trimmed.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
