// Media queue configuration
//
// This module contains configuration structures and constants for the media queue service.
// Every value can be overridden through an environment variable; `config_loader` can seed
// those variables from a TOML file before the structures below are built.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default values for configuration
pub mod defaults {
    // Server binding
    pub const HOST: &str = "127.0.0.1";
    pub const PORT: u16 = 8282;
    pub const KEEPALIVE_SECONDS: u64 = 75;

    // Directory holding the persisted queue collections
    pub const DATA_DIR: &str = "./data";

    // Minimum interval between two progress broadcasts for the same job
    pub const PROGRESS_INTERVAL_MS: u64 = 2000;

    // Delay before the scheduler looks again after a job ended
    pub const RESCHEDULE_DELAY_MS: u64 = 1000;

    // External transcode tools
    pub const FFMPEG_PATH: &str = "ffmpeg";
    pub const FFPROBE_PATH: &str = "ffprobe";
    pub const TRANSCODE_TARGET_EXTENSION: &str = "mp4";
    pub const TRANSCODE_SOURCE_EXTENSIONS: &str = "avi,mkv,wmv,flv,mov,m4v,mpg,mpeg,ts,webm,3gp";

    // Tolerance when comparing measured durations, in seconds
    pub const DURATION_TOLERANCE_SECONDS: f64 = 1.0;

    // Downloads
    pub const DOWNLOAD_DIR: &str = "./downloads";
    pub const DOWNLOAD_CONNECT_TIMEOUT_SECONDS: u64 = 30;
}

/// Configuration errors detected before startup
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| String::from(default))
}

/// Scheduling behaviour shared by every queue instance
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Minimum interval between progress broadcasts
    pub progress_interval: Duration,
    /// Delay before rescheduling once a job reached a terminal state
    pub reschedule_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_millis(env_or(
                "MEDIA_QUEUE_PROGRESS_INTERVAL_MS",
                defaults::PROGRESS_INTERVAL_MS,
            )),
            reschedule_delay: Duration::from_millis(env_or(
                "MEDIA_QUEUE_RESCHEDULE_DELAY_MS",
                defaults::RESCHEDULE_DELAY_MS,
            )),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.progress_interval.is_zero() {
            return Err(ConfigError::Zero("MEDIA_QUEUE_PROGRESS_INTERVAL_MS"));
        }
        Ok(())
    }
}

/// HTTP server settings
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// Number of HTTP workers (defaults to the number of CPU cores)
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let workers = env_or("MEDIA_QUEUE_HTTP_WORKERS", 0usize);
        Self {
            host: env_string("MEDIA_QUEUE_HOST", defaults::HOST),
            port: env_or("MEDIA_QUEUE_PORT", defaults::PORT),
            keep_alive: Duration::from_secs(env_or(
                "MEDIA_QUEUE_KEEPALIVE",
                defaults::KEEPALIVE_SECONDS,
            )),
            workers: if workers == 0 { num_cpus::get() } else { workers },
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Empty("MEDIA_QUEUE_HOST"));
        }
        if self.port == 0 {
            return Err(ConfigError::Zero("MEDIA_QUEUE_PORT"));
        }
        Ok(())
    }
}

/// Where the queue collections are stored
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: env_string("MEDIA_QUEUE_DATA_DIR", defaults::DATA_DIR),
        }
    }
}

/// Settings of the ffmpeg-based transcode worker
#[derive(Clone, Debug)]
pub struct TranscodeConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Extension of produced files, without the dot
    pub target_extension: String,
    /// Lower-case source extensions accepted by the queue
    pub source_extensions: Vec<String>,
    /// Extra ffmpeg arguments placed between input and output
    pub extra_args: Vec<String>,
    pub duration_tolerance_seconds: f64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        let source_extensions = env_string(
            "MEDIA_QUEUE_TRANSCODE_EXTENSIONS",
            defaults::TRANSCODE_SOURCE_EXTENSIONS,
        );
        let extra_args = env::var("MEDIA_QUEUE_FFMPEG_ARGS").unwrap_or_default();

        Self {
            ffmpeg_path: env_string("FFMPEG_PATH", defaults::FFMPEG_PATH),
            ffprobe_path: env_string("FFPROBE_PATH", defaults::FFPROBE_PATH),
            target_extension: defaults::TRANSCODE_TARGET_EXTENSION.to_string(),
            source_extensions: split_list(&source_extensions),
            extra_args: extra_args.split_whitespace().map(String::from).collect(),
            duration_tolerance_seconds: env_or(
                "MEDIA_QUEUE_DURATION_TOLERANCE",
                defaults::DURATION_TOLERANCE_SECONDS,
            ),
        }
    }
}

impl TranscodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ffmpeg_path.trim().is_empty() {
            return Err(ConfigError::Empty("FFMPEG_PATH"));
        }
        if self.ffprobe_path.trim().is_empty() {
            return Err(ConfigError::Empty("FFPROBE_PATH"));
        }
        if self.source_extensions.is_empty() {
            return Err(ConfigError::Empty("MEDIA_QUEUE_TRANSCODE_EXTENSIONS"));
        }
        Ok(())
    }
}

/// Settings of the HTTP download worker
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    pub download_dir: String,
    pub connect_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: env_string("MEDIA_QUEUE_DOWNLOAD_DIR", defaults::DOWNLOAD_DIR),
            connect_timeout: Duration::from_secs(env_or(
                "MEDIA_QUEUE_DOWNLOAD_CONNECT_TIMEOUT",
                defaults::DOWNLOAD_CONNECT_TIMEOUT_SECONDS,
            )),
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_dir.trim().is_empty() {
            return Err(ConfigError::Empty("MEDIA_QUEUE_DOWNLOAD_DIR"));
        }
        Ok(())
    }
}

/// Split a comma separated list into trimmed, lower-case entries
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
