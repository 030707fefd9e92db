//! Transcode worker backed by ffmpeg
//!
//! Runs `ffmpeg -progress pipe:1` as a child process and turns the reported
//! `out_time` into a percentage of the input duration probed with ffprobe.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{ProgressSink, Worker, WorkerError, WorkerJob};
use crate::config::TranscodeConfig;

/// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 8;

pub struct TranscodeWorker {
    config: TranscodeConfig,
}

impl TranscodeWorker {
    pub fn new(config: TranscodeConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, job: &WorkerJob) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostdin",
            "-nostats",
            "-loglevel",
            "error",
            "-y",
            "-i",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(job.input_ref.clone());
        args.extend(self.config.extra_args.iter().cloned());
        args.extend(["-progress".to_string(), "pipe:1".to_string()]);
        args.push(job.output_ref.clone());
        args
    }

    /// Read the container duration of a media file, in seconds
    async fn read_duration(&self, path: &str) -> Option<f64> {
        let output = Command::new(&self.config.ffprobe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
                path,
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| warn!("Failed to run ffprobe on {}: {}", path, e))
            .ok()?;

        if !output.status.success() {
            debug!("ffprobe could not read {}", path);
            return None;
        }
        parse_duration_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl Worker for TranscodeWorker {
    fn name(&self) -> &'static str {
        "transcode"
    }

    fn output_ref_for(&self, input_ref: &str) -> Result<String, String> {
        let path = Path::new(input_ref);
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| format!("{} has no file extension", input_ref))?;

        if extension == self.config.target_extension {
            return Err(format!(
                "{} is already a .{} file",
                input_ref, self.config.target_extension
            ));
        }
        if !self.config.source_extensions.contains(&extension) {
            return Err(format!("Unsupported file type: .{}", extension));
        }

        Ok(path
            .with_extension(&self.config.target_extension)
            .to_string_lossy()
            .to_string())
    }

    async fn is_already_produced(&self, job: &WorkerJob) -> bool {
        if !Path::new(&job.output_ref).is_file() {
            return false;
        }
        let Some(output_duration) = self.read_duration(&job.output_ref).await else {
            return false;
        };
        let Some(input_duration) = self.read_duration(&job.input_ref).await else {
            return false;
        };

        output_duration + self.config.duration_tolerance_seconds >= input_duration
    }

    async fn run(
        &self,
        job: &WorkerJob,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        let total_seconds = tokio::select! {
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            duration = self.read_duration(&job.input_ref) => duration,
        };
        if total_seconds.is_none() {
            warn!(
                "Unknown duration for {}, progress will not be reported",
                job.input_ref
            );
        }

        if cancel.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }

        let args = self.build_args(job);
        info!("Starting ffmpeg for job {} with args: {:?}", job.id, args);

        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn {
                program: self.config.ffmpeg_path.clone(),
                source: e,
            })?;

        // Drain stderr so the pipe never fills, keeping the last lines for errors
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Transcode of job {} cancelled", job.id);
                        let _ = child.kill().await;
                        return Err(WorkerError::Cancelled);
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(percent) = parse_progress_line(&line, total_seconds) {
                                progress.report(percent);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Error reading ffmpeg output for job {}: {}", job.id, e);
                            break;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(WorkerError::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(WorkerError::Exit {
                code: status.code(),
                stderr,
            });
        }
        Ok(())
    }
}

/// Parse the single value printed by ffprobe for `format=duration`
fn parse_duration_output(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .find_map(|line| line.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Parse one `key=value` line of `-progress` output into a percentage
fn parse_progress_line(line: &str, total_seconds: Option<f64>) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(100.0),
        "out_time" => {
            let total = total_seconds?;
            let current = parse_time(value)?;
            Some((current / total * 100.0).min(100.0))
        }
        _ => None,
    }
}

/// Parse a time string (HH:MM:SS.micro) to seconds
fn parse_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    // ffmpeg prints a negative placeholder before the first frame
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
