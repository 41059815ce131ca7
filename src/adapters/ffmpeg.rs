//! Worker backed by ffmpeg child processes.
//!
//! One process per job. Progress is scraped from ffmpeg's stderr status
//! lines; pause and resume stop and continue the process with signals.

use anyhow::Result;
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::gateway::{FormatInfo, GatewayError, Metadata, StreamInfo, WorkerGateway};
use crate::core::{JobId, Notification, ProgressType, ResolvedJob, RunningMessage};

struct Process {
    pid: Option<u32>,
    cancel: CancellationToken,
}

type Processes = Arc<Mutex<HashMap<JobId, Process>>>;

pub struct FfmpegWorker {
    ffmpeg: String,
    ffprobe: String,
    processes: Processes,
    parser: Arc<StatusParser>,
    tx: mpsc::Sender<Notification>,
}

impl FfmpegWorker {
    pub fn new(config: &AppConfig, tx: mpsc::Sender<Notification>) -> Result<Self> {
        Ok(Self {
            ffmpeg: config.ffmpeg_program.clone(),
            ffprobe: config.ffprobe_program.clone(),
            processes: Arc::new(Mutex::new(HashMap::new())),
            parser: Arc::new(StatusParser::new()?),
            tx,
        })
    }

    async fn signal(&self, id: JobId, signal: Signal) -> Result<(), GatewayError> {
        let processes = self.processes.lock().await;
        let process = processes.get(&id).ok_or(GatewayError::JobNotFound(id))?;
        let pid = process
            .pid
            .ok_or_else(|| GatewayError::WorkerUnavailable("process already exited".to_string()))?;

        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| GatewayError::WorkerUnavailable(format!("{signal:?}: {e}")))
    }
}

#[async_trait]
impl WorkerGateway for FfmpegWorker {
    async fn start(&self, id: JobId, job: ResolvedJob) -> Result<(), GatewayError> {
        if self.ffmpeg.trim().is_empty() {
            return Err(GatewayError::ConfigurationNotLoaded);
        }
        if self.tx.is_closed() {
            return Err(GatewayError::WorkerUnavailable(
                "notification channel closed".to_string(),
            ));
        }

        let mut processes = self.processes.lock().await;
        if processes.contains_key(&id) {
            return Err(GatewayError::JobAlreadyExists(id));
        }

        let args = build_args(&job);
        debug!(job_id = %id, args = ?args, "Spawning ffmpeg");

        let child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => GatewayError::WorkerNotFound,
                _ => GatewayError::WorkerUnavailable(e.to_string()),
            })?;

        let cancel = CancellationToken::new();
        processes.insert(
            id,
            Process {
                pid: child.id(),
                cancel: cancel.clone(),
            },
        );
        drop(processes);

        let input_size = total_size(&job).await;
        info!(job_id = %id, pid = ?child.id(), "ffmpeg started");

        tokio::spawn(supervise(Supervised {
            id,
            child,
            cancel,
            tx: self.tx.clone(),
            processes: Arc::clone(&self.processes),
            parser: Arc::clone(&self.parser),
            input_size,
        }));
        Ok(())
    }

    async fn pause(&self, id: JobId) -> Result<(), GatewayError> {
        self.signal(id, Signal::SIGSTOP).await
    }

    async fn resume(&self, id: JobId) -> Result<(), GatewayError> {
        self.signal(id, Signal::SIGCONT).await
    }

    async fn stop(&self, id: JobId) -> Result<(), GatewayError> {
        let process = self
            .processes
            .lock()
            .await
            .remove(&id)
            .ok_or(GatewayError::JobNotFound(id))?;
        process.cancel.cancel();
        Ok(())
    }

    async fn probe_metadata(&self, path: &Path) -> Result<Metadata, GatewayError> {
        if self.ffprobe.trim().is_empty() {
            return Err(GatewayError::ConfigurationNotLoaded);
        }

        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => GatewayError::WorkerNotFound,
                _ => GatewayError::WorkerUnavailable(e.to_string()),
            })?;

        if !output.status.success() {
            return Err(GatewayError::Probe(format!(
                "ffprobe exited with {} for {}",
                output.status,
                path.display()
            )));
        }

        parse_probe(&output.stdout)
    }
}

/// Command line for a resolved job: input arguments precede their `-i`,
/// output arguments precede their path.
pub fn build_args(job: &ResolvedJob) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect();

    for input in &job.inputs {
        args.extend(input.args().iter().map(OsString::from));
        if let Some(path) = &input.path {
            args.push("-i".into());
            args.push(path.into());
        }
    }

    for output in &job.outputs {
        args.extend(output.args().iter().map(OsString::from));
        match &output.path {
            Some(path) => args.push(path.into()),
            None => args.extend(["-f", "null", "-"].into_iter().map(OsString::from)),
        }
    }

    args
}

async fn total_size(job: &ResolvedJob) -> Option<u64> {
    let mut total = 0;
    for path in job.inputs.iter().filter_map(|i| i.path.as_ref()) {
        total += tokio::fs::metadata(path).await.ok()?.len();
    }
    (total > 0).then_some(total)
}

struct Supervised {
    id: JobId,
    child: Child,
    cancel: CancellationToken,
    tx: mpsc::Sender<Notification>,
    processes: Processes,
    parser: Arc<StatusParser>,
    input_size: Option<u64>,
}

/// Follow one ffmpeg process to its end and report the outcome.
async fn supervise(mut s: Supervised) {
    let id = s.id;
    let Some(stderr) = s.child.stderr.take() else {
        warn!(job_id = %id, "ffmpeg stderr not captured");
        return;
    };

    let pumped = tokio::select! {
        _ = s.cancel.cancelled() => None,
        last = pump_stderr(id, stderr, &s.tx, &s.parser, s.input_size) => Some(last),
    };
    let status = match pumped {
        Some(_) => tokio::select! {
            _ = s.cancel.cancelled() => None,
            status = s.child.wait() => Some(status),
        },
        None => None,
    };

    let (Some(last_line), Some(status)) = (pumped, status) else {
        // Stopped, no notification
        let _ = s.child.kill().await;
        debug!(job_id = %id, "ffmpeg killed");
        return;
    };

    if s.processes.lock().await.remove(&id).is_none() {
        return;
    }

    let notification = match status {
        Ok(status) if status.success() => {
            info!(job_id = %id, "ffmpeg finished");
            Notification::Finished { id }
        }
        Ok(status) => Notification::Errored {
            id,
            reason: last_line.unwrap_or_else(|| format!("ffmpeg exited with {status}")),
        },
        Err(e) => Notification::Errored {
            id,
            reason: format!("failed to wait for ffmpeg: {e}"),
        },
    };
    let _ = s.tx.send(notification).await;
}

/// Read stderr as `\r` / `\n` separated lines, reporting status lines as
/// progress. Returns the last line that was not a status line.
async fn pump_stderr(
    id: JobId,
    mut stderr: impl AsyncRead + Unpin,
    tx: &mpsc::Sender<Notification>,
    parser: &StatusParser,
    input_size: Option<u64>,
) -> Option<String> {
    let mut duration = None;
    let mut last_other = None;
    let mut line = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        for &b in &chunk[..n] {
            if b != b'\r' && b != b'\n' {
                line.push(b);
                continue;
            }
            if line.is_empty() {
                continue;
            }

            let text = String::from_utf8_lossy(&line).trim().to_string();
            line.clear();

            if duration.is_none() {
                if let Some(d) = parser.duration(&text) {
                    duration = Some(d);
                    continue;
                }
            }

            match parser.status(&text, progress_type(duration, input_size)) {
                Some(message) => {
                    if tx.send(Notification::Running { id, message }).await.is_err() {
                        return last_other;
                    }
                }
                None => last_other = Some(text),
            }
        }
    }

    if !line.is_empty() {
        last_other = Some(String::from_utf8_lossy(&line).trim().to_string());
    }
    last_other
}

fn progress_type(duration: Option<f64>, size: Option<u64>) -> ProgressType {
    match (duration, size) {
        (Some(duration), Some(size)) => ProgressType::Auto { duration, size },
        (Some(duration), None) => ProgressType::ByDuration { duration },
        (None, Some(size)) => ProgressType::ByFileSize { size },
        (None, None) => ProgressType::Unspecified,
    }
}

/// Parser for the lines ffmpeg prints on stderr.
pub struct StatusParser {
    duration: Regex,
    field: Regex,
}

impl StatusParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            duration: Regex::new(r"Duration:\s*(\d+):(\d{2}):(\d{2}(?:\.\d+)?)")?,
            field: Regex::new(r"(\w+)=\s*(\S+)")?,
        })
    }

    /// Total duration, in seconds, from the `Duration:` header of an input.
    pub fn duration(&self, line: &str) -> Option<f64> {
        let caps = self.duration.captures(line)?;
        let hours: f64 = caps[1].parse().ok()?;
        let minutes: f64 = caps[2].parse().ok()?;
        let seconds: f64 = caps[3].parse().ok()?;
        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    }

    /// A `frame=... time=... speed=...` status line.
    pub fn status(&self, line: &str, progress_type: ProgressType) -> Option<RunningMessage> {
        let fields: HashMap<&str, &str> = self
            .field
            .captures_iter(line)
            .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
            .collect();

        if !fields.contains_key("time") || !(fields.contains_key("frame") || fields.contains_key("size") || fields.contains_key("Lsize")) {
            return None;
        }

        let number = |key: &str| fields.get(key).and_then(|v| v.parse::<f64>().ok());
        let count = |key: &str| fields.get(key).and_then(|v| v.parse::<u64>().ok());

        Some(RunningMessage {
            progress_type,
            frame: count("frame"),
            fps: number("fps"),
            bitrate: fields
                .get("bitrate")
                .and_then(|v| v.trim_end_matches("kbits/s").parse().ok()),
            size: fields
                .get("size")
                .or_else(|| fields.get("Lsize"))
                .and_then(|v| parse_size(v)),
            output_time: fields.get("time").and_then(|v| parse_clock(v)),
            dup_frames: count("dup"),
            drop_frames: count("drop"),
            speed: fields
                .get("speed")
                .and_then(|v| v.trim_end_matches('x').parse().ok()),
        })
    }
}

/// `HH:MM:SS.ss` to seconds.
fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if hours < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// `512kB`, `1.5MiB`, `300B` to bytes.
fn parse_size(value: &str) -> Option<u64> {
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let factor = match unit {
        "" | "B" => 1.0,
        "kB" | "KiB" => 1024.0,
        "MB" | "MiB" => 1024.0 * 1024.0,
        "GB" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * factor) as u64)
}

#[derive(Deserialize)]
struct RawProbe {
    #[serde(default)]
    format: Option<RawFormat>,
    #[serde(default)]
    streams: Vec<RawStream>,
}

// ffprobe prints most numbers as strings
#[derive(Deserialize)]
struct RawFormat {
    filename: Option<String>,
    format_name: Option<String>,
    format_long_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Deserialize)]
struct RawStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

fn parse_probe(stdout: &[u8]) -> Result<Metadata, GatewayError> {
    let raw: RawProbe =
        serde_json::from_slice(stdout).map_err(|e| GatewayError::Probe(e.to_string()))?;

    let format = raw
        .format
        .map(|f| FormatInfo {
            filename: f.filename,
            format_name: f.format_name,
            format_long_name: f.format_long_name,
            duration: f.duration.and_then(|v| v.parse().ok()),
            size: f.size.and_then(|v| v.parse().ok()),
            bit_rate: f.bit_rate.and_then(|v| v.parse().ok()),
        })
        .unwrap_or_default();

    let streams = raw
        .streams
        .into_iter()
        .map(|s| StreamInfo {
            index: s.index,
            codec_type: s.codec_type,
            codec_name: s.codec_name,
            width: s.width,
            height: s.height,
            sample_rate: s.sample_rate.and_then(|v| v.parse().ok()),
            channels: s.channels,
        })
        .collect();

    Ok(Metadata { format, streams })
}
