//! Notifications pushed by the worker, one per event, keyed by job id.

use serde::{Deserialize, Serialize};

use super::models::JobId;

/// How the completion ratio of a running job can be derived.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressType {
    #[default]
    Unspecified,
    /// Total media duration in seconds
    ByDuration { duration: f64 },
    /// Total input size in bytes
    ByFileSize { size: u64 },
    Auto { duration: f64, size: u64 },
}

/// Telemetry of a running job. Every counter is optional because ffmpeg
/// reports `N/A` for values it cannot compute yet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunningMessage {
    #[serde(default)]
    pub progress_type: ProgressType,
    #[serde(default)]
    pub frame: Option<u64>,
    #[serde(default)]
    pub fps: Option<f64>,
    /// kbit/s
    #[serde(default)]
    pub bitrate: Option<f64>,
    /// Bytes written so far
    #[serde(default)]
    pub size: Option<u64>,
    /// Position of the output, seconds
    #[serde(default)]
    pub output_time: Option<f64>,
    #[serde(default)]
    pub dup_frames: Option<u64>,
    #[serde(default)]
    pub drop_frames: Option<u64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

impl RunningMessage {
    /// Completion in `0.0..=1.0`, when the progress type allows computing it.
    pub fn ratio(&self) -> Option<f64> {
        let by_duration = |total: f64| {
            let time = self.output_time?;
            (total > 0.0).then(|| time / total)
        };
        let by_size = |total: u64| {
            let size = self.size?;
            (total > 0).then(|| size as f64 / total as f64)
        };

        let ratio = match self.progress_type {
            ProgressType::Unspecified => None,
            ProgressType::ByDuration { duration } => by_duration(duration),
            ProgressType::ByFileSize { size } => by_size(size),
            ProgressType::Auto { duration, size } => by_duration(duration).or_else(|| by_size(size)),
        };

        ratio.map(|r| r.clamp(0.0, 1.0))
    }
}

/// A message from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum Notification {
    Running {
        id: JobId,
        #[serde(flatten)]
        message: RunningMessage,
    },
    Finished {
        id: JobId,
    },
    Errored {
        id: JobId,
        reason: String,
    },
}

impl Notification {
    pub fn id(&self) -> JobId {
        match self {
            Notification::Running { id, .. }
            | Notification::Finished { id }
            | Notification::Errored { id, .. } => *id,
        }
    }
}
