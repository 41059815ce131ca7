use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::descriptor::ResolvedJob;
use super::models::JobId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("worker program not found")]
    WorkerNotFound,

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("job {0} already exists in the worker")]
    JobAlreadyExists(JobId),

    #[error("worker configuration not loaded")]
    ConfigurationNotLoaded,

    #[error("job {0} not found in the worker")]
    JobNotFound(JobId),

    #[error("worker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("probe failed: {0}")]
    Probe(String),
}

/// Container-level information reported by the prober.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub format_name: Option<String>,
    #[serde(default)]
    pub format_long_name: Option<String>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,
    /// Bytes
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub bit_rate: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u32>,
}

/// Media metadata, for display only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
}

/// Boundary to the process doing the actual transcoding.
///
/// Calls return once the worker acknowledged the command. Progress, completion
/// and failures are reported separately as
/// [`Notification`](super::messages::Notification)s on the channel the worker
/// was created with.
#[async_trait]
pub trait WorkerGateway: Send + Sync {
    async fn start(&self, id: JobId, job: ResolvedJob) -> Result<(), GatewayError>;

    async fn pause(&self, id: JobId) -> Result<(), GatewayError>;

    async fn resume(&self, id: JobId) -> Result<(), GatewayError>;

    async fn stop(&self, id: JobId) -> Result<(), GatewayError>;

    async fn probe_metadata(&self, path: &Path) -> Result<Metadata, GatewayError>;
}
