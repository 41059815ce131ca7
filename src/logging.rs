//! Logging and tracing initialization.
//!
//! Structured logging through the `tracing` ecosystem, either as pretty
//! console output or as JSON for log aggregation.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;
use crate::core::JobId;

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Initialize the tracing subscriber.
///
/// Call once, early in main(), after config is loaded. `RUST_LOG` overrides
/// the default `transq=info` / `transq=debug` filter.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("transq={}", default_level.as_str().to_lowercase()))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        // Console stays readable while the interactive prompt shares stdout
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Entries silent for this many intervals belong to jobs that stopped or
/// were removed without a final notification.
const STALE_INTERVALS: u32 = 8;

/// Per-job rate limiter for progress logs.
///
/// ffmpeg reports several status lines per second for every running job;
/// only one per `interval` and job gets logged.
pub struct ProgressThrottle {
    interval: Duration,
    last: HashMap<JobId, Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: HashMap::new(),
        }
    }

    /// Returns true if `job` has not logged within the interval, and records
    /// the log if so.
    pub fn should_log(&mut self, job: JobId) -> bool {
        let now = Instant::now();
        match self.last.get(&job) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                let stale = self.interval * STALE_INTERVALS;
                self.last.retain(|_, last| now.duration_since(*last) < stale);
                self.last.insert(job, now);
                true
            }
        }
    }

    /// Number of jobs with a remembered log time.
    pub fn tracked(&self) -> usize {
        self.last.len()
    }

    /// Drop the entry of a job that will not report progress anymore.
    pub fn forget(&mut self, job: JobId) {
        self.last.remove(&job);
    }
}
