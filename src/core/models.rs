use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::descriptor::JobDescriptor;
use super::state::{InFlight, JobState};

pub type JobId = Uuid;

/// One running interval of a job. `end == None` means it is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkInterval {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// Data that travels with the state on every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobData {
    pub work_durations: Vec<WorkInterval>,
}

impl JobData {
    /// Copy with a new open interval. No-op if one is already open.
    pub fn opened(&self, now: DateTime<Utc>) -> Self {
        let mut data = self.clone();
        if !data.is_open() {
            data.work_durations.push(WorkInterval {
                start: now,
                end: None,
            });
        }
        data
    }

    /// Copy with the open interval (if any) ended at `now`.
    pub fn closed(&self, now: DateTime<Utc>) -> Self {
        let mut data = self.clone();
        for interval in data.work_durations.iter_mut().filter(|i| i.end.is_none()) {
            interval.end = Some(now.max(interval.start));
        }
        data
    }

    pub fn is_open(&self) -> bool {
        self.work_durations.iter().any(|i| i.end.is_none())
    }

    /// Total time spent running; an open interval counts up to `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.work_durations
            .iter()
            .map(|i| i.end.unwrap_or(now) - i.start)
            .filter(|d| *d > Duration::zero())
            .fold(Duration::zero(), |acc, d| acc + d)
    }
}

/// A transcoding job as held by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub descriptor: JobDescriptor,
    pub state: JobState,
    pub data: JobData,
    pub created_at: DateTime<Utc>,
    pub(crate) in_flight: Option<InFlight>,
}

impl Job {
    pub fn new(descriptor: JobDescriptor) -> Self {
        Self {
            id: Uuid::now_v7(),
            descriptor,
            state: JobState::Idle,
            data: JobData::default(),
            created_at: Utc::now(),
            in_flight: None,
        }
    }

    /// True while a command sent to the worker has not been acknowledged.
    pub fn is_commanding(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.data.elapsed(now)
    }

    /// Last eight hex digits of the id, for display. Leading digits of a v7
    /// id are a timestamp.
    pub fn short_id(&self) -> String {
        let simple = self.id.simple().to_string();
        simple[simple.len() - 8..].to_string()
    }
}
