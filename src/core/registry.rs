//! Job registry: owns every job, runs user commands through the state
//! machine, talks to the worker, and folds worker notifications back in.
//!
//! Every command goes through three phases:
//!
//! 1. **plan** (under the write lock): the state machine decides, admission is
//!    counted, and the job is marked as commanding;
//! 2. **call** (no lock held): the worker is asked, bounded by the command
//!    timeout;
//! 3. **settle** (under the write lock): the answer becomes the next
//!    (state, data) pair, replaced in a single write.
//!
//! Jobs with an unanswered start or resume count toward the concurrency limit,
//! so concurrent starts cannot overshoot it.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::admission::Admission;
use super::descriptor::{JobDescriptor, Preset, ResolvedJob};
use super::gateway::{GatewayError, Metadata, WorkerGateway};
use super::messages::Notification;
use super::models::{Job, JobData, JobId};
use super::state::{Command, GatewayCall, InFlight, JobState, StateKind, Step, Transition};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {0} already has a command in flight")]
    CommandInFlight(JobId),

    #[error("job {id} cannot be edited while {state}")]
    NotEditable { id: JobId, state: StateKind },
}

/// Partial update of a job. Unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub data: Option<JobData>,
    pub descriptor: Option<JobDescriptor>,
}

impl From<Transition> for JobPatch {
    fn from(t: Transition) -> Self {
        Self {
            state: Some(t.state),
            data: Some(t.data),
            descriptor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    pub concurrency_limit: usize,
    pub command_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 2,
            command_timeout: Duration::from_secs(30),
        }
    }
}

enum Invocation {
    Start(ResolvedJob),
    Resume,
    Pause,
    Stop,
}

impl Invocation {
    fn call(&self) -> GatewayCall {
        match self {
            Invocation::Start(_) => GatewayCall::Start,
            Invocation::Resume => GatewayCall::Resume,
            Invocation::Pause => GatewayCall::Pause,
            Invocation::Stop => GatewayCall::Stop,
        }
    }
}

struct Pending {
    id: JobId,
    invocation: Invocation,
}

struct Inner {
    jobs: Vec<Job>,
    presets: Vec<Preset>,
    limit: usize,
}

impl Inner {
    fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn occupied_slots(&self) -> usize {
        self.jobs.iter().filter(|j| occupies_slot(j)).count()
    }

    fn admission(&self) -> Admission {
        Admission::new(self.occupied_slots(), self.limit)
    }

    /// The only place a job's fields are written.
    fn patch(&mut self, id: JobId, patch: JobPatch) -> Result<&Job, RegistryError> {
        let job = self.get_mut(id).ok_or(RegistryError::JobNotFound(id))?;

        if patch.descriptor.is_some() && !job.state.is_editable() {
            return Err(RegistryError::NotEditable {
                id,
                state: job.state.kind(),
            });
        }

        if let Some(state) = patch.state {
            let (from, to) = (job.state.kind(), state.kind());
            if from != to {
                info!(job_id = %id, from = %from, to = %to, "Job state changed");
            }
            job.state = state;
        }
        if let Some(data) = patch.data {
            job.data = data;
        }
        if let Some(descriptor) = patch.descriptor {
            job.descriptor = descriptor;
        }

        Ok(job)
    }

    /// Run `command` through the job's state machine. Returns the worker call
    /// to make, if any; the job is then marked as commanding.
    fn plan(&mut self, id: JobId, command: Command) -> Result<Option<Pending>, RegistryError> {
        let admission = self.admission();
        let job = self.get(id).ok_or(RegistryError::JobNotFound(id))?;

        if job.is_commanding() {
            return Err(RegistryError::CommandInFlight(id));
        }

        match job.state.on_command(command, &job.data, admission) {
            Step::Ignore => {
                warn!(
                    job_id = %id,
                    state = %job.state.kind(),
                    command = %command,
                    "Invalid transition, ignoring command"
                );
                Ok(None)
            }
            Step::Apply(transition) => {
                self.patch(id, transition.into())?;
                Ok(None)
            }
            Step::Invoke(call) => {
                let from = job.state.kind();
                let invocation = match call {
                    GatewayCall::Start => Invocation::Start(job.descriptor.resolve(&self.presets)),
                    GatewayCall::Resume => Invocation::Resume,
                    GatewayCall::Pause => Invocation::Pause,
                    GatewayCall::Stop => Invocation::Stop,
                };

                if let Some(job) = self.get_mut(id) {
                    job.in_flight = Some(InFlight::new(call, from));
                }
                debug!(job_id = %id, call = ?call, "Sending command to worker");
                Ok(Some(Pending { id, invocation }))
            }
        }
    }

    /// Apply the worker's answer, then any finish or progress the worker
    /// reported before answering. Returns true if the job gave up a worker
    /// slot (paused, stopped, finished or failed).
    fn settle(&mut self, id: JobId, call: GatewayCall, outcome: Result<(), GatewayError>) -> bool {
        let Some(job) = self.get_mut(id) else {
            debug!(job_id = %id, call = ?call, "Job removed while command was in flight");
            return false;
        };

        let held_slot = occupies_slot(job);
        let in_flight = job.in_flight.take();

        let early = match in_flight {
            Some(f) if f.call == call && f.from == job.state.kind() => f,
            Some(f) => {
                warn!(
                    job_id = %id,
                    planned_from = %f.from,
                    state = %job.state.kind(),
                    "Job changed while command was in flight, discarding worker answer"
                );
                return held_slot && !occupies_slot(job);
            }
            None => {
                warn!(job_id = %id, call = ?call, "Worker answered a command that was not in flight");
                return false;
            }
        };

        if let Err(e) = &outcome {
            error!(job_id = %id, call = ?call, error = %e, "Worker command failed");
        }

        let now = Utc::now();
        let acknowledged = outcome.is_ok();
        let mut transition = job
            .state
            .settle(call, outcome.map_err(|e| e.to_string()), &job.data, now);

        // Notifications that overtook a start or resume acknowledgement
        if acknowledged && call.claims_slot() {
            if let Some(message) = early.early_progress {
                if let Some(state) = transition.state.on_progress(message) {
                    transition.state = state;
                }
            }
            if early.early_finish {
                debug!(job_id = %id, "Worker finished before acknowledging, applying finish");
                if let Some(finished) = transition.state.on_finish(&transition.data, now) {
                    transition = finished;
                }
            }
        }

        match self.patch(id, transition.into()) {
            Ok(job) => held_slot && !occupies_slot(job),
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to store transition");
                false
            }
        }
    }
}

/// Running, or about to run because a start or resume is unanswered.
fn occupies_slot(job: &Job) -> bool {
    matches!(job.state, JobState::Running { .. })
        || job.in_flight.as_ref().is_some_and(|f| f.call.claims_slot())
}

/// Shared handle to the job collection.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RwLock<Inner>>,
    gateway: Arc<dyn WorkerGateway>,
    command_timeout: Duration,
}

impl JobRegistry {
    pub fn new(gateway: Arc<dyn WorkerGateway>, presets: Vec<Preset>, options: RegistryOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                jobs: Vec::new(),
                presets,
                limit: options.concurrency_limit,
            })),
            gateway,
            command_timeout: options.command_timeout,
        }
    }

    pub async fn add_job(&self, descriptor: JobDescriptor) -> Job {
        let job = Job::new(descriptor);
        info!(job_id = %job.id, "Job added");
        self.inner.write().await.jobs.push(job.clone());
        job
    }

    pub async fn get(&self, id: JobId) -> Option<Job> {
        self.inner.read().await.get(id).cloned()
    }

    /// All jobs, in creation order.
    pub async fn list(&self) -> Vec<Job> {
        self.inner.read().await.jobs.clone()
    }

    /// Merge `patch` into the job in one write.
    pub async fn update_job(&self, id: JobId, patch: JobPatch) -> Result<Job, RegistryError> {
        let mut inner = self.inner.write().await;
        inner.patch(id, patch).cloned()
    }

    /// Forget a job. A running worker process is not stopped.
    pub async fn remove_job(&self, id: JobId) -> Option<Job> {
        let mut inner = self.inner.write().await;
        let pos = inner.jobs.iter().position(|j| j.id == id)?;
        let job = inner.jobs.remove(pos);
        if occupies_slot(&job) {
            warn!(job_id = %id, "Removed a job the worker may still be processing");
        }
        Some(job)
    }

    pub async fn remove_all_jobs(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.jobs.len();
        inner.jobs.clear();
        count
    }

    /// Replace a stopped, finished or errored job with a fresh idle copy
    /// under a new id. Any other call is ignored.
    pub async fn reset_job(&self, id: JobId) -> Option<Job> {
        let mut inner = self.inner.write().await;
        let pos = inner.jobs.iter().position(|j| j.id == id)?;
        let old = &inner.jobs[pos];

        if !old.state.is_terminal() || old.is_commanding() {
            debug!(job_id = %id, state = %old.state.kind(), "Reset ignored");
            return None;
        }

        let fresh = Job::new(old.descriptor.clone());
        info!(job_id = %id, new_id = %fresh.id, "Job reset");
        inner.jobs[pos] = fresh.clone();
        Some(fresh)
    }

    pub async fn start_job(&self, id: JobId) -> Result<JobState, RegistryError> {
        self.command_one(id, Command::Start).await
    }

    pub async fn pause_job(&self, id: JobId) -> Result<JobState, RegistryError> {
        self.command_one(id, Command::Pause).await
    }

    pub async fn stop_job(&self, id: JobId) -> Result<JobState, RegistryError> {
        self.command_one(id, Command::Stop).await
    }

    /// Start every idle or paused job. Returns how many were commanded.
    pub async fn start_all_jobs(&self) -> usize {
        self.command_many(Command::Start, |s| {
            matches!(s, JobState::Idle | JobState::Pausing { .. })
        })
        .await
    }

    pub async fn pause_all_jobs(&self) -> usize {
        self.command_many(Command::Pause, |s| matches!(s, JobState::Running { .. }))
            .await
    }

    pub async fn stop_all_jobs(&self) -> usize {
        self.command_many(Command::Stop, |s| {
            matches!(
                s,
                JobState::Running { .. } | JobState::Pausing { .. } | JobState::Queueing { .. }
            )
        })
        .await
    }

    /// Route a worker notification to its job.
    pub async fn dispatch_notification(&self, notification: Notification) {
        let id = notification.id();
        let now = Utc::now();

        {
            let mut inner = self.inner.write().await;

            // Held until the start or resume that the worker already acted on is settled
            let early = inner
                .get_mut(id)
                .and_then(|j| j.in_flight.as_mut())
                .filter(|f| f.call.claims_slot());
            if let Some(in_flight) = early {
                match &notification {
                    Notification::Running { message, .. } => {
                        in_flight.early_progress = Some(message.clone());
                        return;
                    }
                    Notification::Finished { .. } => {
                        debug!(job_id = %id, "Finish arrived before the worker acknowledged, deferring");
                        in_flight.early_finish = true;
                        return;
                    }
                    Notification::Errored { .. } => {}
                }
            }

            let Some(job) = inner.get(id) else {
                debug!(job_id = %id, "Notification for unknown job, discarding");
                return;
            };

            let patch: Option<JobPatch> = match notification {
                Notification::Running { message, .. } => match job.state.on_progress(message) {
                    Some(state) => Some(JobPatch {
                        state: Some(state),
                        ..Default::default()
                    }),
                    None => {
                        debug!(job_id = %id, state = %job.state.kind(), "Progress ignored");
                        None
                    }
                },
                Notification::Finished { .. } => match job.state.on_finish(&job.data, now) {
                    Some(transition) => Some(transition.into()),
                    None => {
                        warn!(job_id = %id, state = %job.state.kind(), "Invalid transition, ignoring finish");
                        None
                    }
                },
                Notification::Errored { reason, .. } => {
                    error!(job_id = %id, state = %job.state.kind(), reason = %reason, "Worker reported an error");
                    Some(Transition::errored(&job.data, reason, now).into())
                }
            };

            let Some(patch) = patch else {
                return;
            };
            let ends_job = patch.state.as_ref().is_some_and(JobState::is_terminal);

            if let Err(e) = inner.patch(id, patch) {
                error!(job_id = %id, error = %e, "Failed to store notification");
                return;
            }
            if !ends_job {
                return;
            }
        }

        self.admit_waiting().await;
    }

    /// Start queued jobs, in creation order, while the limit allows.
    pub async fn admit_waiting(&self) {
        loop {
            let pending = {
                let mut inner = self.inner.write().await;
                let queued: Vec<JobId> = inner
                    .jobs
                    .iter()
                    .filter(|j| matches!(j.state, JobState::Queueing { .. }) && !j.is_commanding())
                    .map(|j| j.id)
                    .collect();

                let mut pending = Vec::new();
                for id in queued {
                    if !inner.admission().admits() {
                        break;
                    }
                    match inner.plan(id, Command::Start) {
                        Ok(Some(p)) => pending.push(p),
                        Ok(None) => {}
                        Err(e) => debug!(job_id = %id, error = %e, "Skipping queued job"),
                    }
                }
                pending
            };

            if pending.is_empty() {
                return;
            }
            info!(count = pending.len(), "Admitting queued jobs");

            // Failed starts free their slot again; try the next queued jobs
            if !self.perform(pending).await {
                return;
            }
        }
    }

    /// Number of jobs holding a worker slot.
    pub async fn running_count(&self) -> usize {
        self.inner.read().await.occupied_slots()
    }

    pub async fn concurrency_limit(&self) -> usize {
        self.inner.read().await.limit
    }

    pub async fn set_concurrency_limit(&self, limit: usize) {
        {
            let mut inner = self.inner.write().await;
            info!(from = inner.limit, to = limit, "Concurrency limit changed");
            inner.limit = limit;
        }
        self.admit_waiting().await;
    }

    pub async fn presets(&self) -> Vec<Preset> {
        self.inner.read().await.presets.clone()
    }

    /// Replace the preset collection. Affects jobs started afterwards.
    pub async fn set_presets(&self, presets: Vec<Preset>) {
        self.inner.write().await.presets = presets;
    }

    pub async fn probe_metadata(&self, path: &Path) -> Result<Metadata, GatewayError> {
        match tokio::time::timeout(self.command_timeout, self.gateway.probe_metadata(path)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(self.command_timeout)),
        }
    }

    async fn command_one(&self, id: JobId, command: Command) -> Result<JobState, RegistryError> {
        let pending = self.inner.write().await.plan(id, command)?;

        if let Some(pending) = pending {
            if self.perform(vec![pending]).await {
                self.admit_waiting().await;
            }
        }

        self.get(id)
            .await
            .map(|j| j.state)
            .ok_or(RegistryError::JobNotFound(id))
    }

    async fn command_many(&self, command: Command, eligible: fn(&JobState) -> bool) -> usize {
        let (count, pending) = {
            let mut inner = self.inner.write().await;
            let ids: Vec<JobId> = inner
                .jobs
                .iter()
                .filter(|j| eligible(&j.state) && !j.is_commanding())
                .map(|j| j.id)
                .collect();

            let mut pending = Vec::new();
            for &id in &ids {
                match inner.plan(id, command) {
                    Ok(Some(p)) => pending.push(p),
                    Ok(None) => {}
                    Err(e) => debug!(job_id = %id, error = %e, "Skipping job"),
                }
            }
            (ids.len(), pending)
        };

        debug!(command = %command, count, "Bulk command");
        if self.perform(pending).await {
            self.admit_waiting().await;
        }
        count
    }

    /// Call the worker for every pending command concurrently, then settle all
    /// answers. Returns true if any job gave up its slot.
    async fn perform(&self, pending: Vec<Pending>) -> bool {
        if pending.is_empty() {
            return false;
        }

        let mut expected: Vec<(JobId, GatewayCall)> = Vec::with_capacity(pending.len());
        let mut calls = JoinSet::new();

        for Pending { id, invocation } in pending {
            let call = invocation.call();
            expected.push((id, call));

            let gateway = Arc::clone(&self.gateway);
            let timeout = self.command_timeout;
            calls.spawn(async move {
                let request = async {
                    match invocation {
                        Invocation::Start(job) => gateway.start(id, job).await,
                        Invocation::Resume => gateway.resume(id).await,
                        Invocation::Pause => gateway.pause(id).await,
                        Invocation::Stop => gateway.stop(id).await,
                    }
                };
                let outcome = match tokio::time::timeout(timeout, request).await {
                    Ok(result) => result,
                    Err(_) => Err(GatewayError::Timeout(timeout)),
                };
                (id, call, outcome)
            });
        }

        let mut answers = Vec::with_capacity(expected.len());
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(answer) => answers.push(answer),
                Err(e) => error!(error = %e, "Worker call task failed"),
            }
        }

        // A call whose task died never answered; fail it so the job is not
        // left commanding forever.
        for (id, call) in expected {
            if !answers.iter().any(|(a, c, _)| *a == id && *c == call) {
                answers.push((
                    id,
                    call,
                    Err(GatewayError::WorkerUnavailable("worker call aborted".to_string())),
                ));
            }
        }

        let mut inner = self.inner.write().await;
        let mut released = false;
        for (id, call, outcome) in answers {
            released |= inner.settle(id, call, outcome);
        }
        released
    }
}
