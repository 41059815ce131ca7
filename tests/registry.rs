use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use transq::core::{
    ArgumentItem, ArgumentSource, GatewayError, JobDescriptor, JobId, JobPatch, JobRegistry,
    JobState, Metadata, Notification, Preset, PresetType, ProgressType, QueuedFrom, RegistryError,
    RegistryOptions, ResolvedJob, RunningMessage, StateKind, WorkerGateway,
};

/// Worker double that records calls and answers as scripted.
#[derive(Default)]
struct ScriptedGateway {
    calls: Mutex<Vec<(&'static str, JobId)>>,
    started: Mutex<Vec<ResolvedJob>>,
    failures: Mutex<HashSet<&'static str>>,
    /// When set, every call waits for a permit before answering
    gate: Option<Semaphore>,
    /// Never answer
    stall: bool,
}

impl ScriptedGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        })
    }

    fn stalled() -> Arc<Self> {
        Arc::new(Self {
            stall: true,
            ..Default::default()
        })
    }

    fn fail(&self, call: &'static str) {
        self.failures.lock().unwrap().insert(call);
    }

    fn release(&self, answers: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(answers);
        }
    }

    fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == call)
            .count()
    }

    async fn wait_for_calls(&self, call: &str, n: usize) {
        timeout(Duration::from_secs(2), async {
            while self.count(call) < n {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout waiting for worker calls");
    }

    async fn answer(&self, call: &'static str, id: JobId) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().push((call, id));

        if self.stall {
            std::future::pending::<()>().await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        if self.failures.lock().unwrap().contains(call) {
            Err(GatewayError::WorkerUnavailable(format!("scripted {call} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkerGateway for ScriptedGateway {
    async fn start(&self, id: JobId, job: ResolvedJob) -> Result<(), GatewayError> {
        self.started.lock().unwrap().push(job);
        self.answer("start", id).await
    }

    async fn pause(&self, id: JobId) -> Result<(), GatewayError> {
        self.answer("pause", id).await
    }

    async fn resume(&self, id: JobId) -> Result<(), GatewayError> {
        self.answer("resume", id).await
    }

    async fn stop(&self, id: JobId) -> Result<(), GatewayError> {
        self.answer("stop", id).await
    }

    async fn probe_metadata(&self, _path: &Path) -> Result<Metadata, GatewayError> {
        Ok(Metadata::default())
    }
}

fn registry(gateway: &Arc<ScriptedGateway>, limit: usize) -> JobRegistry {
    JobRegistry::new(
        gateway.clone(),
        Vec::new(),
        RegistryOptions {
            concurrency_limit: limit,
            command_timeout: Duration::from_secs(5),
        },
    )
}

fn descriptor() -> JobDescriptor {
    JobDescriptor::simple(
        ArgumentItem::auto("in.mkv"),
        ArgumentItem::new(
            "out.mp4",
            ArgumentSource::Custom("-c:v libx264".to_string()),
        ),
    )
}

async fn add(registry: &JobRegistry) -> JobId {
    registry.add_job(descriptor()).await.id
}

async fn state(registry: &JobRegistry, id: JobId) -> JobState {
    registry.get(id).await.expect("job exists").state
}

fn progress(time: f64) -> RunningMessage {
    RunningMessage {
        progress_type: ProgressType::ByDuration { duration: 100.0 },
        output_time: Some(time),
        ..Default::default()
    }
}

async fn running_jobs(registry: &JobRegistry) -> usize {
    registry
        .list()
        .await
        .iter()
        .filter(|j| j.state.kind() == StateKind::Running)
        .count()
}

#[tokio::test]
async fn test_basic_lifecycle() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    let state = registry.start_job(id).await.unwrap();
    assert_eq!(state.kind(), StateKind::Running);

    let job = registry.get(id).await.unwrap();
    assert_eq!(job.data.work_durations.len(), 1);
    assert!(job.data.work_durations[0].end.is_none());
    assert_eq!(gateway.count("start"), 1);

    registry
        .dispatch_notification(Notification::Finished { id })
        .await;

    let job = registry.get(id).await.unwrap();
    assert_eq!(job.state, JobState::Finished);
    assert_eq!(job.data.work_durations.len(), 1);
    assert!(job.data.work_durations[0].end.is_some());
}

#[tokio::test]
async fn test_start_resolves_arguments() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    registry.start_job(id).await.unwrap();

    let started = gateway.started.lock().unwrap().clone();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].outputs[0].args(), ["-c:v", "libx264"]);
}

#[tokio::test]
async fn test_presets_are_resolved_at_start() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = registry
        .add_job(JobDescriptor::simple(
            ArgumentItem::auto("in.mkv"),
            ArgumentItem::new("out.mp4", ArgumentSource::FromPreset("fast".to_string())),
        ))
        .await
        .id;

    // Added after the job; still picked up because resolution happens on start
    registry
        .set_presets(vec![Preset {
            id: "fast".to_string(),
            name: "Fast H.264".to_string(),
            preset_type: PresetType::Encode,
            args: vec!["-preset".to_string(), "veryfast".to_string()],
            remark: None,
            extension: Some("mp4".to_string()),
        }])
        .await;
    assert_eq!(registry.presets().await.len(), 1);

    registry.start_job(id).await.unwrap();
    let started = gateway.started.lock().unwrap().clone();
    assert_eq!(started[0].outputs[0].args(), ["-preset", "veryfast"]);
}

#[tokio::test]
async fn test_queueing_and_promotion() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let a = add(&registry).await;
    let b = add(&registry).await;

    registry.start_job(a).await.unwrap();
    let queued = registry.start_job(b).await.unwrap();
    assert_eq!(
        queued,
        JobState::Queueing {
            previous: QueuedFrom::Idle
        }
    );
    assert_eq!(gateway.count("start"), 1);

    registry
        .dispatch_notification(Notification::Finished { id: a })
        .await;

    assert_eq!(state(&registry, a).await, JobState::Finished);
    assert_eq!(state(&registry, b).await.kind(), StateKind::Running);
    assert_eq!(gateway.count("start"), 2);
}

#[tokio::test]
async fn test_forced_error_replaces_progress() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;
    registry.start_job(id).await.unwrap();

    registry
        .dispatch_notification(Notification::Running {
            id,
            message: progress(30.0),
        })
        .await;
    assert!(state(&registry, id).await.last_message().is_some());

    registry
        .dispatch_notification(Notification::Errored {
            id,
            reason: "disk full".to_string(),
        })
        .await;

    let job = registry.get(id).await.unwrap();
    assert_eq!(
        job.state,
        JobState::Errored {
            reason: "disk full".to_string()
        }
    );
    assert!(!job.data.is_open());
}

#[tokio::test]
async fn test_admission_never_exceeds_limit() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 2);
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(add(&registry).await);
    }

    let started = registry.start_all_jobs().await;
    assert_eq!(started, 5);
    assert_eq!(running_jobs(&registry).await, 2);
    assert_eq!(gateway.count("start"), 2);

    // Finish jobs one at a time; the queue drains in creation order
    for (turn, &id) in ids.iter().enumerate() {
        let current = state(&registry, id).await;
        assert_eq!(current.kind(), StateKind::Running, "job {turn} should run");
        registry
            .dispatch_notification(Notification::Finished { id })
            .await;
        assert!(running_jobs(&registry).await <= 2);
    }

    for &id in &ids {
        assert_eq!(state(&registry, id).await, JobState::Finished);
    }
}

#[tokio::test]
async fn test_concurrent_starts_respect_limit() {
    let gateway = ScriptedGateway::gated();
    let registry = registry(&gateway, 1);
    let a = add(&registry).await;
    let b = add(&registry).await;

    // `a` holds its slot while the worker has not answered yet
    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.start_job(a).await }
    });
    gateway.wait_for_calls("start", 1).await;

    let queued = registry.start_job(b).await.unwrap();
    assert_eq!(queued.kind(), StateKind::Queueing);
    assert_eq!(registry.running_count().await, 1);

    gateway.release(1);
    let started = pending.await.unwrap().unwrap();
    assert_eq!(started.kind(), StateKind::Running);
    assert_eq!(state(&registry, b).await.kind(), StateKind::Queueing);
}

#[tokio::test]
async fn test_error_drains_queue() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let a = add(&registry).await;
    let b = add(&registry).await;

    registry.start_job(a).await.unwrap();
    registry.start_job(b).await.unwrap();

    registry
        .dispatch_notification(Notification::Errored {
            id: a,
            reason: "crashed".to_string(),
        })
        .await;

    assert_eq!(state(&registry, b).await.kind(), StateKind::Running);
}

#[tokio::test]
async fn test_pause_frees_slot_for_queued_job() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let a = add(&registry).await;
    let b = add(&registry).await;

    registry.start_job(a).await.unwrap();
    registry.start_job(b).await.unwrap();

    let paused = registry.pause_job(a).await.unwrap();
    assert_eq!(paused.kind(), StateKind::Pausing);
    assert_eq!(state(&registry, b).await.kind(), StateKind::Running);

    // Resuming `a` now has to wait for `b`
    let queued = registry.start_job(a).await.unwrap();
    assert!(matches!(
        queued,
        JobState::Queueing {
            previous: QueuedFrom::Pausing { .. }
        }
    ));

    registry
        .dispatch_notification(Notification::Finished { id: b })
        .await;
    assert_eq!(state(&registry, a).await.kind(), StateKind::Running);
    assert_eq!(gateway.count("resume"), 1);
}

#[tokio::test]
async fn test_pause_and_resume_keep_last_message_and_intervals() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    registry.start_job(id).await.unwrap();
    registry
        .dispatch_notification(Notification::Running {
            id,
            message: progress(50.0),
        })
        .await;

    let paused = registry.pause_job(id).await.unwrap();
    assert_eq!(paused.last_message(), Some(&progress(50.0)));
    assert!(!registry.get(id).await.unwrap().data.is_open());

    let resumed = registry.start_job(id).await.unwrap();
    assert_eq!(resumed.last_message(), Some(&progress(50.0)));

    let job = registry.get(id).await.unwrap();
    assert_eq!(job.data.work_durations.len(), 2);
    assert!(job.data.is_open());
}

#[tokio::test]
async fn test_terminal_states_ignore_commands() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);

    let finished = add(&registry).await;
    registry.start_job(finished).await.unwrap();
    registry
        .dispatch_notification(Notification::Finished { id: finished })
        .await;

    let stopped = add(&registry).await;
    registry.start_job(stopped).await.unwrap();
    registry.stop_job(stopped).await.unwrap();

    let errored = add(&registry).await;
    registry.start_job(errored).await.unwrap();
    registry
        .dispatch_notification(Notification::Errored {
            id: errored,
            reason: "boom".to_string(),
        })
        .await;

    for id in [finished, stopped, errored] {
        let before = registry.get(id).await.unwrap();
        assert!(before.state.is_terminal());

        registry.start_job(id).await.unwrap();
        registry.pause_job(id).await.unwrap();
        registry.stop_job(id).await.unwrap();
        registry
            .dispatch_notification(Notification::Finished { id })
            .await;

        let after = registry.get(id).await.unwrap();
        assert_eq!(after.state, before.state);
        assert_eq!(after.data, before.data);
    }
}

#[tokio::test]
async fn test_reset_gives_fresh_idle_job() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let first = add(&registry).await;
    let id = add(&registry).await;

    registry.start_job(id).await.unwrap();
    registry.stop_job(id).await.unwrap();

    let fresh = registry.reset_job(id).await.unwrap();
    assert_ne!(fresh.id, id);
    assert_eq!(fresh.state, JobState::Idle);
    assert!(fresh.data.work_durations.is_empty());
    assert_eq!(fresh.descriptor, descriptor());
    assert!(registry.get(id).await.is_none());

    let order: Vec<JobId> = registry.list().await.iter().map(|j| j.id).collect();
    assert_eq!(order, [first, fresh.id]);

    // Only terminal jobs can be reset
    assert!(registry.reset_job(first).await.is_none());
}

#[tokio::test]
async fn test_stop_takes_job_out_of_queue() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let a = add(&registry).await;
    let b = add(&registry).await;

    registry.start_job(a).await.unwrap();
    registry.start_job(b).await.unwrap();

    let state_b = registry.stop_job(b).await.unwrap();
    assert_eq!(state_b, JobState::Idle);
    assert_eq!(gateway.count("stop"), 0);

    registry
        .dispatch_notification(Notification::Finished { id: a })
        .await;
    assert_eq!(state(&registry, b).await, JobState::Idle);
}

#[tokio::test]
async fn test_invalid_commands_leave_idle_job_alone() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    assert_eq!(registry.pause_job(id).await.unwrap(), JobState::Idle);
    assert_eq!(registry.stop_job(id).await.unwrap(), JobState::Idle);
    registry
        .dispatch_notification(Notification::Finished { id })
        .await;

    assert_eq!(state(&registry, id).await, JobState::Idle);
    assert!(gateway.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_start_errors_job_and_frees_slot() {
    let gateway = ScriptedGateway::new();
    gateway.fail("start");
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    let state = registry.start_job(id).await.unwrap();
    match state {
        JobState::Errored { reason } => assert!(reason.contains("scripted start failure")),
        other => panic!("expected Errored, got {other:?}"),
    }

    let job = registry.get(id).await.unwrap();
    assert!(!job.is_commanding());
    assert!(!job.data.is_open());
    assert_eq!(registry.running_count().await, 0);
}

#[tokio::test]
async fn test_failed_stop_errors_job() {
    let gateway = ScriptedGateway::new();
    gateway.fail("stop");
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    registry.start_job(id).await.unwrap();
    let state = registry.stop_job(id).await.unwrap();
    assert_eq!(state.kind(), StateKind::Errored);
}

#[tokio::test]
async fn test_unanswered_command_times_out() {
    let gateway = ScriptedGateway::stalled();
    let registry = JobRegistry::new(
        gateway.clone(),
        Vec::new(),
        RegistryOptions {
            concurrency_limit: 1,
            command_timeout: Duration::from_millis(50),
        },
    );
    let id = add(&registry).await;

    let state = timeout(Duration::from_secs(2), registry.start_job(id))
        .await
        .expect("command should time out")
        .unwrap();

    assert_eq!(state.kind(), StateKind::Errored);
    assert!(!registry.get(id).await.unwrap().is_commanding());
}

#[tokio::test]
async fn test_command_in_flight_is_rejected() {
    let gateway = ScriptedGateway::gated();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.start_job(id).await }
    });
    gateway.wait_for_calls("start", 1).await;

    assert!(registry.get(id).await.unwrap().is_commanding());
    assert_eq!(
        registry.stop_job(id).await,
        Err(RegistryError::CommandInFlight(id))
    );

    gateway.release(1);
    assert_eq!(
        pending.await.unwrap().unwrap().kind(),
        StateKind::Running
    );
    assert!(!registry.get(id).await.unwrap().is_commanding());
}

#[tokio::test]
async fn test_stale_answer_is_discarded() {
    let gateway = ScriptedGateway::gated();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    // Start the job, then hold its pause call while the worker reports an error
    gateway.release(1);
    registry.start_job(id).await.unwrap();

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.pause_job(id).await }
    });
    gateway.wait_for_calls("pause", 1).await;

    registry
        .dispatch_notification(Notification::Errored {
            id,
            reason: "worker crashed".to_string(),
        })
        .await;

    gateway.release(1);
    let state = pending.await.unwrap().unwrap();
    assert_eq!(
        state,
        JobState::Errored {
            reason: "worker crashed".to_string()
        }
    );
}

#[tokio::test]
async fn test_finish_before_start_acknowledged() {
    let gateway = ScriptedGateway::gated();
    let registry = registry(&gateway, 1);
    let a = add(&registry).await;
    let b = add(&registry).await;

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.start_job(a).await }
    });
    gateway.wait_for_calls("start", 1).await;
    assert_eq!(state(&registry, b).await, JobState::Idle);
    assert_eq!(registry.start_job(b).await.unwrap().kind(), StateKind::Queueing);

    // The worker runs `a` to completion before its start call returns
    registry
        .dispatch_notification(Notification::Running {
            id: a,
            message: progress(100.0),
        })
        .await;
    registry
        .dispatch_notification(Notification::Finished { id: a })
        .await;
    assert!(registry.get(a).await.unwrap().is_commanding());

    // One answer for `a`, one for `b` once it is admitted
    gateway.release(2);
    let settled = pending.await.unwrap().unwrap();
    assert_eq!(settled, JobState::Finished);

    let job = registry.get(a).await.unwrap();
    assert_eq!(job.data.work_durations.len(), 1);
    assert!(!job.data.is_open());

    assert_eq!(state(&registry, b).await.kind(), StateKind::Running);
    assert_eq!(registry.running_count().await, 1);
}

#[tokio::test]
async fn test_progress_before_resume_acknowledged() {
    let gateway = ScriptedGateway::gated();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    gateway.release(2);
    registry.start_job(id).await.unwrap();
    registry.pause_job(id).await.unwrap();

    let pending = tokio::spawn({
        let registry = registry.clone();
        async move { registry.start_job(id).await }
    });
    gateway.wait_for_calls("resume", 1).await;

    registry
        .dispatch_notification(Notification::Running {
            id,
            message: progress(60.0),
        })
        .await;

    gateway.release(1);
    let resumed = pending.await.unwrap().unwrap();
    assert_eq!(resumed.kind(), StateKind::Running);
    assert_eq!(resumed.last_message(), Some(&progress(60.0)));
}

#[tokio::test]
async fn test_unknown_notification_is_discarded() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    registry
        .dispatch_notification(Notification::Finished {
            id: uuid::Uuid::now_v7(),
        })
        .await;

    assert_eq!(registry.list().await.len(), 1);
    assert_eq!(state(&registry, id).await, JobState::Idle);
}

#[tokio::test]
async fn test_progress_after_pause_updates_last_message() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    registry.start_job(id).await.unwrap();
    registry.pause_job(id).await.unwrap();
    registry
        .dispatch_notification(Notification::Running {
            id,
            message: progress(70.0),
        })
        .await;

    let state = state(&registry, id).await;
    assert_eq!(state.kind(), StateKind::Pausing);
    assert_eq!(state.last_message(), Some(&progress(70.0)));
}

#[tokio::test]
async fn test_bulk_commands_pick_eligible_jobs() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 2);
    let a = add(&registry).await;
    let b = add(&registry).await;
    let c = add(&registry).await;

    assert_eq!(registry.start_all_jobs().await, 3);
    assert_eq!(state(&registry, c).await.kind(), StateKind::Queueing);

    assert_eq!(registry.pause_all_jobs().await, 2);
    // Pausing `a` and `b` let `c` run
    assert_eq!(state(&registry, a).await.kind(), StateKind::Pausing);
    assert_eq!(state(&registry, b).await.kind(), StateKind::Pausing);
    assert_eq!(state(&registry, c).await.kind(), StateKind::Running);

    assert_eq!(registry.stop_all_jobs().await, 3);
    for id in [a, b, c] {
        assert_eq!(state(&registry, id).await, JobState::Stopped);
    }

    assert_eq!(registry.remove_all_jobs().await, 3);
    assert!(registry.list().await.is_empty());
}

#[tokio::test]
async fn test_raising_limit_admits_queued_jobs() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let a = add(&registry).await;
    let b = add(&registry).await;
    let c = add(&registry).await;

    registry.start_all_jobs().await;
    assert_eq!(running_jobs(&registry).await, 1);

    registry.set_concurrency_limit(3).await;
    assert_eq!(registry.concurrency_limit().await, 3);
    for id in [a, b, c] {
        assert_eq!(state(&registry, id).await.kind(), StateKind::Running);
    }
}

#[tokio::test]
async fn test_descriptor_edits_only_when_idle() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let id = add(&registry).await;

    let edited = JobDescriptor::simple(
        ArgumentItem::auto("other.mkv"),
        ArgumentItem::null_output(ArgumentSource::Auto),
    );
    let job = registry
        .update_job(
            id,
            JobPatch {
                descriptor: Some(edited.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(job.descriptor, edited);

    registry.start_job(id).await.unwrap();
    let err = registry
        .update_job(
            id,
            JobPatch {
                descriptor: Some(descriptor()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::NotEditable {
            id,
            state: StateKind::Running
        }
    );
}

#[tokio::test]
async fn test_unknown_job_commands() {
    let gateway = ScriptedGateway::new();
    let registry = registry(&gateway, 1);
    let missing = uuid::Uuid::now_v7();

    assert!(registry.remove_job(missing).await.is_none());
    assert!(registry.reset_job(missing).await.is_none());
    assert_eq!(
        registry.start_job(missing).await,
        Err(RegistryError::JobNotFound(missing))
    );
}
