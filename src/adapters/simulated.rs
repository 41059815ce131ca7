use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::sleep;
use tracing::debug;

use crate::core::gateway::{FormatInfo, GatewayError, Metadata, StreamInfo, WorkerGateway};
use crate::core::{JobId, Notification, ProgressType, ResolvedJob, RunningMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Stop,
}

type Jobs = Arc<Mutex<HashMap<JobId, watch::Sender<Control>>>>;

#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions {
    /// Wall-clock time per progress report
    pub tick: Duration,
    /// Reports before the job finishes; each one stands for a second of media
    pub steps: u32,
    pub frames_per_step: u64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            steps: 20,
            frames_per_step: 25,
        }
    }
}

/// Handle for injecting worker-side events into a [`SimulatedWorker`].
#[derive(Clone)]
pub struct Simulator {
    jobs: Jobs,
    tx: mpsc::Sender<Notification>,
}

impl Simulator {
    /// Make a job fail as if the worker crashed on it.
    pub async fn fail(&self, id: JobId, reason: &str) -> Result<(), GatewayError> {
        if let Some(control) = self.jobs.lock().await.remove(&id) {
            let _ = control.send(Control::Stop);
        }

        self.tx
            .send(Notification::Errored {
                id,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| GatewayError::WorkerUnavailable("notification channel closed".to_string()))
    }

    /// Jobs the simulated worker currently knows about.
    pub async fn active(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

/// In-process worker that pretends to transcode.
pub struct SimulatedWorker {
    jobs: Jobs,
    tx: mpsc::Sender<Notification>,
    options: SimulationOptions,
}

impl SimulatedWorker {
    pub fn new(tx: mpsc::Sender<Notification>, options: SimulationOptions) -> (Self, Simulator) {
        let jobs: Jobs = Arc::new(Mutex::new(HashMap::new()));
        let simulator = Simulator {
            jobs: Arc::clone(&jobs),
            tx: tx.clone(),
        };

        (Self { jobs, tx, options }, simulator)
    }

    async fn send_control(&self, id: JobId, control: Control) -> Result<(), GatewayError> {
        let jobs = self.jobs.lock().await;
        let sender = jobs.get(&id).ok_or(GatewayError::JobNotFound(id))?;
        sender
            .send(control)
            .map_err(|_| GatewayError::WorkerUnavailable("simulated job already ended".to_string()))
    }
}

#[async_trait]
impl WorkerGateway for SimulatedWorker {
    async fn start(&self, id: JobId, job: ResolvedJob) -> Result<(), GatewayError> {
        if self.tx.is_closed() {
            return Err(GatewayError::WorkerUnavailable(
                "notification channel closed".to_string(),
            ));
        }

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&id) {
            return Err(GatewayError::JobAlreadyExists(id));
        }

        let (control_tx, control_rx) = watch::channel(Control::Run);
        jobs.insert(id, control_tx);

        debug!(
            job_id = %id,
            inputs = job.inputs.len(),
            outputs = job.outputs.len(),
            "(Simulated) Starting job"
        );

        tokio::spawn(simulate(
            id,
            control_rx,
            self.tx.clone(),
            self.options,
            Arc::clone(&self.jobs),
        ));
        Ok(())
    }

    async fn pause(&self, id: JobId) -> Result<(), GatewayError> {
        self.send_control(id, Control::Pause).await
    }

    async fn resume(&self, id: JobId) -> Result<(), GatewayError> {
        self.send_control(id, Control::Run).await
    }

    async fn stop(&self, id: JobId) -> Result<(), GatewayError> {
        let control = self
            .jobs
            .lock()
            .await
            .remove(&id)
            .ok_or(GatewayError::JobNotFound(id))?;
        let _ = control.send(Control::Stop);
        Ok(())
    }

    async fn probe_metadata(&self, path: &Path) -> Result<Metadata, GatewayError> {
        Ok(Metadata {
            format: FormatInfo {
                filename: Some(path.display().to_string()),
                format_name: Some("simulated".to_string()),
                duration: Some(f64::from(self.options.steps)),
                ..Default::default()
            },
            streams: vec![StreamInfo {
                index: 0,
                codec_type: Some("video".to_string()),
                codec_name: Some("rawvideo".to_string()),
                width: Some(1920),
                height: Some(1080),
                ..Default::default()
            }],
        })
    }
}

async fn simulate(
    id: JobId,
    mut control: watch::Receiver<Control>,
    tx: mpsc::Sender<Notification>,
    options: SimulationOptions,
    jobs: Jobs,
) {
    let total = f64::from(options.steps);
    let mut step: u32 = 0;

    while step < options.steps {
        // Park while paused
        loop {
            let current = *control.borrow_and_update();
            match current {
                Control::Run => break,
                Control::Stop => return,
                Control::Pause => {
                    if control.changed().await.is_err() {
                        return;
                    }
                }
            }
        }

        tokio::select! {
            _ = sleep(options.tick) => {}
            changed = control.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        step += 1;
        let message = RunningMessage {
            progress_type: ProgressType::ByDuration { duration: total },
            frame: Some(u64::from(step) * options.frames_per_step),
            fps: Some(options.frames_per_step as f64 / options.tick.as_secs_f64().max(f64::EPSILON)),
            size: Some(u64::from(step) * 256 * 1024),
            output_time: Some(f64::from(step)),
            speed: Some(1.0 / options.tick.as_secs_f64().max(f64::EPSILON)),
            ..Default::default()
        };

        if tx.send(Notification::Running { id, message }).await.is_err() {
            return;
        }
    }

    // Stopped or failed at the last moment: stay silent
    if jobs.lock().await.remove(&id).is_none() {
        return;
    }
    let _ = tx.send(Notification::Finished { id }).await;
}
