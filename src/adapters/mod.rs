use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::{Notification, WorkerGateway};

mod ffmpeg;
mod simulated;

pub use ffmpeg::{FfmpegWorker, StatusParser, build_args};
pub use simulated::{SimulatedWorker, SimulationOptions, Simulator};

/// Build the worker selected by the config. The [`Simulator`] handle is only
/// returned for the simulated worker.
pub fn create_worker(
    config: &AppConfig,
    tx: mpsc::Sender<Notification>,
) -> Result<(Arc<dyn WorkerGateway>, Option<Simulator>)> {
    if config.simulation {
        let (worker, simulator) = SimulatedWorker::new(tx, SimulationOptions::default());
        return Ok((Arc::new(worker), Some(simulator)));
    }

    Ok((Arc::new(FfmpegWorker::new(config, tx)?), None))
}
