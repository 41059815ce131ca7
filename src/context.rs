use std::sync::Arc;

use crate::adapters::Simulator;
use crate::config::AppConfig;
use crate::core::{JobRegistry, WorkerGateway};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub registry: JobRegistry,
    /// Present when running against the simulated worker
    pub simulator: Option<Simulator>,
}

impl AppContext {
    pub fn new(config: AppConfig, gateway: Arc<dyn WorkerGateway>, simulator: Option<Simulator>) -> Self {
        let registry = JobRegistry::new(gateway, config.presets.clone(), config.registry_options());
        Self {
            config: Arc::new(config),
            registry,
            simulator,
        }
    }
}
