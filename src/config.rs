use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{Preset, RegistryOptions};

/// Config file read when neither `--config` nor `TRANSQ_CONFIG` is given.
pub const DEFAULT_CONFIG_FILE: &str = "transq.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// How many jobs may run at the same time
    pub max_concurrency: usize,
    /// Upper bound for any single worker command
    pub command_timeout_secs: u64,
    pub ffmpeg_program: String,
    pub ffprobe_program: String,
    /// Use the in-process simulated worker instead of ffmpeg
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub presets: Vec<Preset>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            command_timeout_secs: 30,
            ffmpeg_program: "ffmpeg".to_string(),
            ffprobe_program: "ffprobe".to_string(),
            simulation: false,
            verbose: false,
            json_logs: false,
            presets: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load the config: defaults, then the config file, then `TRANSQ_*`
    /// environment variables, then `overrides` (usually the CLI arguments).
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        let path = std::env::var_os("TRANSQ_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load(&path, overrides)
    }

    /// Same as [`AppConfig::new`] with an explicit config file. A missing
    /// file is not an error.
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TRANSQ_").ignore(&["config"]));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.command_timeout_secs == 0 {
            bail!("command_timeout_secs must be at least 1");
        }

        let mut seen = std::collections::HashSet::new();
        for preset in &self.presets {
            if !seen.insert(preset.id.as_str()) {
                bail!("duplicate preset id '{}'", preset.id);
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            concurrency_limit: self.max_concurrency,
            command_timeout: self.command_timeout(),
        }
    }
}
