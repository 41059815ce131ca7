//! Job descriptors: what a job reads, what it writes, and where the ffmpeg
//! arguments for each side come from.
//!
//! Descriptors are edited in their "source" form ([`ArgumentItem`]) and turned
//! into literal argument lists ([`ResolvedItem`]) only when a job is started,
//! so that preset edits made while a job waits in Idle are picked up.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which side of a job a preset is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresetType {
    Universal,
    Decode,
    Encode,
}

/// A named, reusable set of ffmpeg arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub preset_type: PresetType,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    /// Suggested extension for outputs produced with this preset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl Preset {
    /// Whether the preset may be attached to an input (decode) item.
    pub fn fits_input(&self) -> bool {
        matches!(self.preset_type, PresetType::Universal | PresetType::Decode)
    }

    /// Whether the preset may be attached to an output (encode) item.
    pub fn fits_output(&self) -> bool {
        matches!(self.preset_type, PresetType::Universal | PresetType::Encode)
    }
}

/// Where an item's arguments come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum ArgumentSource {
    /// No arguments; ffmpeg applies its own defaults
    Auto,
    /// A literal, whitespace separated argument string
    Custom(String),
    /// Arguments of the preset with this id
    FromPreset(String),
}

/// One input or output of a job, in editable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentItem {
    /// `None` on an output means the null output (`-f null -`)
    pub path: Option<PathBuf>,
    pub source: ArgumentSource,
}

impl ArgumentItem {
    pub fn new(path: impl Into<PathBuf>, source: ArgumentSource) -> Self {
        Self {
            path: Some(path.into()),
            source,
        }
    }

    pub fn auto(path: impl Into<PathBuf>) -> Self {
        Self::new(path, ArgumentSource::Auto)
    }

    pub fn null_output(source: ArgumentSource) -> Self {
        Self { path: None, source }
    }
}

/// The literal arguments an item resolved to, plus enough provenance to turn
/// it back into an [`ArgumentItem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResolvedSource {
    Auto,
    Custom { args: Vec<String> },
    /// Snapshot of a preset taken at resolve time
    Preset {
        id: String,
        name: String,
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedItem {
    pub path: Option<PathBuf>,
    pub source: ResolvedSource,
}

impl ResolvedItem {
    /// Arguments handed to the worker for this item.
    pub fn args(&self) -> &[String] {
        match &self.source {
            ResolvedSource::Auto => &[],
            ResolvedSource::Custom { args } => args,
            ResolvedSource::Preset { args, .. } => args,
        }
    }
}

/// Inputs and outputs of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub inputs: Vec<ArgumentItem>,
    pub outputs: Vec<ArgumentItem>,
}

impl JobDescriptor {
    /// Single input, single output descriptor.
    pub fn simple(input: ArgumentItem, output: ArgumentItem) -> Self {
        Self {
            inputs: vec![input],
            outputs: vec![output],
        }
    }

    pub fn resolve(&self, presets: &[Preset]) -> ResolvedJob {
        ResolvedJob {
            inputs: self.inputs.iter().map(|i| resolve(i, presets)).collect(),
            outputs: self.outputs.iter().map(|o| resolve(o, presets)).collect(),
        }
    }
}

/// A descriptor with every item resolved. This is what the worker receives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedJob {
    pub inputs: Vec<ResolvedItem>,
    pub outputs: Vec<ResolvedItem>,
}

impl ResolvedJob {
    pub fn unresolve(&self, presets: &[Preset]) -> JobDescriptor {
        JobDescriptor {
            inputs: self.inputs.iter().map(|i| unresolve(i, presets)).collect(),
            outputs: self.outputs.iter().map(|o| unresolve(o, presets)).collect(),
        }
    }
}

/// Turn an editable item into literal arguments.
///
/// A preset id that no longer exists resolves as [`ArgumentSource::Auto`].
pub fn resolve(item: &ArgumentItem, presets: &[Preset]) -> ResolvedItem {
    let source = match &item.source {
        ArgumentSource::Auto => ResolvedSource::Auto,
        ArgumentSource::Custom(raw) => ResolvedSource::Custom {
            args: split_args(raw),
        },
        ArgumentSource::FromPreset(id) => match presets.iter().find(|p| &p.id == id) {
            Some(preset) => ResolvedSource::Preset {
                id: preset.id.clone(),
                name: preset.name.clone(),
                args: preset.args.clone(),
            },
            None => {
                tracing::warn!(preset_id = %id, "Preset no longer exists, using automatic arguments");
                ResolvedSource::Auto
            }
        },
    };

    ResolvedItem {
        path: item.path.clone(),
        source,
    }
}

/// Turn a resolved item back into its editable form.
///
/// Preset snapshots are matched to live presets by id; if the preset is gone
/// the snapshot's arguments are kept as a custom string.
pub fn unresolve(item: &ResolvedItem, presets: &[Preset]) -> ArgumentItem {
    let source = match &item.source {
        ResolvedSource::Auto => ArgumentSource::Auto,
        ResolvedSource::Custom { args } => ArgumentSource::Custom(args.join(" ")),
        ResolvedSource::Preset { id, args, .. } => {
            if presets.iter().any(|p| &p.id == id) {
                ArgumentSource::FromPreset(id.clone())
            } else {
                ArgumentSource::Custom(args.join(" "))
            }
        }
    };

    ArgumentItem {
        path: item.path.clone(),
        source,
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
