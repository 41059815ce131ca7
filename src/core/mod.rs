pub mod admission;
pub mod descriptor;
pub mod gateway;
pub mod messages;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod state;

pub use admission::{Admission, can_admit};
pub use descriptor::{
    ArgumentItem, ArgumentSource, JobDescriptor, Preset, PresetType, ResolvedItem, ResolvedJob,
    ResolvedSource,
};
pub use gateway::{GatewayError, Metadata, WorkerGateway};
pub use messages::{Notification, ProgressType, RunningMessage};
pub use models::{Job, JobData, JobId, WorkInterval};
pub use orchestrator::Orchestrator;
pub use registry::{JobPatch, JobRegistry, RegistryError, RegistryOptions};
pub use state::{Command, JobState, QueuedFrom, StateKind, Transition};
