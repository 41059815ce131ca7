//! Job lifecycle state machine.
//!
//! Every state is a variant of [`JobState`] owning exactly the data it needs.
//! The machine itself is pure: a command either does nothing
//! ([`Step::Ignore`]), moves the job locally ([`Step::Apply`]), or asks the
//! registry to call the worker first ([`Step::Invoke`]). In the last case the
//! worker's answer is folded back with [`JobState::settle`].
//!
//! ```text
//!           start (admitted)            pause
//!   Idle ──────────────────▶ Running ─────────▶ Pausing
//!    │ start (full)            │  ▲  ◀─────────  │ │
//!    ▼                         │  │ start        │ │ start (full)
//!   Queueing(Idle)       finish│  └──────────────┘ ▼
//!                              ▼            Queueing(Pausing)
//!                           Finished
//!   Running / Pausing ── stop ──▶ Stopped     any ── error ──▶ Errored
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use super::admission::Admission;
use super::messages::RunningMessage;
use super::models::JobData;

/// User commands accepted by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Stop,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => write!(f, "start"),
            Command::Pause => write!(f, "pause"),
            Command::Stop => write!(f, "stop"),
        }
    }
}

/// Worker operations a transition can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayCall {
    Start,
    Resume,
    Pause,
    Stop,
}

impl GatewayCall {
    /// Whether the call will hold a worker slot once acknowledged.
    pub fn claims_slot(&self) -> bool {
        matches!(self, GatewayCall::Start | GatewayCall::Resume)
    }
}

/// The state a queued job returns to when it leaves the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state")]
pub enum QueuedFrom {
    Idle,
    Pausing { last_message: Option<RunningMessage> },
}

impl QueuedFrom {
    pub fn to_state(&self) -> JobState {
        match self {
            QueuedFrom::Idle => JobState::Idle,
            QueuedFrom::Pausing { last_message } => JobState::Pausing {
                last_message: last_message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state")]
pub enum JobState {
    Idle,
    /// Wants to run but the concurrency limit is reached
    Queueing { previous: QueuedFrom },
    Running { last_message: Option<RunningMessage> },
    Pausing { last_message: Option<RunningMessage> },
    Stopped,
    Finished,
    Errored { reason: String },
}

/// Variant of a [`JobState`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Idle,
    Queueing,
    Running,
    Pausing,
    Stopped,
    Finished,
    Errored,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Idle => "idle",
            StateKind::Queueing => "queueing",
            StateKind::Running => "running",
            StateKind::Pausing => "pausing",
            StateKind::Stopped => "stopped",
            StateKind::Finished => "finished",
            StateKind::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Next state and data, always replaced together.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: JobState,
    pub data: JobData,
}

impl Transition {
    pub fn new(state: JobState, data: JobData) -> Self {
        Self { state, data }
    }

    /// Forced move to `Errored`, valid from any state.
    pub fn errored(data: &JobData, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::new(
            JobState::Errored {
                reason: reason.into(),
            },
            data.closed(now),
        )
    }
}

/// Outcome of a command against a state.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The command does not apply to this state
    Ignore,
    Apply(Transition),
    /// The worker must acknowledge before the state can move
    Invoke(GatewayCall),
}

/// A command that was sent to the worker and not yet answered.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InFlight {
    pub call: GatewayCall,
    /// Kind of the state the call was planned from
    pub from: StateKind,
    /// Latest progress reported before a start or resume was acknowledged
    pub early_progress: Option<RunningMessage>,
    /// The worker finished before a start or resume was acknowledged
    pub early_finish: bool,
}

impl InFlight {
    pub fn new(call: GatewayCall, from: StateKind) -> Self {
        Self {
            call,
            from,
            early_progress: None,
            early_finish: false,
        }
    }
}

impl JobState {
    pub fn kind(&self) -> StateKind {
        match self {
            JobState::Idle => StateKind::Idle,
            JobState::Queueing { .. } => StateKind::Queueing,
            JobState::Running { .. } => StateKind::Running,
            JobState::Pausing { .. } => StateKind::Pausing,
            JobState::Stopped => StateKind::Stopped,
            JobState::Finished => StateKind::Finished,
            JobState::Errored { .. } => StateKind::Errored,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Stopped | JobState::Finished | JobState::Errored { .. }
        )
    }

    /// Only idle jobs may have their descriptor edited.
    pub fn is_editable(&self) -> bool {
        matches!(self, JobState::Idle)
    }

    /// Last telemetry seen while running, kept across pause and queueing.
    pub fn last_message(&self) -> Option<&RunningMessage> {
        match self {
            JobState::Running { last_message } | JobState::Pausing { last_message } => {
                last_message.as_ref()
            }
            JobState::Queueing {
                previous: QueuedFrom::Pausing { last_message },
            } => last_message.as_ref(),
            _ => None,
        }
    }

    /// Decide what a user command does in this state.
    ///
    /// `admission` is only consulted for [`Command::Start`].
    pub fn on_command(&self, command: Command, data: &JobData, admission: Admission) -> Step {
        match self {
            JobState::Idle => match command {
                Command::Start if admission.admits() => Step::Invoke(GatewayCall::Start),
                Command::Start => Step::Apply(Transition::new(
                    JobState::Queueing {
                        previous: QueuedFrom::Idle,
                    },
                    data.clone(),
                )),
                Command::Pause | Command::Stop => Step::Ignore,
            },
            JobState::Queueing { previous } => {
                let fallback = previous.to_state();
                match fallback.on_command(command, data, admission) {
                    // A no-op on the remembered state takes the job out of the queue
                    Step::Ignore => Step::Apply(Transition::new(fallback, data.clone())),
                    step => step,
                }
            }
            JobState::Running { .. } => match command {
                Command::Start => Step::Ignore,
                Command::Pause => Step::Invoke(GatewayCall::Pause),
                Command::Stop => Step::Invoke(GatewayCall::Stop),
            },
            JobState::Pausing { last_message } => match command {
                Command::Start if admission.admits() => Step::Invoke(GatewayCall::Resume),
                Command::Start => Step::Apply(Transition::new(
                    JobState::Queueing {
                        previous: QueuedFrom::Pausing {
                            last_message: last_message.clone(),
                        },
                    },
                    data.clone(),
                )),
                Command::Pause => Step::Ignore,
                Command::Stop => Step::Invoke(GatewayCall::Stop),
            },
            JobState::Stopped | JobState::Finished | JobState::Errored { .. } => Step::Ignore,
        }
    }

    /// Fold the worker's answer to `call` into the next state.
    pub fn settle(
        &self,
        call: GatewayCall,
        outcome: Result<(), String>,
        data: &JobData,
        now: DateTime<Utc>,
    ) -> Transition {
        if let Err(reason) = outcome {
            return Transition::errored(data, reason, now);
        }

        let last_message = self.last_message().cloned();
        match call {
            GatewayCall::Start | GatewayCall::Resume => {
                Transition::new(JobState::Running { last_message }, data.opened(now))
            }
            GatewayCall::Pause => {
                Transition::new(JobState::Pausing { last_message }, data.closed(now))
            }
            GatewayCall::Stop => Transition::new(JobState::Stopped, data.closed(now)),
        }
    }

    /// Worker reported completion. Only a running job can finish.
    pub fn on_finish(&self, data: &JobData, now: DateTime<Utc>) -> Option<Transition> {
        match self {
            JobState::Running { .. } => Some(Transition::new(JobState::Finished, data.closed(now))),
            _ => None,
        }
    }

    /// Worker reported telemetry. Returns the state carrying it, if it applies.
    pub fn on_progress(&self, message: RunningMessage) -> Option<JobState> {
        match self {
            JobState::Running { .. } => Some(JobState::Running {
                last_message: Some(message),
            }),
            // Late message emitted just before the pause took effect
            JobState::Pausing { .. } => Some(JobState::Pausing {
                last_message: Some(message),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queueing { previous } => {
                write!(f, "queueing (from {})", previous.to_state().kind())
            }
            JobState::Running { last_message } | JobState::Pausing { last_message } => {
                write!(f, "{}", self.kind())?;
                if let Some(ratio) = last_message.as_ref().and_then(RunningMessage::ratio) {
                    write!(f, " {:.1}%", ratio * 100.0)?;
                }
                Ok(())
            }
            JobState::Errored { reason } => write!(f, "errored: {}", reason),
            _ => write!(f, "{}", self.kind()),
        }
    }
}
