//! Concurrency admission.
//!
//! The decision is a pure function of the number of jobs currently holding a
//! worker slot and the configured ceiling. The registry recounts the slots on
//! every call instead of keeping a counter that could drift from job state.

/// Whether another job may start while `running` jobs hold a slot.
pub fn can_admit(running: usize, limit: usize) -> bool {
    running < limit
}

/// Snapshot of the inputs to [`can_admit`], handed to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub running: usize,
    pub limit: usize,
}

impl Admission {
    pub fn new(running: usize, limit: usize) -> Self {
        Self { running, limit }
    }

    pub fn admits(&self) -> bool {
        can_admit(self.running, self.limit)
    }
}
