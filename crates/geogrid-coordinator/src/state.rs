//! Coordinator lifecycle phase.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::lock;

/// Coarse lifecycle stage of the grid. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GridPhase {
    /// Accepting JOINs until capacity is reached.
    Signup,
    /// Grid built; nodes are serving queries.
    Running,
    /// Grid torn down.
    Shutdown,
}

impl std::fmt::Display for GridPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signup => write!(f, "Signup"),
            Self::Running => write!(f, "Running"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Snapshot of the coordinator's grid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridState {
    pub phase: GridPhase,
    pub capacity: usize,
    /// Nodes admitted during signup. Never exceeds `capacity`.
    pub admitted: usize,
}

/// Current phase behind a lock, with forward-only transitions.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Mutex<GridPhase>,
}

impl PhaseTracker {
    /// Create a tracker in `Signup`.
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(GridPhase::Signup),
        }
    }

    pub fn current(&self) -> GridPhase {
        *lock(&self.phase)
    }

    /// Move to `next`. Fails unless `next` is strictly later than the current phase.
    pub fn advance(&self, next: GridPhase) -> Result<GridPhase> {
        let mut phase = lock(&self.phase);
        if next <= *phase {
            return Err(Error::InvalidPhase {
                expected: match next {
                    GridPhase::Signup => "nothing (Signup is initial)",
                    GridPhase::Running => "Signup",
                    GridPhase::Shutdown => "Signup or Running",
                },
                actual: phase.to_string(),
            });
        }
        let previous = *phase;
        *phase = next;
        Ok(previous)
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
