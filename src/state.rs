//! Runtime state representation for the execution unit

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Resulting state of a single instruction dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecuteState {
    /// Control falls through; the unit advances IP past the instruction.
    #[default]
    Proceed,
    /// The instruction already wrote CS and/or IP; the unit must not touch
    /// them.
    Jumped,
    /// A return popped the simulated host return address.
    Completed,
    /// A `HLT` suspended the unit until an external wake.
    Halted,
}

impl ExecuteState {
    /// Return true if the unit should keep dispatching instructions.
    pub const fn should_continue(&self) -> bool {
        matches!(self, Self::Proceed | Self::Jumped)
    }
}

/// Terminal state of one guest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ExitStatus {
    /// The guest returned to the simulated host return address.
    Completed,
    /// The guest executed `HLT`.
    Halted,
}

/// Cooperative cancellation flag consulted between instructions.
///
/// Clones share the flag; the host keeps one half and hands the other to the
/// unit (or pool). Instructions are atomic with respect to cancellation.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next instruction boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Re-arm the token for another run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}
