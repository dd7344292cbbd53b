//! [`ExecutionUnit`] implementation

use crate::bridge::HostCalls;
use crate::consts::DEFAULT_INITIAL_SP;
use crate::far_ptr::FarPtr;
use crate::memory::SharedMemory;
use crate::pool::UnitPool;
use crate::registers::CpuRegisters;
use crate::state::CancelToken;

use std::fmt;
use std::sync::Arc;

mod alu;
mod bit;
mod data;
mod executors;
mod flags;
mod flow;
pub mod fpu;
mod internal;
mod operands;
mod string;

pub use fpu::{FpuControl, FpuRegisters, FpuStatus, Rounding};

/// One logical thread of guest execution.
///
/// A unit owns its register file and borrows the module's shared memory and
/// exported-module dictionary. Units are pooled per module: one is checked
/// out at the start of a guest entry and recycled on its completion, so a
/// host callback that re-enters guest code gets a distinct register file and
/// the caller's state survives untouched.
pub struct ExecutionUnit {
    registers: CpuRegisters,
    memory: SharedMemory,
    host: Arc<dyn HostCalls>,
    cancel: CancelToken,
    instruction_budget: Option<u64>,
    executed: u64,
    pool: Option<UnitPool>,
}

impl ExecutionUnit {
    /// Create a standalone unit against `memory` with `host` as the callback
    /// table. Units that should support nested host-to-guest entry come from
    /// a [`UnitPool`] instead.
    pub fn new(memory: SharedMemory, host: Arc<dyn HostCalls>) -> Self {
        Self {
            registers: CpuRegisters::new(),
            memory,
            host,
            cancel: CancelToken::new(),
            instruction_budget: None,
            executed: 0,
            pool: None,
        }
    }

    /// The unit's register file.
    pub fn registers(&self) -> &CpuRegisters {
        &self.registers
    }

    /// Mutable access to the register file, for host setup and callbacks.
    pub fn registers_mut(&mut self) -> &mut CpuRegisters {
        &mut self.registers
    }

    /// The shared memory image this unit runs against.
    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    /// Replace the cancellation token consulted between instructions.
    pub fn set_cancel_token(&mut self, cancel: CancelToken) {
        self.cancel = cancel;
    }

    /// The unit's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Bound the next guest entry to `budget` instructions; `None` removes
    /// the bound. Exhaustion surfaces as [`crate::error::Fault::Cancelled`].
    pub fn set_instruction_budget(&mut self, budget: Option<u64>) {
        self.instruction_budget = budget;
    }

    /// Instructions retired by the current (or last) guest entry.
    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    pub(crate) fn attach_pool(&mut self, pool: UnitPool) {
        self.pool = Some(pool);
    }

    pub(crate) fn detach_pool(&mut self) {
        self.pool = None;
    }

    pub(crate) fn pool(&self) -> Option<&UnitPool> {
        self.pool.as_ref()
    }
}

impl fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("registers", &self.registers)
            .field("executed", &self.executed)
            .field("pooled", &self.pool.is_some())
            .finish_non_exhaustive()
    }
}

/// Parameters of one guest entry.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    /// Where execution starts.
    pub entry_point: FarPtr,
    /// Channel number seeded into `AX` by the standard startup state.
    pub channel: u16,
    /// Push a simulated far return address so the entry's final `RETF`
    /// terminates the unit instead of transferring control.
    pub simulate_call_far: bool,
    /// Skip the standard startup state and run on the register file as the
    /// caller prepared it.
    pub bypass_state: bool,
    /// Words pushed before entry, rightmost first.
    pub initial_stack: Vec<u16>,
    /// Stack pointer before the initial pushes.
    pub initial_sp: u16,
}

impl Default for ExecutionParams {
    fn default() -> Self {
        Self {
            entry_point: FarPtr::default(),
            channel: 0,
            simulate_call_far: false,
            bypass_state: false,
            initial_stack: Vec::new(),
            initial_sp: DEFAULT_INITIAL_SP,
        }
    }
}

impl ExecutionParams {
    /// Entry at `entry_point` with every other parameter at its default.
    pub fn at(entry_point: FarPtr) -> Self {
        Self {
            entry_point,
            ..Self::default()
        }
    }
}
