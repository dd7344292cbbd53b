//! 16-bit x86 execution core for a MajorBBS/Worldgroup host emulator.
//!
//! The crate interprets real-mode 8086/80186/80286 integer code plus an x87
//! floating-point stack against a segmented memory image, with a
//! relocation-aware bridge that traps far calls into host-provided exported
//! modules. Loading of NE containers, the exported-module function library,
//! and all session plumbing live with the host; this crate is only the
//! instruction-level core they drive.
//!
//! The usual shape of an embedding:
//!
//! 1. Build a [`memory::SegmentedMemory`], adding each segment the loader
//!    decoded together with its relocation records, and wrap it in a
//!    [`memory::SharedMemory`].
//! 2. Implement [`bridge::HostCalls`] over the emulated API library.
//! 3. Create a [`pool::UnitPool`] and, for every guest entry point, check
//!    out a unit and call [`interpreter::ExecutionUnit::execute`].

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod bridge;
pub mod consts;
pub mod error;
pub mod far_ptr;
pub mod interpreter;
pub mod memory;
pub mod pool;
pub mod registers;
pub mod relocation;
pub mod state;

/// Required reexports for a functional host.
pub mod prelude {
    pub use crate::bridge::{HostCalls, HostView, NoHost};
    pub use crate::error::{ExecResult, Fault, FpuException, HostError};
    pub use crate::far_ptr::FarPtr;
    pub use crate::interpreter::{
        ExecutionParams, ExecutionUnit, FpuControl, FpuRegisters, FpuStatus, Rounding,
    };
    pub use crate::memory::{Decoded, SegmentKind, SegmentedMemory, SharedMemory};
    pub use crate::pool::{PooledUnit, UnitPool};
    pub use crate::registers::{CpuFlags, CpuRegisters};
    pub use crate::relocation::{RelocationRecord, RelocationTarget};
    pub use crate::state::{CancelToken, ExecuteState, ExitStatus};
}
