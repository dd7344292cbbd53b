//! Host callback bridge
//!
//! Far calls whose relocation record names an imported module vector through
//! [`HostCalls::invoke`]; software interrupts route through
//! [`HostCalls::interrupt`]. The callback runs on the guest's thread with
//! full access to the register file and memory, and may re-enter guest code
//! by checking out another unit from the pool it is handed.

use crate::error::{ExecResult, Fault, HostError};
use crate::far_ptr::FarPtr;
use crate::memory::SharedMemory;
use crate::pool::UnitPool;
use crate::registers::CpuRegisters;

/// The exported-module dictionary of one guest module.
///
/// Implementations hold the host side of the emulated API, keyed by
/// `(module ordinal, function ordinal)`. The calling convention on entry is
/// 16-bit Pascal: arguments were pushed left to right by the guest `CALL`'s
/// caller and no return address is on the stack; the callee reads arguments
/// relative to `SS:SP`, writes its return value into `AX` (or `DX:AX`), and
/// discards the arguments before returning.
pub trait HostCalls: Send + Sync {
    /// Service an imported far call.
    fn invoke(&self, vm: HostView<'_>, module: u16, ordinal: u16) -> Result<(), HostError>;

    /// Service a software interrupt. Return `Ok(false)` when the vector has
    /// no entry in the host's interrupt table, which faults the unit.
    fn interrupt(&self, vm: HostView<'_>, vector: u8) -> Result<bool, HostError> {
        let _ = (vm, vector);
        Ok(false)
    }
}

/// Host with an empty exported-module dictionary; every import call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHost;

impl HostCalls for NoHost {
    fn invoke(&self, _vm: HostView<'_>, module: u16, ordinal: u16) -> Result<(), HostError> {
        Err(format!("no exported module registered for ({module}, {ordinal})").into())
    }
}

/// The guest state a host callback may touch, for the duration of the call.
pub struct HostView<'a> {
    /// Register file of the invoking unit.
    pub registers: &'a mut CpuRegisters,
    /// The module's shared memory image.
    pub memory: &'a SharedMemory,
    /// Unit pool for nested guest entry, when the unit came from a pool.
    pub pool: Option<&'a UnitPool>,
}

impl HostView<'_> {
    /// Read the `index`th word argument above `SS:SP`.
    pub fn arg(&self, index: u16) -> ExecResult<u16> {
        let offset = self.registers.sp().wrapping_add(index.wrapping_mul(2));
        self.memory.word(self.registers.ss, offset)
    }

    /// Read a dword argument spanning `index` and `index + 1`.
    pub fn arg_dword(&self, index: u16) -> ExecResult<u32> {
        let lo = self.arg(index)?;
        let hi = self.arg(index + 1)?;
        Ok(u32::from(hi) << 16 | u32::from(lo))
    }

    /// Read a far-pointer argument (offset word first, then selector).
    pub fn arg_far_ptr(&self, index: u16) -> ExecResult<FarPtr> {
        Ok(FarPtr::from_dword(self.arg_dword(index)?))
    }

    /// Store a 16-bit return value in `AX`.
    pub fn set_return(&mut self, value: u16) {
        self.registers.set_ax(value);
    }

    /// Store a 32-bit return value in `DX:AX`.
    pub fn set_return_dword(&mut self, value: u32) {
        self.registers.set_ax(value as u16);
        self.registers.set_dx((value >> 16) as u16);
    }

    /// Store a far-pointer return value in `DX:AX`.
    pub fn set_return_far_ptr(&mut self, ptr: FarPtr) {
        self.set_return_dword(ptr.to_dword());
    }

    /// Discard `count` word arguments, per the callee-cleans convention.
    pub fn discard_args(&mut self, count: u16) {
        let sp = self.registers.sp().wrapping_add(count.wrapping_mul(2));
        self.registers.set_sp(sp);
    }

    /// Check a unit out of the pool and run a nested guest entry.
    ///
    /// Fails with [`Fault::Cancelled`] semantics only through the nested
    /// run itself; a view without a pool reports a host error instead.
    pub fn reenter(
        &self,
        params: crate::interpreter::ExecutionParams,
    ) -> ExecResult<CpuRegisters> {
        let pool = self.pool.ok_or_else(|| Fault::HostCall {
            module: 0,
            ordinal: 0,
            cause: "nested guest entry requires a pooled execution unit".into(),
        })?;
        pool.checkout().execute(params)
    }
}
