use super::ExecutionUnit;
use crate::error::{ExecResult, Fault};

impl ExecutionUnit {
    /// Push a word at `SS:SP - 2`.
    ///
    /// The stack grows down; a push that would wrap below offset zero is a
    /// stack fault rather than a silent wrap.
    pub(crate) fn push_word(&mut self, value: u16) -> ExecResult<()> {
        let sp = self.registers.sp();
        let new_sp = sp.checked_sub(2).ok_or(Fault::StackFault {
            segment: self.registers.ss,
            sp,
        })?;
        self.memory.set_word(self.registers.ss, new_sp, value)?;
        self.registers.set_sp(new_sp);
        Ok(())
    }

    /// Pop a word from `SS:SP`.
    ///
    /// Popping past the top of the segment is a stack fault.
    pub(crate) fn pop_word(&mut self) -> ExecResult<u16> {
        let sp = self.registers.sp();
        let new_sp = sp.checked_add(2).ok_or(Fault::StackFault {
            segment: self.registers.ss,
            sp,
        })?;
        let value = self.memory.word(self.registers.ss, sp)?;
        self.registers.set_sp(new_sp);
        Ok(value)
    }

    /// Read the word at `SS:SP` without adjusting `SP`.
    pub(crate) fn peek_word(&self) -> ExecResult<u16> {
        self.memory.word(self.registers.ss, self.registers.sp())
    }

    /// Discard `count` bytes from the stack, as the immediate forms of
    /// `RET`/`RETF` do.
    pub(crate) fn adjust_sp(&mut self, count: u16) {
        let sp = self.registers.sp().wrapping_add(count);
        self.registers.set_sp(sp);
    }
}
