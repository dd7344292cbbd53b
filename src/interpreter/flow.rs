use super::flags::Width;
use super::operands::FarTarget;
use super::ExecutionUnit;
use crate::bridge::HostView;
use crate::consts::{HOST_RETURN_OFFSET, HOST_RETURN_SEGMENT, RELOCATION_SENTINEL};
use crate::error::{ExecResult, Fault};
use crate::far_ptr::FarPtr;
use crate::memory::Decoded;
use crate::registers::CpuFlags;
use crate::state::ExecuteState;

use iced_x86::{Mnemonic, OpKind};
use std::sync::Arc;

impl ExecutionUnit {
    pub(crate) fn op_jmp(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        let instruction = &d.instruction;
        match instruction.op0_kind() {
            OpKind::NearBranch16 => {
                self.registers.ip = instruction.near_branch16();
                Ok(ExecuteState::Jumped)
            }
            OpKind::FarBranch16 => match self.far_branch_target(d)? {
                FarTarget::Ptr(ptr) => {
                    self.registers.cs = ptr.segment;
                    self.registers.ip = ptr.offset;
                    Ok(ExecuteState::Jumped)
                }
                // A far jump cannot resume after the host returns; the
                // original never exhibits one into an import.
                FarTarget::Import { .. } => Err(Fault::unsupported_operands(instruction)),
            },
            OpKind::Register => {
                self.registers.ip = self.read_op(d, 0, Width::Word)? as u16;
                Ok(ExecuteState::Jumped)
            }
            OpKind::Memory if self.is_far_indirect(instruction) => {
                let (segment, offset) = self.effective_address(instruction)?;
                match self.read_far_target(segment, offset)? {
                    FarTarget::Ptr(ptr) => {
                        self.registers.cs = ptr.segment;
                        self.registers.ip = ptr.offset;
                        Ok(ExecuteState::Jumped)
                    }
                    FarTarget::Import { .. } => Err(Fault::unsupported_operands(instruction)),
                }
            }
            OpKind::Memory => {
                let (segment, offset) = self.effective_address(instruction)?;
                self.registers.ip = self.read_mem(segment, offset, Width::Word)? as u16;
                Ok(ExecuteState::Jumped)
            }
            _ => Err(Fault::unsupported_operands(instruction)),
        }
    }

    pub(crate) fn op_jcc(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        if self.condition_met(d.instruction.mnemonic())? {
            self.registers.ip = d.instruction.near_branch16();
            Ok(ExecuteState::Jumped)
        } else {
            Ok(ExecuteState::Proceed)
        }
    }

    fn condition_met(&self, mnemonic: Mnemonic) -> ExecResult<bool> {
        let flags = &self.registers.flags;
        let cf = flags.contains(CpuFlags::CF);
        let zf = flags.contains(CpuFlags::ZF);
        let sf = flags.contains(CpuFlags::SF);
        let of = flags.contains(CpuFlags::OF);
        let pf = flags.contains(CpuFlags::PF);
        Ok(match mnemonic {
            Mnemonic::Jo => of,
            Mnemonic::Jno => !of,
            Mnemonic::Jb => cf,
            Mnemonic::Jae => !cf,
            Mnemonic::Je => zf,
            Mnemonic::Jne => !zf,
            Mnemonic::Jbe => cf || zf,
            Mnemonic::Ja => !cf && !zf,
            Mnemonic::Js => sf,
            Mnemonic::Jns => !sf,
            Mnemonic::Jp => pf,
            Mnemonic::Jnp => !pf,
            Mnemonic::Jl => sf != of,
            Mnemonic::Jge => sf == of,
            Mnemonic::Jle => zf || sf != of,
            Mnemonic::Jg => !zf && sf == of,
            other => return Err(Fault::UnsupportedMnemonic(other)),
        })
    }

    /// `LOOP`/`LOOPE`/`LOOPNE` decrement CX and branch while it is nonzero
    /// (and the ZF condition holds); `JCXZ` tests CX without touching it.
    pub(crate) fn op_loop(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        let zf = self.registers.flag(CpuFlags::ZF);
        let taken = match d.instruction.mnemonic() {
            Mnemonic::Jcxz => self.registers.cx() == 0,
            mnemonic => {
                let cx = self.registers.cx().wrapping_sub(1);
                self.registers.set_cx(cx);
                cx != 0
                    && match mnemonic {
                        Mnemonic::Loope => zf,
                        Mnemonic::Loopne => !zf,
                        _ => true,
                    }
            }
        };
        if taken {
            self.registers.ip = d.instruction.near_branch16();
            Ok(ExecuteState::Jumped)
        } else {
            Ok(ExecuteState::Proceed)
        }
    }

    pub(crate) fn op_call(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        let instruction = &d.instruction;
        let return_ip = instruction.ip16().wrapping_add(instruction.len() as u16);
        match instruction.op0_kind() {
            OpKind::NearBranch16 => {
                self.push_word(return_ip)?;
                self.registers.ip = instruction.near_branch16();
                Ok(ExecuteState::Jumped)
            }
            OpKind::FarBranch16 => match self.far_branch_target(d)? {
                FarTarget::Ptr(ptr) => {
                    self.push_word(self.registers.cs)?;
                    self.push_word(return_ip)?;
                    self.registers.cs = ptr.segment;
                    self.registers.ip = ptr.offset;
                    Ok(ExecuteState::Jumped)
                }
                FarTarget::Import { module, ordinal } => {
                    self.host_invoke(module, ordinal)?;
                    Ok(ExecuteState::Proceed)
                }
            },
            OpKind::Register => {
                self.push_word(return_ip)?;
                self.registers.ip = self.read_op(d, 0, Width::Word)? as u16;
                Ok(ExecuteState::Jumped)
            }
            OpKind::Memory if self.is_far_indirect(instruction) => {
                let (segment, offset) = self.effective_address(instruction)?;
                match self.read_far_target(segment, offset)? {
                    FarTarget::Ptr(ptr) => {
                        self.push_word(self.registers.cs)?;
                        self.push_word(return_ip)?;
                        self.registers.cs = ptr.segment;
                        self.registers.ip = ptr.offset;
                        Ok(ExecuteState::Jumped)
                    }
                    FarTarget::Import { module, ordinal } => {
                        self.host_invoke(module, ordinal)?;
                        Ok(ExecuteState::Proceed)
                    }
                }
            }
            OpKind::Memory => {
                let (segment, offset) = self.effective_address(instruction)?;
                let target = self.read_mem(segment, offset, Width::Word)? as u16;
                self.push_word(return_ip)?;
                self.registers.ip = target;
                Ok(ExecuteState::Jumped)
            }
            _ => Err(Fault::unsupported_operands(instruction)),
        }
    }

    /// Resolve a direct far branch, consulting the relocation record at
    /// `CS:IP + 1` when the encoded selector is the loader sentinel.
    fn far_branch_target(&self, d: &Decoded) -> ExecResult<FarTarget> {
        let instruction = &d.instruction;
        let selector = instruction.far_branch_selector();
        let offset = instruction.far_branch16();
        if selector != RELOCATION_SENTINEL {
            return Ok(FarTarget::Ptr(FarPtr::new(selector, offset)));
        }
        let site = instruction.ip16().wrapping_add(1);
        match self.memory.relocation_at(self.registers.cs, site) {
            Some(target) => Ok(match target.far_ptr() {
                Some(ptr) => FarTarget::Ptr(ptr),
                None => FarTarget::Import {
                    module: target.selector(),
                    ordinal: target.word(),
                },
            }),
            None => Err(Fault::RelocationMissing {
                location: FarPtr::new(self.registers.cs, site),
            }),
        }
    }

    fn is_far_indirect(&self, instruction: &iced_x86::Instruction) -> bool {
        instruction.memory_size() == iced_x86::MemorySize::SegPtr16
    }

    /// Vector an imported far call to the host.
    ///
    /// No return address is pushed: the Pascal convention leaves only the
    /// caller's arguments on the stack and the callee discards them. IP is
    /// advanced past the `CALL` by the dispatcher once the host returns.
    pub(crate) fn host_invoke(&mut self, module: u16, ordinal: u16) -> ExecResult<()> {
        tracing::debug!(module, ordinal, "imported far call");
        let host = Arc::clone(&self.host);
        let view = HostView {
            registers: &mut self.registers,
            memory: &self.memory,
            pool: self.pool.as_ref(),
        };
        host.invoke(view, module, ordinal)
            .map_err(|cause| Fault::HostCall {
                module,
                ordinal,
                cause,
            })
    }

    pub(crate) fn op_ret(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        let target = self.pop_word()?;
        // A near return into the simulated far sentinel unwinds to the host:
        // consume the selector half as well so the stack balances.
        if target == HOST_RETURN_OFFSET && self.peek_word()? == HOST_RETURN_SEGMENT {
            self.pop_word()?;
            self.stack_adjust_from(d)?;
            return Ok(ExecuteState::Completed);
        }
        self.registers.ip = target;
        self.stack_adjust_from(d)?;
        Ok(ExecuteState::Jumped)
    }

    pub(crate) fn op_retf(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        let offset = self.pop_word()?;
        let selector = self.pop_word()?;
        self.stack_adjust_from(d)?;
        if FarPtr::new(selector, offset).is_host_return() {
            return Ok(ExecuteState::Completed);
        }
        self.registers.cs = selector;
        self.registers.ip = offset;
        Ok(ExecuteState::Jumped)
    }

    fn stack_adjust_from(&mut self, d: &Decoded) -> ExecResult<()> {
        if d.instruction.op_count() > 0 {
            let count = self.read_immediate(d, 0, Width::Word)? as u16;
            self.adjust_sp(count);
        }
        Ok(())
    }

    /// `INT n` and its one-byte forms route through the host's interrupt
    /// table; `INTO` only when OF is set.
    pub(crate) fn op_int(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        let vector = match d.instruction.mnemonic() {
            Mnemonic::Int3 => 3,
            Mnemonic::Into => {
                if !self.registers.flag(CpuFlags::OF) {
                    return Ok(ExecuteState::Proceed);
                }
                4
            }
            _ => self.read_immediate(d, 0, Width::Byte)? as u8,
        };
        tracing::debug!(vector, "software interrupt");
        let host = Arc::clone(&self.host);
        let view = HostView {
            registers: &mut self.registers,
            memory: &self.memory,
            pool: self.pool.as_ref(),
        };
        match host.interrupt(view, vector) {
            Ok(true) => Ok(ExecuteState::Proceed),
            Ok(false) => Err(Fault::UnhandledInterrupt { vector }),
            Err(cause) => Err(Fault::InterruptFailure { vector, cause }),
        }
    }

    /// `IRET` pops IP, CS, FLAGS. Like the far returns, popping the
    /// simulated sentinel terminates the unit.
    pub(crate) fn op_iret(&mut self) -> ExecResult<ExecuteState> {
        let offset = self.pop_word()?;
        let selector = self.pop_word()?;
        let raw_flags = self.pop_word()?;
        self.registers.flags = CpuFlags::sanitized(raw_flags);
        if FarPtr::new(selector, offset).is_host_return() {
            return Ok(ExecuteState::Completed);
        }
        self.registers.cs = selector;
        self.registers.ip = offset;
        Ok(ExecuteState::Jumped)
    }
}
