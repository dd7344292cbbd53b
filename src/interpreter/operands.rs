use super::flags::Width;
use super::ExecutionUnit;
use crate::consts::RELOCATION_SENTINEL;
use crate::error::{ExecResult, Fault};
use crate::far_ptr::FarPtr;
use crate::memory::Decoded;
use crate::relocation::RelocationTarget;

use iced_x86::{Instruction, OpKind};

/// Target of an indirect far control transfer.
///
/// A far pointer slot in memory may be a real address or a fix-up site whose
/// record names an imported function; control-flow reads must distinguish
/// the two so import calls vector through the bridge.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FarTarget {
    Ptr(FarPtr),
    Import { module: u16, ordinal: u16 },
}

impl ExecutionUnit {
    /// Operand width of an instruction, inferred from its first sized
    /// operand (register size, else memory operand size).
    pub(crate) fn op_width(&self, instruction: &Instruction) -> ExecResult<Width> {
        for n in 0..instruction.op_count() {
            let bytes = match instruction.op_kind(n) {
                OpKind::Register => instruction.op_register(n).size(),
                OpKind::Memory => instruction.memory_size().size(),
                _ => continue,
            };
            if let Some(width) = Width::from_bytes(bytes) {
                return Ok(width);
            }
        }
        match instruction.memory_size().size() {
            0 => Ok(Width::Word),
            bytes => Width::from_bytes(bytes)
                .ok_or_else(|| Fault::unsupported_operands(instruction)),
        }
    }

    /// Resolve a memory operand to `(segment, offset)`.
    ///
    /// Offset arithmetic is unsigned 16-bit and wraps. The segment honors an
    /// override prefix, else the base register's default (`SS` for `BP`
    /// forms, `DS` otherwise); the decoder reports exactly that register.
    pub(crate) fn effective_address(&self, instruction: &Instruction) -> ExecResult<(u16, u16)> {
        let base = self.registers.get(instruction.memory_base()) as u16;
        let index = self.registers.get(instruction.memory_index()) as u16;
        let displacement = instruction.memory_displacement32() as u16;
        let offset = base.wrapping_add(index).wrapping_add(displacement);
        let segment = self.registers.get(instruction.memory_segment()) as u16;
        Ok((segment, offset))
    }

    /// Read operand `n` at `width`, applying relocation redirection on the
    /// immediate and memory paths.
    pub(crate) fn read_op(&mut self, decoded: &Decoded, n: u32, width: Width) -> ExecResult<u32> {
        let instruction = &decoded.instruction;
        match instruction.op_kind(n) {
            OpKind::Register => {
                let register = instruction.op_register(n);
                if !crate::registers::is_real_mode_register(register) {
                    return Err(Fault::unsupported_operands(instruction));
                }
                Ok(self.registers.get(register) & width.mask() as u32)
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32 => self.read_immediate(decoded, n, width),
            OpKind::Memory => {
                let (segment, offset) = self.effective_address(instruction)?;
                self.read_mem(segment, offset, width)
            }
            OpKind::NearBranch16 => Ok(instruction.near_branch16().into()),
            _ => Err(Fault::unsupported_operands(instruction)),
        }
    }

    /// Write `value` through operand `n` at `width`.
    pub(crate) fn write_op(
        &mut self,
        decoded: &Decoded,
        n: u32,
        width: Width,
        value: u32,
    ) -> ExecResult<()> {
        let instruction = &decoded.instruction;
        match instruction.op_kind(n) {
            OpKind::Register => {
                let register = instruction.op_register(n);
                if !crate::registers::is_real_mode_register(register) {
                    return Err(Fault::unsupported_operands(instruction));
                }
                self.registers.set(register, value);
                Ok(())
            }
            OpKind::Memory => {
                let (segment, offset) = self.effective_address(instruction)?;
                self.write_mem(segment, offset, width, value)
            }
            _ => Err(Fault::unsupported_operands(instruction)),
        }
    }

    /// Decode an immediate operand, extending it to `width` per its kind
    /// (`Immediate8to16`/`Immediate8to32` sign-extend, the rest zero-extend).
    ///
    /// An immediate whose masked value is the relocation sentinel is checked
    /// against the record index at `CS:(instruction start + immediate
    /// offset)`; a registered record substitutes its resolved target.
    pub(crate) fn read_immediate(
        &self,
        decoded: &Decoded,
        n: u32,
        width: Width,
    ) -> ExecResult<u32> {
        let instruction = &decoded.instruction;
        let value = match instruction.op_kind(n) {
            OpKind::Immediate8 => u32::from(instruction.immediate8()),
            OpKind::Immediate8_2nd => u32::from(instruction.immediate8_2nd()),
            OpKind::Immediate16 => u32::from(instruction.immediate16()),
            OpKind::Immediate32 => instruction.immediate32(),
            OpKind::Immediate8to16 => instruction.immediate8to16() as u16 as u32,
            OpKind::Immediate8to32 => instruction.immediate8to32() as u32,
            _ => return Err(Fault::unsupported_operands(instruction)),
        };
        if value as u16 == RELOCATION_SENTINEL {
            if let Some(imm_offset) = decoded.immediate_offset {
                let site = instruction.ip16().wrapping_add(imm_offset.into());
                if let Some(target) = self.memory.relocation_at(self.registers.cs, site) {
                    let resolved = match width {
                        Width::Dword => target.dword(),
                        _ => target.word().into(),
                    };
                    return Ok(resolved);
                }
            }
        }
        Ok(value & width.mask() as u32)
    }

    /// Operand-path memory read with relocation redirection: a word or dword
    /// read exactly at a fix-up site yields the record's resolved target
    /// instead of the on-disk sentinel.
    pub(crate) fn read_mem(&self, segment: u16, offset: u16, width: Width) -> ExecResult<u32> {
        if width != Width::Byte {
            if let Some(target) = self.memory.relocation_at(segment, offset) {
                return Ok(match width {
                    Width::Dword => target.dword(),
                    _ => target.word().into(),
                });
            }
        }
        match width {
            Width::Byte => Ok(self.memory.byte(segment, offset)?.into()),
            Width::Word => Ok(self.memory.word(segment, offset)?.into()),
            Width::Dword => self.memory.dword(segment, offset),
        }
    }

    /// Operand-path memory write.
    pub(crate) fn write_mem(
        &mut self,
        segment: u16,
        offset: u16,
        width: Width,
        value: u32,
    ) -> ExecResult<()> {
        match width {
            Width::Byte => self.memory.set_byte(segment, offset, value as u8),
            Width::Word => self.memory.set_word(segment, offset, value as u16),
            Width::Dword => self.memory.set_dword(segment, offset, value),
        }
    }

    /// Read a far pointer (`m16:16`) for a data load such as `LDS`/`LES`,
    /// honoring word-level relocation redirection.
    pub(crate) fn read_far_pointer(&self, segment: u16, offset: u16) -> ExecResult<FarPtr> {
        Ok(FarPtr::from_dword(self.read_mem(segment, offset, Width::Dword)?))
    }

    /// Read a far control-transfer target, distinguishing fix-up sites that
    /// name imported functions from real far pointers.
    ///
    /// A raw slot whose selector half is the relocation sentinel with no
    /// record registered is a loader defect and faults.
    pub(crate) fn read_far_target(&self, segment: u16, offset: u16) -> ExecResult<FarTarget> {
        if let Some(target) = self.memory.relocation_at(segment, offset) {
            return Ok(match target {
                RelocationTarget::Internal(ptr) => FarTarget::Ptr(ptr),
                RelocationTarget::ImportOrdinal { module, ordinal } => {
                    FarTarget::Import { module, ordinal }
                }
                RelocationTarget::ImportName { module, name_offset } => FarTarget::Import {
                    module,
                    ordinal: name_offset,
                },
            });
        }
        let ptr = FarPtr::from_dword(self.memory.dword(segment, offset)?);
        if ptr.segment == RELOCATION_SENTINEL {
            return Err(Fault::RelocationMissing {
                location: FarPtr::new(segment, offset),
            });
        }
        Ok(FarTarget::Ptr(ptr))
    }
}
