use super::flags::Width;
use super::ExecutionUnit;
use crate::error::{ExecResult, Fault};
use crate::memory::Decoded;
use crate::registers::CpuFlags;

use iced_x86::{OpKind, Register};

impl ExecutionUnit {
    pub(crate) fn op_mov(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let value = self.read_op(d, 1, width)?;
        self.write_op(d, 0, width, value)
    }

    pub(crate) fn op_movzx(&mut self, d: &Decoded) -> ExecResult<()> {
        let src_width = self.operand_width(d, 1)?;
        let dst_width = self.operand_width(d, 0)?;
        let value = self.read_op(d, 1, src_width)?;
        self.write_op(d, 0, dst_width, value)
    }

    pub(crate) fn op_movsx(&mut self, d: &Decoded) -> ExecResult<()> {
        let src_width = self.operand_width(d, 1)?;
        let dst_width = self.operand_width(d, 0)?;
        let value = self.read_op(d, 1, src_width)?;
        let extended = src_width.sign_extend(value.into()) as u64 & dst_width.mask();
        self.write_op(d, 0, dst_width, extended as u32)
    }

    /// Width of a single operand, for the mixed-width extends.
    fn operand_width(&self, d: &Decoded, n: u32) -> ExecResult<Width> {
        let bytes = match d.instruction.op_kind(n) {
            OpKind::Register => d.instruction.op_register(n).size(),
            OpKind::Memory => d.instruction.memory_size().size(),
            _ => return Err(Fault::unsupported_operands(&d.instruction)),
        };
        Width::from_bytes(bytes).ok_or_else(|| Fault::unsupported_operands(&d.instruction))
    }

    pub(crate) fn op_xchg(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let a = self.read_op(d, 0, width)?;
        let b = self.read_op(d, 1, width)?;
        self.write_op(d, 0, width, b)?;
        self.write_op(d, 1, width, a)
    }

    /// `LEA` stores the offset half of the address computation; the segment
    /// is never consulted.
    pub(crate) fn op_lea(&mut self, d: &Decoded) -> ExecResult<()> {
        let (_, offset) = self.effective_address(&d.instruction)?;
        self.write_op(d, 0, Width::Word, offset.into())
    }

    pub(crate) fn op_lds(&mut self, d: &Decoded) -> ExecResult<()> {
        self.load_far_pointer(d, Register::DS)
    }

    pub(crate) fn op_les(&mut self, d: &Decoded) -> ExecResult<()> {
        self.load_far_pointer(d, Register::ES)
    }

    fn load_far_pointer(&mut self, d: &Decoded, segment_register: Register) -> ExecResult<()> {
        let (segment, offset) = self.effective_address(&d.instruction)?;
        let ptr = self.read_far_pointer(segment, offset)?;
        self.write_op(d, 0, Width::Word, ptr.offset.into())?;
        self.registers.set(segment_register, ptr.segment.into());
        Ok(())
    }

    pub(crate) fn op_push(&mut self, d: &Decoded) -> ExecResult<()> {
        let value = self.read_op(d, 0, Width::Word)?;
        self.push_word(value as u16)
    }

    pub(crate) fn op_pop(&mut self, d: &Decoded) -> ExecResult<()> {
        let value = self.pop_word()?;
        self.write_op(d, 0, Width::Word, value.into())
    }

    /// `PUSHA` pushes AX, CX, DX, BX, the pre-push SP, BP, SI, DI.
    pub(crate) fn op_pusha(&mut self) -> ExecResult<()> {
        let sp = self.registers.sp();
        for value in [
            self.registers.ax(),
            self.registers.cx(),
            self.registers.dx(),
            self.registers.bx(),
            sp,
            self.registers.bp(),
            self.registers.si(),
            self.registers.di(),
        ] {
            self.push_word(value)?;
        }
        Ok(())
    }

    /// `POPA` restores everything but SP, whose slot is discarded.
    pub(crate) fn op_popa(&mut self) -> ExecResult<()> {
        let di = self.pop_word()?;
        let si = self.pop_word()?;
        let bp = self.pop_word()?;
        let _sp = self.pop_word()?;
        let bx = self.pop_word()?;
        let dx = self.pop_word()?;
        let cx = self.pop_word()?;
        let ax = self.pop_word()?;
        self.registers.set_di(di);
        self.registers.set_si(si);
        self.registers.set_bp(bp);
        self.registers.set_bx(bx);
        self.registers.set_dx(dx);
        self.registers.set_cx(cx);
        self.registers.set_ax(ax);
        Ok(())
    }

    pub(crate) fn op_pushf(&mut self) -> ExecResult<()> {
        self.push_word(self.registers.flags.image())
    }

    pub(crate) fn op_popf(&mut self) -> ExecResult<()> {
        let raw = self.pop_word()?;
        self.registers.flags = CpuFlags::sanitized(raw);
        Ok(())
    }

    pub(crate) fn op_lahf(&mut self) {
        self.registers.set_ah(self.registers.flags.low_byte());
    }

    pub(crate) fn op_sahf(&mut self) {
        let ah = self.registers.ah();
        self.registers.flags.set_low_byte(ah);
    }

    pub(crate) fn op_cbw(&mut self) {
        self.registers.set_ax(self.registers.al() as i8 as i16 as u16);
    }

    pub(crate) fn op_cwd(&mut self) {
        let sign = if (self.registers.ax() as i16) < 0 { 0xFFFF } else { 0 };
        self.registers.set_dx(sign);
    }

    pub(crate) fn op_cwde(&mut self) {
        self.registers.set_eax(self.registers.ax() as i16 as i32 as u32);
    }

    pub(crate) fn op_cdq(&mut self) {
        let sign = if (self.registers.eax() as i32) < 0 { 0xFFFF_FFFF } else { 0 };
        self.registers.set_edx(sign);
    }

    /// `XLAT`: AL = `[seg:BX + AL]`, the table segment honoring an override.
    pub(crate) fn op_xlat(&mut self, d: &Decoded) -> ExecResult<()> {
        let segment_register = match d.instruction.segment_prefix() {
            Register::None => Register::DS,
            prefix => prefix,
        };
        let segment = self.registers.get(segment_register) as u16;
        let offset = self
            .registers
            .bx()
            .wrapping_add(self.registers.al().into());
        let value = self.memory.byte(segment, offset)?;
        self.registers.set_al(value);
        Ok(())
    }

    /// `ENTER size, nesting`: allocate a stack frame, copying the enclosing
    /// frame pointers for nested levels.
    pub(crate) fn op_enter(&mut self, d: &Decoded) -> ExecResult<()> {
        let size = self.read_immediate(d, 0, Width::Word)? as u16;
        let nesting = (self.read_immediate(d, 1, Width::Byte)? as u8) & 0x1F;
        self.push_word(self.registers.bp())?;
        let frame = self.registers.sp();
        if nesting > 0 {
            for _ in 1..nesting {
                let bp = self.registers.bp().wrapping_sub(2);
                self.registers.set_bp(bp);
                let slot = self.memory.word(self.registers.ss, bp)?;
                self.push_word(slot)?;
            }
            self.push_word(frame)?;
        }
        self.registers.set_bp(frame);
        let sp = self
            .registers
            .sp()
            .checked_sub(size)
            .ok_or(Fault::StackFault {
                segment: self.registers.ss,
                sp: self.registers.sp(),
            })?;
        self.registers.set_sp(sp);
        Ok(())
    }

    pub(crate) fn op_leave(&mut self) -> ExecResult<()> {
        self.registers.set_sp(self.registers.bp());
        let bp = self.pop_word()?;
        self.registers.set_bp(bp);
        Ok(())
    }
}
