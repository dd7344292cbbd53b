use super::flags::{self, FlagOp, Width};
use super::ExecutionUnit;
use crate::error::ExecResult;
use crate::memory::Decoded;
use crate::registers::CpuFlags;

use iced_x86::OpKind;

/// Which of the BT family is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitTestOp {
    Test,
    Set,
    Reset,
    Complement,
}

impl ExecutionUnit {
    pub(crate) fn op_and(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_logic(d, FlagOp::And, true)
    }

    pub(crate) fn op_or(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_logic(d, FlagOp::Or, true)
    }

    pub(crate) fn op_xor(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_logic(d, FlagOp::Xor, true)
    }

    pub(crate) fn op_test(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_logic(d, FlagOp::Test, false)
    }

    fn binary_logic(&mut self, d: &Decoded, op: FlagOp, store: bool) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let a = self.read_op(d, 0, width)?;
        let b = self.read_op(d, 1, width)?;
        let result = match op {
            FlagOp::And | FlagOp::Test => a & b,
            FlagOp::Or => a | b,
            _ => a ^ b,
        };
        if store {
            self.write_op(d, 0, width, result)?;
        }
        flags::evaluate(
            &mut self.registers.flags,
            op,
            width,
            a.into(),
            b.into(),
            result.into(),
        );
        Ok(())
    }

    /// `NOT` touches no flags.
    pub(crate) fn op_not(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let a = self.read_op(d, 0, width)?;
        self.write_op(d, 0, width, !a & width.mask() as u32)
    }

    pub(crate) fn op_shl(&mut self, d: &Decoded) -> ExecResult<()> {
        self.shift(d, FlagOp::Shl)
    }

    pub(crate) fn op_shr(&mut self, d: &Decoded) -> ExecResult<()> {
        self.shift(d, FlagOp::Shr)
    }

    pub(crate) fn op_sar(&mut self, d: &Decoded) -> ExecResult<()> {
        self.shift(d, FlagOp::Sar)
    }

    /// Plain shifts. The count masks to 5 bits; a masked count of zero
    /// leaves the value and every flag untouched.
    fn shift(&mut self, d: &Decoded, op: FlagOp) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let count = self.read_op(d, 1, Width::Byte)? & 0x1F;
        if count == 0 {
            return Ok(());
        }
        let a = u64::from(self.read_op(d, 0, width)?);
        let result = match op {
            FlagOp::Shl => a << count,
            FlagOp::Shr => a >> count,
            _ => (width.sign_extend(a) >> count.min(63)) as u64,
        };
        self.write_op(d, 0, width, (result & width.mask()) as u32)?;
        flags::evaluate(
            &mut self.registers.flags,
            op,
            width,
            a,
            count.into(),
            result,
        );
        Ok(())
    }

    pub(crate) fn op_rol(&mut self, d: &Decoded) -> ExecResult<()> {
        self.rotate(d, FlagOp::Rol)
    }

    pub(crate) fn op_ror(&mut self, d: &Decoded) -> ExecResult<()> {
        self.rotate(d, FlagOp::Ror)
    }

    fn rotate(&mut self, d: &Decoded, op: FlagOp) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let count = self.read_op(d, 1, Width::Byte)? & 0x1F;
        if count == 0 {
            return Ok(());
        }
        let a = self.read_op(d, 0, width)?;
        let left = op == FlagOp::Rol;
        let result = match width {
            Width::Byte => {
                let v = a as u8;
                u32::from(if left { v.rotate_left(count) } else { v.rotate_right(count) })
            }
            Width::Word => {
                let v = a as u16;
                u32::from(if left { v.rotate_left(count) } else { v.rotate_right(count) })
            }
            Width::Dword => {
                if left {
                    a.rotate_left(count)
                } else {
                    a.rotate_right(count)
                }
            }
        };
        self.write_op(d, 0, width, result)?;
        flags::evaluate(
            &mut self.registers.flags,
            op,
            width,
            a.into(),
            count.into(),
            result.into(),
        );
        Ok(())
    }

    pub(crate) fn op_rcl(&mut self, d: &Decoded) -> ExecResult<()> {
        self.rotate_through_carry(d, true)
    }

    pub(crate) fn op_rcr(&mut self, d: &Decoded) -> ExecResult<()> {
        self.rotate_through_carry(d, false)
    }

    /// Rotate through carry: the carry flag extends the operand to a
    /// `width + 1`-bit ring.
    fn rotate_through_carry(&mut self, d: &Decoded, left: bool) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let bits = width.bits();
        let ring = bits + 1;
        let count = (self.read_op(d, 1, Width::Byte)? & 0x1F) % ring;
        if count == 0 {
            return Ok(());
        }
        let a = u64::from(self.read_op(d, 0, width)?);
        let carry_in = u64::from(self.registers.flag(CpuFlags::CF));
        let extended = a | carry_in << bits;
        let ring_mask = (1u64 << ring) - 1;
        let rotated = if left {
            (extended << count | extended >> (ring - count)) & ring_mask
        } else {
            (extended >> count | extended << (ring - count)) & ring_mask
        };
        let result = rotated & width.mask();
        let carry_out = rotated >> bits & 1 != 0;
        self.write_op(d, 0, width, result as u32)?;
        self.registers.set_flag(CpuFlags::CF, carry_out);
        if count == 1 {
            let msb = result & width.sign_bit() != 0;
            let overflow = if left {
                msb != carry_out
            } else {
                msb != (result & (width.sign_bit() >> 1) != 0)
            };
            self.registers.set_flag(CpuFlags::OF, overflow);
        }
        Ok(())
    }

    pub(crate) fn op_bt(&mut self, d: &Decoded) -> ExecResult<()> {
        self.bit_test(d, BitTestOp::Test)
    }

    pub(crate) fn op_bts(&mut self, d: &Decoded) -> ExecResult<()> {
        self.bit_test(d, BitTestOp::Set)
    }

    pub(crate) fn op_btr(&mut self, d: &Decoded) -> ExecResult<()> {
        self.bit_test(d, BitTestOp::Reset)
    }

    pub(crate) fn op_btc(&mut self, d: &Decoded) -> ExecResult<()> {
        self.bit_test(d, BitTestOp::Complement)
    }

    /// Bit test family. A register bit offset addresses memory beyond the
    /// operand: the effective word steps by the signed offset divided by the
    /// operand width, Intel-style.
    fn bit_test(&mut self, d: &Decoded, op: BitTestOp) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let bits = width.bits() as i32;
        let raw = self.read_op(d, 1, width)?;
        let index = match d.instruction.op_kind(1) {
            OpKind::Register => width.sign_extend(raw.into()) as i32,
            _ => raw as i32 & (bits - 1),
        };
        let within = index.rem_euclid(bits) as u32;
        let (value, site) = match d.instruction.op_kind(0) {
            OpKind::Memory => {
                let (segment, mut offset) = self.effective_address(&d.instruction)?;
                let step = index.div_euclid(bits) * (bits / 8);
                offset = offset.wrapping_add(step as u16);
                (self.read_mem(segment, offset, width)?, Some((segment, offset)))
            }
            _ => (self.read_op(d, 0, width)?, None),
        };
        self.registers
            .set_flag(CpuFlags::CF, value >> within & 1 != 0);
        let updated = match op {
            BitTestOp::Test => return Ok(()),
            BitTestOp::Set => value | 1 << within,
            BitTestOp::Reset => value & !(1 << within),
            BitTestOp::Complement => value ^ 1 << within,
        };
        match site {
            Some((segment, offset)) => self.write_mem(segment, offset, width, updated),
            None => self.write_op(d, 0, width, updated),
        }
    }

    pub(crate) fn op_bsf(&mut self, d: &Decoded) -> ExecResult<()> {
        self.bit_scan(d, false)
    }

    pub(crate) fn op_bsr(&mut self, d: &Decoded) -> ExecResult<()> {
        self.bit_scan(d, true)
    }

    /// Bit scan: a zero source sets ZF and leaves the destination alone.
    fn bit_scan(&mut self, d: &Decoded, reverse: bool) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let src = self.read_op(d, 1, width)?;
        if src == 0 {
            self.registers.set_flag(CpuFlags::ZF, true);
            return Ok(());
        }
        self.registers.set_flag(CpuFlags::ZF, false);
        let index = if reverse {
            31 - src.leading_zeros()
        } else {
            src.trailing_zeros()
        };
        self.write_op(d, 0, width, index)
    }
}
