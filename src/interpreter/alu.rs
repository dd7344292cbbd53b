use super::flags::{self, FlagOp, Width};
use super::ExecutionUnit;
use crate::error::{ExecResult, Fault};
use crate::memory::Decoded;
use crate::registers::CpuFlags;

impl ExecutionUnit {
    pub(crate) fn op_add(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_arith(d, FlagOp::Add)
    }

    pub(crate) fn op_adc(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_arith(d, FlagOp::Adc)
    }

    pub(crate) fn op_sub(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_arith(d, FlagOp::Sub)
    }

    pub(crate) fn op_sbb(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_arith(d, FlagOp::Sbb)
    }

    pub(crate) fn op_cmp(&mut self, d: &Decoded) -> ExecResult<()> {
        self.binary_arith(d, FlagOp::Cmp)
    }

    /// Shared body of the two-operand add/subtract family. `Cmp` evaluates
    /// flags without storing; `Adc`/`Sbb` fold the incoming carry into the
    /// second operand.
    fn binary_arith(&mut self, d: &Decoded, op: FlagOp) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let a = u64::from(self.read_op(d, 0, width)?);
        let b = u64::from(self.read_op(d, 1, width)?);
        let carry = matches!(op, FlagOp::Adc | FlagOp::Sbb)
            && self.registers.flag(CpuFlags::CF);
        let b = b + u64::from(carry);
        let result = match op {
            FlagOp::Add | FlagOp::Adc => a + b,
            _ => a.wrapping_sub(b),
        };
        if !matches!(op, FlagOp::Cmp) {
            self.write_op(d, 0, width, (result & width.mask()) as u32)?;
        }
        flags::evaluate(&mut self.registers.flags, op, width, a, b, result);
        Ok(())
    }

    pub(crate) fn op_inc(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let a = u64::from(self.read_op(d, 0, width)?);
        let result = a + 1;
        self.write_op(d, 0, width, (result & width.mask()) as u32)?;
        flags::evaluate(&mut self.registers.flags, FlagOp::Inc, width, a, 1, result);
        Ok(())
    }

    pub(crate) fn op_dec(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let a = u64::from(self.read_op(d, 0, width)?);
        let result = a.wrapping_sub(1);
        self.write_op(d, 0, width, (result & width.mask()) as u32)?;
        flags::evaluate(&mut self.registers.flags, FlagOp::Dec, width, a, 1, result);
        Ok(())
    }

    pub(crate) fn op_neg(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let b = u64::from(self.read_op(d, 0, width)?);
        let result = 0u64.wrapping_sub(b);
        self.write_op(d, 0, width, (result & width.mask()) as u32)?;
        flags::evaluate(&mut self.registers.flags, FlagOp::Neg, width, 0, b, result);
        Ok(())
    }

    pub(crate) fn op_mul(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let src = u64::from(self.read_op(d, 0, width)?);
        let product = match width {
            Width::Byte => {
                let product = u64::from(self.registers.al()) * src;
                self.registers.set_ax(product as u16);
                product
            }
            Width::Word => {
                let product = u64::from(self.registers.ax()) * src;
                self.registers.set_ax(product as u16);
                self.registers.set_dx((product >> 16) as u16);
                product
            }
            Width::Dword => {
                let product = u64::from(self.registers.eax()) * src;
                self.registers.set_eax(product as u32);
                self.registers.set_edx((product >> 32) as u32);
                product
            }
        };
        flags::evaluate(
            &mut self.registers.flags,
            FlagOp::Mul,
            width,
            0,
            src,
            product,
        );
        Ok(())
    }

    pub(crate) fn op_imul(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        match d.instruction.op_count() {
            // One-operand form: widening multiply into the accumulator pair.
            1 => {
                let src = width.sign_extend(u64::from(self.read_op(d, 0, width)?));
                let product = match width {
                    Width::Byte => {
                        let product = i64::from(self.registers.al() as i8) * src;
                        self.registers.set_ax(product as u16);
                        product
                    }
                    Width::Word => {
                        let product = i64::from(self.registers.ax() as i16) * src;
                        self.registers.set_ax(product as u16);
                        self.registers.set_dx((product >> 16) as u16);
                        product
                    }
                    Width::Dword => {
                        let product = i64::from(self.registers.eax() as i32) * src;
                        self.registers.set_eax(product as u32);
                        self.registers.set_edx((product >> 32) as u32);
                        product
                    }
                };
                flags::evaluate(
                    &mut self.registers.flags,
                    FlagOp::IMul,
                    width,
                    0,
                    src as u64,
                    product as u64,
                );
            }
            // Two- and three-operand forms truncate into a register.
            count @ (2 | 3) => {
                let a = width.sign_extend(u64::from(self.read_op(d, count - 2, width)?));
                let b = width.sign_extend(u64::from(self.read_op(d, count - 1, width)?));
                let product = a.wrapping_mul(b);
                self.write_op(d, 0, width, (product as u64 & width.mask()) as u32)?;
                flags::evaluate(
                    &mut self.registers.flags,
                    FlagOp::IMul,
                    width,
                    a as u64,
                    b as u64,
                    product as u64,
                );
            }
            _ => return Err(Fault::unsupported_operands(&d.instruction)),
        }
        Ok(())
    }

    pub(crate) fn op_div(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let divisor = u64::from(self.read_op(d, 0, width)?);
        if divisor == 0 {
            return Err(Fault::DivideError);
        }
        match width {
            Width::Byte => {
                let dividend = u64::from(self.registers.ax());
                let quotient = dividend / divisor;
                if quotient > 0xFF {
                    return Err(Fault::DivideError);
                }
                self.registers.set_al(quotient as u8);
                self.registers.set_ah((dividend % divisor) as u8);
            }
            Width::Word => {
                let dividend =
                    u64::from(self.registers.dx()) << 16 | u64::from(self.registers.ax());
                let quotient = dividend / divisor;
                if quotient > 0xFFFF {
                    return Err(Fault::DivideError);
                }
                self.registers.set_ax(quotient as u16);
                self.registers.set_dx((dividend % divisor) as u16);
            }
            Width::Dword => {
                let dividend =
                    u64::from(self.registers.edx()) << 32 | u64::from(self.registers.eax());
                let quotient = dividend / divisor;
                if quotient > u64::from(u32::MAX) {
                    return Err(Fault::DivideError);
                }
                self.registers.set_eax(quotient as u32);
                self.registers.set_edx((dividend % divisor) as u32);
            }
        }
        Ok(())
    }

    pub(crate) fn op_idiv(&mut self, d: &Decoded) -> ExecResult<()> {
        let width = self.op_width(&d.instruction)?;
        let divisor = width.sign_extend(u64::from(self.read_op(d, 0, width)?));
        if divisor == 0 {
            return Err(Fault::DivideError);
        }
        match width {
            Width::Byte => {
                let dividend = i64::from(self.registers.ax() as i16);
                let quotient = dividend / divisor;
                if quotient < i64::from(i8::MIN) || quotient > i64::from(i8::MAX) {
                    return Err(Fault::DivideError);
                }
                self.registers.set_al(quotient as u8);
                self.registers.set_ah((dividend % divisor) as u8);
            }
            Width::Word => {
                let dividend = i64::from(
                    (i32::from(self.registers.dx() as i16) << 16)
                        | i32::from(self.registers.ax()),
                );
                let quotient = dividend / divisor;
                if quotient < i64::from(i16::MIN) || quotient > i64::from(i16::MAX) {
                    return Err(Fault::DivideError);
                }
                self.registers.set_ax(quotient as u16);
                self.registers.set_dx((dividend % divisor) as u16);
            }
            Width::Dword => {
                let dividend = (i64::from(self.registers.edx() as i32) << 32)
                    | i64::from(self.registers.eax());
                let quotient = dividend
                    .checked_div(divisor)
                    .ok_or(Fault::DivideError)?;
                if quotient < i64::from(i32::MIN) || quotient > i64::from(i32::MAX) {
                    return Err(Fault::DivideError);
                }
                self.registers.set_eax(quotient as u32);
                self.registers.set_edx((dividend % divisor) as u32);
            }
        }
        Ok(())
    }

    /* BCD adjustments */

    pub(crate) fn op_daa(&mut self) {
        let old_al = self.registers.al();
        let old_cf = self.registers.flag(CpuFlags::CF);
        let mut al = old_al;
        if old_al & 0x0F > 9 || self.registers.flag(CpuFlags::AF) {
            let (adjusted, carried) = al.overflowing_add(6);
            al = adjusted;
            self.registers.set_flag(CpuFlags::CF, old_cf || carried);
            self.registers.set_flag(CpuFlags::AF, true);
        } else {
            self.registers.set_flag(CpuFlags::AF, false);
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_add(0x60);
            self.registers.set_flag(CpuFlags::CF, true);
        } else {
            self.registers.set_flag(CpuFlags::CF, false);
        }
        self.registers.set_al(al);
        flags::set_szp(&mut self.registers.flags, Width::Byte, al.into());
    }

    pub(crate) fn op_das(&mut self) {
        let old_al = self.registers.al();
        let old_cf = self.registers.flag(CpuFlags::CF);
        let mut al = old_al;
        let mut cf = false;
        if old_al & 0x0F > 9 || self.registers.flag(CpuFlags::AF) {
            let (adjusted, borrowed) = al.overflowing_sub(6);
            al = adjusted;
            cf = old_cf || borrowed;
            self.registers.set_flag(CpuFlags::AF, true);
        } else {
            self.registers.set_flag(CpuFlags::AF, false);
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_sub(0x60);
            cf = true;
        }
        self.registers.set_flag(CpuFlags::CF, cf);
        self.registers.set_al(al);
        flags::set_szp(&mut self.registers.flags, Width::Byte, al.into());
    }

    pub(crate) fn op_aaa(&mut self) {
        let adjust = self.registers.al() & 0x0F > 9 || self.registers.flag(CpuFlags::AF);
        if adjust {
            self.registers.set_al(self.registers.al().wrapping_add(6));
            self.registers.set_ah(self.registers.ah().wrapping_add(1));
        }
        self.registers.set_flag(CpuFlags::AF, adjust);
        self.registers.set_flag(CpuFlags::CF, adjust);
        self.registers.set_al(self.registers.al() & 0x0F);
    }

    pub(crate) fn op_aas(&mut self) {
        let adjust = self.registers.al() & 0x0F > 9 || self.registers.flag(CpuFlags::AF);
        if adjust {
            self.registers.set_al(self.registers.al().wrapping_sub(6));
            self.registers.set_ah(self.registers.ah().wrapping_sub(1));
        }
        self.registers.set_flag(CpuFlags::AF, adjust);
        self.registers.set_flag(CpuFlags::CF, adjust);
        self.registers.set_al(self.registers.al() & 0x0F);
    }

    pub(crate) fn op_aam(&mut self, d: &Decoded) -> ExecResult<()> {
        let base = self.read_immediate(d, 0, Width::Byte)? as u8;
        if base == 0 {
            return Err(Fault::DivideError);
        }
        let al = self.registers.al();
        self.registers.set_ah(al / base);
        self.registers.set_al(al % base);
        let al_result = self.registers.al();
        flags::set_szp(&mut self.registers.flags, Width::Byte, al_result.into());
        Ok(())
    }

    pub(crate) fn op_aad(&mut self, d: &Decoded) -> ExecResult<()> {
        let base = self.read_immediate(d, 0, Width::Byte)? as u8;
        let al = self
            .registers
            .al()
            .wrapping_add(self.registers.ah().wrapping_mul(base));
        self.registers.set_al(al);
        self.registers.set_ah(0);
        flags::set_szp(&mut self.registers.flags, Width::Byte, al.into());
        Ok(())
    }
}
