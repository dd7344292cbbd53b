use super::flags::{self, FlagOp, Width};
use super::ExecutionUnit;
use crate::error::ExecResult;
use crate::memory::Decoded;
use crate::registers::CpuFlags;

use iced_x86::{Mnemonic, Register};

/// REP-family prefix on a string instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repeat {
    None,
    /// `REP`/`REPE`: repeat while CX is nonzero (and ZF set, for the
    /// comparing forms).
    WhileEqual,
    /// `REPNE`: repeat while CX is nonzero and ZF clear.
    WhileNotEqual,
}

impl ExecutionUnit {
    pub(crate) fn op_string(&mut self, d: &Decoded) -> ExecResult<()> {
        let instruction = &d.instruction;
        let mnemonic = instruction.mnemonic();
        let width = match mnemonic {
            Mnemonic::Movsb
            | Mnemonic::Cmpsb
            | Mnemonic::Scasb
            | Mnemonic::Lodsb
            | Mnemonic::Stosb => Width::Byte,
            _ => Width::Word,
        };
        let repeat = if instruction.has_repne_prefix() {
            Repeat::WhileNotEqual
        } else if instruction.has_rep_prefix() {
            Repeat::WhileEqual
        } else {
            Repeat::None
        };
        // The DS:SI side honors a segment override; ES:DI never does.
        let source_segment = match instruction.segment_prefix() {
            Register::None => self.registers.ds,
            prefix => self.registers.get(prefix) as u16,
        };

        if repeat != Repeat::None && self.registers.cx() == 0 {
            return Ok(());
        }
        loop {
            self.string_step(mnemonic, width, source_segment)?;
            if repeat == Repeat::None {
                break;
            }
            let cx = self.registers.cx().wrapping_sub(1);
            self.registers.set_cx(cx);
            if cx == 0 {
                break;
            }
            // Only the comparing forms consult ZF between iterations.
            if matches!(
                mnemonic,
                Mnemonic::Cmpsb | Mnemonic::Cmpsw | Mnemonic::Scasb | Mnemonic::Scasw
            ) {
                let zf = self.registers.flag(CpuFlags::ZF);
                match repeat {
                    Repeat::WhileEqual if !zf => break,
                    Repeat::WhileNotEqual if zf => break,
                    _ => (),
                }
            }
        }
        Ok(())
    }

    fn string_step(
        &mut self,
        mnemonic: Mnemonic,
        width: Width,
        source_segment: u16,
    ) -> ExecResult<()> {
        let step = width.bits() as u16 / 8;
        let si = self.registers.si();
        let di = self.registers.di();
        let es = self.registers.es;
        match mnemonic {
            Mnemonic::Movsb | Mnemonic::Movsw => {
                let value = self.read_mem(source_segment, si, width)?;
                self.write_mem(es, di, width, value)?;
                self.advance_index(true, true, step);
            }
            Mnemonic::Cmpsb | Mnemonic::Cmpsw => {
                let a = u64::from(self.read_mem(source_segment, si, width)?);
                let b = u64::from(self.read_mem(es, di, width)?);
                flags::evaluate(
                    &mut self.registers.flags,
                    FlagOp::Cmp,
                    width,
                    a,
                    b,
                    a.wrapping_sub(b),
                );
                self.advance_index(true, true, step);
            }
            Mnemonic::Scasb | Mnemonic::Scasw => {
                let a = u64::from(self.accumulator(width));
                let b = u64::from(self.read_mem(es, di, width)?);
                flags::evaluate(
                    &mut self.registers.flags,
                    FlagOp::Cmp,
                    width,
                    a,
                    b,
                    a.wrapping_sub(b),
                );
                self.advance_index(false, true, step);
            }
            Mnemonic::Lodsb | Mnemonic::Lodsw => {
                let value = self.read_mem(source_segment, si, width)?;
                self.set_accumulator(width, value);
                self.advance_index(true, false, step);
            }
            Mnemonic::Stosb | Mnemonic::Stosw => {
                let value = self.accumulator(width);
                self.write_mem(es, di, width, value)?;
                self.advance_index(false, true, step);
            }
            _ => unreachable!("dispatcher routes only string mnemonics here"),
        }
        Ok(())
    }

    fn accumulator(&self, width: Width) -> u32 {
        match width {
            Width::Byte => self.registers.al().into(),
            _ => self.registers.ax().into(),
        }
    }

    fn set_accumulator(&mut self, width: Width, value: u32) {
        match width {
            Width::Byte => self.registers.set_al(value as u8),
            _ => self.registers.set_ax(value as u16),
        }
    }

    /// Step SI and/or DI by the element size, direction per DF.
    fn advance_index(&mut self, si: bool, di: bool, step: u16) {
        let delta = if self.registers.flag(CpuFlags::DF) {
            step.wrapping_neg()
        } else {
            step
        };
        if si {
            let value = self.registers.si().wrapping_add(delta);
            self.registers.set_si(value);
        }
        if di {
            let value = self.registers.di().wrapping_add(delta);
            self.registers.set_di(value);
        }
    }
}
