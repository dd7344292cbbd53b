//! x87 floating-point unit
//!
//! Eight-slot ring stack indexed by TOP, held as native `f64`. Transfers to
//! and from `m32`/`m64` bitcast so NaN payloads survive; `m80` transfers
//! encode and decode the extended format explicitly. Stores narrow with the
//! rounding mode from the control word.

use super::flags::Width;
use super::ExecutionUnit;
use crate::consts::FPU_CONTROL_DEFAULT;
use crate::error::{ExecResult, Fault, FpuException};
use crate::memory::Decoded;

use bitflags::bitflags;
use iced_x86::{MemorySize, OpKind, Register};

/// Quiet NaN produced by masked invalid operations (real indefinite).
const INDEFINITE: f64 = f64::from_bits(0xFFF8_0000_0000_0000);

bitflags! {
    /// x87 status word, TOP excluded (it is kept as a separate index and
    /// merged into the word on read-back).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FpuStatus: u16 {
        /// Invalid operation sticky.
        const IE = 0x0001;
        /// Denormal operand sticky.
        const DE = 0x0002;
        /// Zero divide sticky.
        const ZE = 0x0004;
        /// Overflow sticky.
        const OE = 0x0008;
        /// Underflow sticky.
        const UE = 0x0010;
        /// Precision sticky.
        const PE = 0x0020;
        /// Stack fault: the last invalid operation was an over- or underflow
        /// of the register stack.
        const SF = 0x0040;
        /// Error summary.
        const ES = 0x0080;
        /// Condition code 0 (carry analog after compares).
        const C0 = 0x0100;
        /// Condition code 1 (sign / stack direction).
        const C1 = 0x0200;
        /// Condition code 2 (parity analog after compares).
        const C2 = 0x0400;
        /// Condition code 3 (zero analog after compares).
        const C3 = 0x4000;
        /// Busy (mirrors ES on everything after the 8087).
        const BUSY = 0x8000;
    }
}

bitflags! {
    /// x87 control word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FpuControl: u16 {
        /// Invalid operation mask.
        const IM = 0x0001;
        /// Denormal mask.
        const DM = 0x0002;
        /// Zero divide mask.
        const ZM = 0x0004;
        /// Overflow mask.
        const OM = 0x0008;
        /// Underflow mask.
        const UM = 0x0010;
        /// Precision mask.
        const PM = 0x0020;
        /// Precision control field.
        const PC = 0x0300;
        /// Rounding control field.
        const RC = 0x0C00;
    }
}

/// Rounding mode from the control word's RC field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Rounding {
    /// Round to nearest, ties to even (the reset default).
    Nearest,
    /// Round toward negative infinity.
    Down,
    /// Round toward positive infinity.
    Up,
    /// Round toward zero (truncate).
    Zero,
}

/// The x87 sub-register file: stack, TOP, control and status words.
#[derive(Debug, Clone, PartialEq)]
pub struct FpuRegisters {
    stack: [f64; 8],
    occupied: [bool; 8],
    top: u8,
    /// Control word.
    pub control: FpuControl,
    /// Status word, TOP excluded.
    pub status: FpuStatus,
}

impl Default for FpuRegisters {
    fn default() -> Self {
        Self {
            stack: [0.0; 8],
            occupied: [false; 8],
            top: 0,
            control: FpuControl::from_bits_truncate(FPU_CONTROL_DEFAULT),
            status: FpuStatus::empty(),
        }
    }
}

impl FpuRegisters {
    /// Restore the FINIT state: stack empty, default control word.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Current TOP index.
    pub fn top(&self) -> u8 {
        self.top
    }

    /// Status word with TOP merged into bits 11..13.
    pub fn status_word(&self) -> u16 {
        self.status.bits() | u16::from(self.top) << 11
    }

    /// Replace the status word, splitting TOP back out.
    pub fn set_status_word(&mut self, word: u16) {
        self.top = (word >> 11 & 0x7) as u8;
        self.status = FpuStatus::from_bits_truncate(word & !(0x7 << 11));
    }

    /// Rounding mode selected by the control word.
    pub fn rounding(&self) -> Rounding {
        match (self.control.bits() & FpuControl::RC.bits()) >> 10 {
            0 => Rounding::Nearest,
            1 => Rounding::Down,
            2 => Rounding::Up,
            _ => Rounding::Zero,
        }
    }

    fn phys(&self, i: u8) -> usize {
        usize::from((self.top + i) & 0x7)
    }

    /// Whether `ST(i)` holds a value.
    pub fn is_occupied(&self, i: u8) -> bool {
        self.occupied[self.phys(i)]
    }

    /// Record `exception` in the sticky bits; fault if it is unmasked.
    fn raise(&mut self, exception: FpuException) -> ExecResult<()> {
        let (sticky, mask) = match exception {
            FpuException::InvalidOperation => (FpuStatus::IE, FpuControl::IM),
            FpuException::Denormal => (FpuStatus::DE, FpuControl::DM),
            FpuException::ZeroDivide => (FpuStatus::ZE, FpuControl::ZM),
            FpuException::Overflow => (FpuStatus::OE, FpuControl::OM),
            FpuException::Underflow => (FpuStatus::UE, FpuControl::UM),
            FpuException::Precision => (FpuStatus::PE, FpuControl::PM),
        };
        self.status.insert(sticky | FpuStatus::ES | FpuStatus::BUSY);
        if self.control.contains(mask) {
            Ok(())
        } else {
            Err(Fault::FpuFault(exception))
        }
    }

    /// Push a value, rotating TOP down. Pushing into an occupied slot is a
    /// stack overflow: the slot becomes the indefinite QNaN and C1 is set.
    pub fn push(&mut self, value: f64) -> ExecResult<()> {
        let new_top = (self.top + 7) & 0x7;
        let overflowed = self.occupied[usize::from(new_top)];
        self.top = new_top;
        self.stack[usize::from(new_top)] = if overflowed { INDEFINITE } else { value };
        self.occupied[usize::from(new_top)] = true;
        if overflowed {
            self.status.insert(FpuStatus::SF | FpuStatus::C1);
            return self.raise(FpuException::InvalidOperation);
        }
        Ok(())
    }

    /// Pop `ST(0)`, rotating TOP up. Popping an empty slot is a stack
    /// underflow yielding the indefinite QNaN.
    pub fn pop(&mut self) -> ExecResult<f64> {
        let value = self.st(0)?;
        self.occupied[self.phys(0)] = false;
        self.top = (self.top + 1) & 0x7;
        Ok(value)
    }

    /// Read `ST(i)`; an empty slot is a stack underflow yielding the
    /// indefinite QNaN.
    pub fn st(&mut self, i: u8) -> ExecResult<f64> {
        if !self.is_occupied(i) {
            self.status.insert(FpuStatus::SF);
            self.status.remove(FpuStatus::C1);
            self.raise(FpuException::InvalidOperation)?;
            return Ok(INDEFINITE);
        }
        Ok(self.stack[self.phys(i)])
    }

    /// Overwrite `ST(i)` and mark it occupied.
    pub fn set_st(&mut self, i: u8, value: f64) {
        let slot = self.phys(i);
        self.stack[slot] = value;
        self.occupied[slot] = true;
    }

    /// Mark `ST(i)` empty (`FFREE`).
    pub fn free(&mut self, i: u8) {
        let slot = self.phys(i);
        self.occupied[slot] = false;
    }

    /// Rotate TOP without touching tags (`FINCSTP`/`FDECSTP`).
    pub fn rotate_top(&mut self, down: bool) {
        self.top = if down {
            (self.top + 7) & 0x7
        } else {
            (self.top + 1) & 0x7
        };
    }

    /// Replace the compare condition codes `C0`/`C2`/`C3`.
    fn set_conditions(&mut self, c0: bool, c2: bool, c3: bool) {
        self.status.set(FpuStatus::C0, c0);
        self.status.set(FpuStatus::C2, c2);
        self.status.set(FpuStatus::C3, c3);
    }
}

/// The six dyadic arithmetic forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FpuArith {
    Add,
    Sub,
    SubR,
    Mul,
    Div,
    DivR,
}

impl ExecutionUnit {
    fn st_index(register: Register) -> u8 {
        (register as u32 - Register::ST0 as u32) as u8
    }

    /// Read the memory operand of an FPU instruction as `f64`.
    fn read_fpu_operand(&mut self, d: &Decoded) -> ExecResult<f64> {
        let (segment, offset) = self.effective_address(&d.instruction)?;
        Ok(match d.instruction.memory_size() {
            MemorySize::Float32 => {
                f64::from(f32::from_bits(self.read_mem(segment, offset, Width::Dword)?))
            }
            MemorySize::Float64 => {
                let lo = u64::from(self.read_mem(segment, offset, Width::Dword)?);
                let hi = u64::from(self.read_mem(segment, offset.wrapping_add(4), Width::Dword)?);
                f64::from_bits(hi << 32 | lo)
            }
            MemorySize::Float80 => {
                let bytes = self.memory.read_bytes(segment, offset, 10)?;
                f80_to_f64(bytes.try_into().expect("ten bytes were read"))
            }
            MemorySize::Int16 => {
                f64::from(self.read_mem(segment, offset, Width::Word)? as u16 as i16)
            }
            MemorySize::Int32 => f64::from(self.read_mem(segment, offset, Width::Dword)? as i32),
            MemorySize::Int64 => {
                let lo = u64::from(self.read_mem(segment, offset, Width::Dword)?);
                let hi = u64::from(self.read_mem(segment, offset.wrapping_add(4), Width::Dword)?);
                (hi << 32 | lo) as i64 as f64
            }
            _ => return Err(Fault::unsupported_operands(&d.instruction)),
        })
    }

    pub(crate) fn op_fld(&mut self, d: &Decoded) -> ExecResult<()> {
        let value = match d.instruction.op0_kind() {
            OpKind::Register => {
                let i = Self::st_index(d.instruction.op0_register());
                self.registers.fpu.st(i)?
            }
            OpKind::Memory => self.read_fpu_operand(d)?,
            _ => return Err(Fault::unsupported_operands(&d.instruction)),
        };
        self.registers.fpu.push(value)
    }

    pub(crate) fn op_fst(&mut self, d: &Decoded, pop: bool) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        match d.instruction.op0_kind() {
            OpKind::Register => {
                let i = Self::st_index(d.instruction.op0_register());
                self.registers.fpu.set_st(i, value);
            }
            OpKind::Memory => {
                let (segment, offset) = self.effective_address(&d.instruction)?;
                match d.instruction.memory_size() {
                    MemorySize::Float32 => {
                        let narrowed = round_to_f32(value, self.registers.fpu.rounding());
                        self.write_mem(segment, offset, Width::Dword, narrowed.to_bits())?;
                    }
                    MemorySize::Float64 => {
                        let bits = value.to_bits();
                        self.write_mem(segment, offset, Width::Dword, bits as u32)?;
                        self.write_mem(
                            segment,
                            offset.wrapping_add(4),
                            Width::Dword,
                            (bits >> 32) as u32,
                        )?;
                    }
                    MemorySize::Float80 => {
                        self.memory
                            .write_bytes(segment, offset, &f64_to_f80(value))?;
                    }
                    _ => return Err(Fault::unsupported_operands(&d.instruction)),
                }
            }
            _ => return Err(Fault::unsupported_operands(&d.instruction)),
        }
        if pop {
            self.registers.fpu.pop()?;
        }
        Ok(())
    }

    pub(crate) fn op_fild(&mut self, d: &Decoded) -> ExecResult<()> {
        let value = self.read_fpu_operand(d)?;
        self.registers.fpu.push(value)
    }

    pub(crate) fn op_fist(&mut self, d: &Decoded, pop: bool) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        let rounded = round_to_integer(value, self.registers.fpu.rounding());
        let (segment, offset) = self.effective_address(&d.instruction)?;
        match d.instruction.memory_size() {
            MemorySize::Int16 => {
                let stored = if rounded.is_nan()
                    || rounded < f64::from(i16::MIN)
                    || rounded > f64::from(i16::MAX)
                {
                    self.registers.fpu.raise(FpuException::InvalidOperation)?;
                    i16::MIN
                } else {
                    rounded as i16
                };
                self.write_mem(segment, offset, Width::Word, stored as u16 as u32)?;
            }
            MemorySize::Int32 => {
                let stored = if rounded.is_nan()
                    || rounded < f64::from(i32::MIN)
                    || rounded > f64::from(i32::MAX)
                {
                    self.registers.fpu.raise(FpuException::InvalidOperation)?;
                    i32::MIN
                } else {
                    rounded as i32
                };
                self.write_mem(segment, offset, Width::Dword, stored as u32)?;
            }
            MemorySize::Int64 => {
                let stored = if rounded.is_nan()
                    || rounded < -(2f64.powi(63))
                    || rounded >= 2f64.powi(63)
                {
                    self.registers.fpu.raise(FpuException::InvalidOperation)?;
                    i64::MIN
                } else {
                    rounded as i64
                };
                let bits = stored as u64;
                self.write_mem(segment, offset, Width::Dword, bits as u32)?;
                self.write_mem(
                    segment,
                    offset.wrapping_add(4),
                    Width::Dword,
                    (bits >> 32) as u32,
                )?;
            }
            _ => return Err(Fault::unsupported_operands(&d.instruction)),
        }
        if pop {
            self.registers.fpu.pop()?;
        }
        Ok(())
    }

    /// The dyadic arithmetic family, covering the memory, register,
    /// integer-memory, and popping forms.
    pub(crate) fn op_farith(&mut self, d: &Decoded, op: FpuArith, pop: bool) -> ExecResult<()> {
        let instruction = &d.instruction;
        let (dest, a, b) = if instruction.op0_kind() == OpKind::Memory {
            let b = self.read_fpu_operand(d)?;
            (0, self.registers.fpu.st(0)?, b)
        } else {
            let dest = Self::st_index(instruction.op0_register());
            let src = Self::st_index(instruction.op1_register());
            (
                dest,
                self.registers.fpu.st(dest)?,
                self.registers.fpu.st(src)?,
            )
        };
        let (x, y) = match op {
            FpuArith::SubR | FpuArith::DivR => (b, a),
            _ => (a, b),
        };
        if matches!(op, FpuArith::Div | FpuArith::DivR) && y == 0.0 && x.is_finite() && x != 0.0 {
            self.registers.fpu.raise(FpuException::ZeroDivide)?;
        }
        let result = match op {
            FpuArith::Add => x + y,
            FpuArith::Sub | FpuArith::SubR => x - y,
            FpuArith::Mul => x * y,
            FpuArith::Div | FpuArith::DivR => x / y,
        };
        if result.is_nan() && !a.is_nan() && !b.is_nan() {
            self.registers.fpu.raise(FpuException::InvalidOperation)?;
        }
        self.registers.fpu.set_st(dest, result);
        if pop {
            self.registers.fpu.pop()?;
        }
        Ok(())
    }

    pub(crate) fn op_fabs(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.registers.fpu.set_st(0, value.abs());
        Ok(())
    }

    pub(crate) fn op_fchs(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.registers.fpu.set_st(0, -value);
        Ok(())
    }

    pub(crate) fn op_fsqrt(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        if value < 0.0 {
            self.registers.fpu.raise(FpuException::InvalidOperation)?;
        }
        self.registers.fpu.set_st(0, value.sqrt());
        Ok(())
    }

    pub(crate) fn op_frndint(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        let rounding = self.registers.fpu.rounding();
        self.registers.fpu.set_st(0, round_to_integer(value, rounding));
        Ok(())
    }

    /// `FSCALE`: `ST(0) * 2^trunc(ST(1))`.
    pub(crate) fn op_fscale(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        let scale = self.registers.fpu.st(1)?.trunc();
        let exponent = scale.clamp(-9999.0, 9999.0) as i32;
        self.registers.fpu.set_st(0, value * 2f64.powi(exponent));
        Ok(())
    }

    /// `FPREM`: truncating partial remainder, quotient bits in the
    /// condition codes, `C2` clear (reduction always completes here).
    pub(crate) fn op_fprem(&mut self) -> ExecResult<()> {
        let dividend = self.registers.fpu.st(0)?;
        let divisor = self.registers.fpu.st(1)?;
        if divisor == 0.0 {
            self.registers.fpu.raise(FpuException::InvalidOperation)?;
            self.registers.fpu.set_st(0, INDEFINITE);
            return Ok(());
        }
        let remainder = dividend % divisor;
        let quotient = ((dividend - remainder) / divisor).abs() as u64;
        self.registers.fpu.set_st(0, remainder);
        let status = &mut self.registers.fpu.status;
        status.remove(FpuStatus::C2);
        status.set(FpuStatus::C0, quotient >> 2 & 1 != 0);
        status.set(FpuStatus::C3, quotient >> 1 & 1 != 0);
        status.set(FpuStatus::C1, quotient & 1 != 0);
        Ok(())
    }

    pub(crate) fn op_fxch(&mut self, d: &Decoded) -> ExecResult<()> {
        let i = match d.instruction.op_count() {
            2 => Self::st_index(d.instruction.op1_register()),
            1 => Self::st_index(d.instruction.op0_register()),
            _ => 1,
        };
        let a = self.registers.fpu.st(0)?;
        let b = self.registers.fpu.st(i)?;
        self.registers.fpu.set_st(0, b);
        self.registers.fpu.set_st(i, a);
        Ok(())
    }

    /// `FXAM`: classify `ST(0)` into `C3:C2:C0`, sign into `C1`.
    pub(crate) fn op_fxam(&mut self) {
        let fpu = &mut self.registers.fpu;
        let (c3, c2, c0, sign) = if !fpu.is_occupied(0) {
            (true, false, true, false)
        } else {
            let value = fpu.stack[fpu.phys(0)];
            let sign = value.is_sign_negative();
            if value.is_nan() {
                (false, false, true, sign)
            } else if value.is_infinite() {
                (false, true, true, sign)
            } else if value == 0.0 {
                (true, false, false, sign)
            } else if value.is_subnormal() {
                (true, true, false, sign)
            } else {
                (false, true, false, sign)
            }
        };
        fpu.set_conditions(c0, c2, c3);
        fpu.status.set(FpuStatus::C1, sign);
    }

    pub(crate) fn op_ftst(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.compare_values(value, 0.0, false)
    }

    /// `FCOM` family: compare `ST(0)` against a memory operand or `ST(i)`,
    /// popping zero, one, or two slots.
    pub(crate) fn op_fcom(&mut self, d: &Decoded, pops: u8, unordered: bool) -> ExecResult<()> {
        let instruction = &d.instruction;
        let b = if instruction.op_count() > 0 && instruction.op0_kind() == OpKind::Memory {
            self.read_fpu_operand(d)?
        } else {
            let i = match instruction.op_count() {
                2 => Self::st_index(instruction.op1_register()),
                1 => Self::st_index(instruction.op0_register()),
                _ => 1,
            };
            self.registers.fpu.st(i)?
        };
        let a = self.registers.fpu.st(0)?;
        self.compare_values(a, b, unordered)?;
        for _ in 0..pops {
            self.registers.fpu.pop()?;
        }
        Ok(())
    }

    /// Condition codes after a compare: `C3` is the zero flag analog, `C2`
    /// the parity analog (unordered), `C0` the carry analog.
    fn compare_values(&mut self, a: f64, b: f64, unordered: bool) -> ExecResult<()> {
        if a.is_nan() || b.is_nan() {
            self.registers.fpu.set_conditions(true, true, true);
            // The ordered compares raise invalid on any NaN; the unordered
            // forms accept quiet NaNs silently.
            if !unordered {
                self.registers.fpu.raise(FpuException::InvalidOperation)?;
            }
            return Ok(());
        }
        if a > b {
            self.registers.fpu.set_conditions(false, false, false);
        } else if a < b {
            self.registers.fpu.set_conditions(true, false, false);
        } else {
            self.registers.fpu.set_conditions(false, false, true);
        }
        Ok(())
    }

    pub(crate) fn op_fsin(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.registers.fpu.set_st(0, value.sin());
        self.registers.fpu.status.remove(FpuStatus::C2);
        Ok(())
    }

    pub(crate) fn op_fcos(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.registers.fpu.set_st(0, value.cos());
        self.registers.fpu.status.remove(FpuStatus::C2);
        Ok(())
    }

    pub(crate) fn op_fsincos(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.registers.fpu.set_st(0, value.sin());
        self.registers.fpu.status.remove(FpuStatus::C2);
        self.registers.fpu.push(value.cos())
    }

    /// `FPTAN` computes the tangent and pushes 1.0 so the quotient form
    /// `ST(1)/ST(0)` stays valid.
    pub(crate) fn op_fptan(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.registers.fpu.set_st(0, value.tan());
        self.registers.fpu.status.remove(FpuStatus::C2);
        self.registers.fpu.push(1.0)
    }

    pub(crate) fn op_f2xm1(&mut self) -> ExecResult<()> {
        let value = self.registers.fpu.st(0)?;
        self.registers.fpu.set_st(0, value.exp2() - 1.0);
        Ok(())
    }

    /// `FYL2X`: `ST(1) * log2(ST(0))`, popped into the new `ST(0)`.
    pub(crate) fn op_fyl2x(&mut self) -> ExecResult<()> {
        let x = self.registers.fpu.st(0)?;
        let y = self.registers.fpu.st(1)?;
        if x < 0.0 {
            self.registers.fpu.raise(FpuException::InvalidOperation)?;
        } else if x == 0.0 {
            self.registers.fpu.raise(FpuException::ZeroDivide)?;
        }
        self.registers.fpu.set_st(1, y * x.log2());
        self.registers.fpu.pop()?;
        Ok(())
    }

    /// `FPATAN`: `atan(ST(1) / ST(0))` with full quadrant correction,
    /// popped into the new `ST(0)`.
    pub(crate) fn op_fpatan(&mut self) -> ExecResult<()> {
        let x = self.registers.fpu.st(0)?;
        let y = self.registers.fpu.st(1)?;
        self.registers.fpu.set_st(1, y.atan2(x));
        self.registers.fpu.pop()?;
        Ok(())
    }

    pub(crate) fn op_fldcw(&mut self, d: &Decoded) -> ExecResult<()> {
        let (segment, offset) = self.effective_address(&d.instruction)?;
        let word = self.read_mem(segment, offset, Width::Word)? as u16;
        self.registers.fpu.control = FpuControl::from_bits_truncate(word);
        Ok(())
    }

    pub(crate) fn op_fnstcw(&mut self, d: &Decoded) -> ExecResult<()> {
        let (segment, offset) = self.effective_address(&d.instruction)?;
        let word = self.registers.fpu.control.bits();
        self.write_mem(segment, offset, Width::Word, word.into())
    }

    pub(crate) fn op_fnstsw(&mut self, d: &Decoded) -> ExecResult<()> {
        let word = self.registers.fpu.status_word();
        match d.instruction.op0_kind() {
            OpKind::Register => {
                self.registers.set_ax(word);
                Ok(())
            }
            OpKind::Memory => {
                let (segment, offset) = self.effective_address(&d.instruction)?;
                self.write_mem(segment, offset, Width::Word, word.into())
            }
            _ => Err(Fault::unsupported_operands(&d.instruction)),
        }
    }

    pub(crate) fn op_fninit(&mut self) {
        self.registers.fpu.reset();
    }

    /// `FNCLEX` clears the sticky exceptions, the stack fault, and the
    /// summary bits.
    pub(crate) fn op_fnclex(&mut self) {
        self.registers.fpu.status.remove(
            FpuStatus::IE
                | FpuStatus::DE
                | FpuStatus::ZE
                | FpuStatus::OE
                | FpuStatus::UE
                | FpuStatus::PE
                | FpuStatus::SF
                | FpuStatus::ES
                | FpuStatus::BUSY,
        );
    }

    pub(crate) fn op_ffree(&mut self, d: &Decoded) -> ExecResult<()> {
        let i = Self::st_index(d.instruction.op0_register());
        self.registers.fpu.free(i);
        Ok(())
    }

    pub(crate) fn op_fconst(&mut self, value: f64) -> ExecResult<()> {
        self.registers.fpu.push(value)
    }
}

/// Round `value` to an integral `f64` per the x87 rounding mode.
fn round_to_integer(value: f64, rounding: Rounding) -> f64 {
    match rounding {
        Rounding::Nearest => value.round_ties_even(),
        Rounding::Down => value.floor(),
        Rounding::Up => value.ceil(),
        Rounding::Zero => value.trunc(),
    }
}

/// Narrow to `f32` honoring the x87 rounding mode. The cast rounds to
/// nearest-even; the directed modes nudge the result one ULP when the cast
/// rounded the wrong way.
fn round_to_f32(value: f64, rounding: Rounding) -> f32 {
    let nearest = value as f32;
    if value.is_nan() || nearest.is_infinite() && value.is_infinite() {
        return nearest;
    }
    let toward = |up: bool| {
        let wide = f64::from(nearest);
        if up && wide < value {
            next_f32(nearest, true)
        } else if !up && wide > value {
            next_f32(nearest, false)
        } else {
            nearest
        }
    };
    match rounding {
        Rounding::Nearest => nearest,
        Rounding::Down => toward(false),
        Rounding::Up => toward(true),
        Rounding::Zero => toward(value < 0.0),
    }
}

/// The adjacent `f32` in the given direction.
fn next_f32(value: f32, up: bool) -> f32 {
    let bits = value.to_bits();
    let adjusted = if value == 0.0 {
        if up { 1 } else { 0x8000_0001 }
    } else if (value > 0.0) == up {
        bits + 1
    } else {
        bits - 1
    };
    f32::from_bits(adjusted)
}

/// Decode the 80-bit extended format into `f64`.
pub(crate) fn f80_to_f64(bytes: [u8; 10]) -> f64 {
    let mantissa = u64::from_le_bytes(bytes[..8].try_into().expect("eight bytes"));
    let sign_exponent = u16::from_le_bytes([bytes[8], bytes[9]]);
    let sign = sign_exponent >> 15 != 0;
    let exponent = i32::from(sign_exponent & 0x7FFF);
    let magnitude = if exponent == 0x7FFF {
        if mantissa << 1 == 0 {
            f64::INFINITY
        } else {
            // Preserve the payload's top bits within the f64 fraction; keep
            // the quiet bit set.
            f64::from_bits(0x7FF8_0000_0000_0000 | (mantissa >> 11 & 0x0007_FFFF_FFFF_FFFF))
        }
    } else if mantissa == 0 && exponent == 0 {
        0.0
    } else {
        // mantissa is a 64-bit fixed-point value with the integer bit
        // explicit: value = mantissa * 2^(exponent - 16383 - 63). Scale in
        // two exact power-of-two steps so extended values that land in the
        // f64 subnormal range survive (a single powi would flush to zero).
        let normalized = (mantissa as f64) * 2f64.powi(-63);
        normalized * 2f64.powi(exponent - 16383)
    };
    if sign {
        -magnitude
    } else {
        magnitude
    }
}

/// Encode `f64` into the 80-bit extended format.
pub(crate) fn f64_to_f80(value: f64) -> [u8; 10] {
    let bits = value.to_bits();
    let sign = (bits >> 63) as u16;
    let exponent = (bits >> 52 & 0x7FF) as i32;
    let fraction = bits & 0x000F_FFFF_FFFF_FFFF;

    let (exponent80, mantissa) = if exponent == 0x7FF {
        // Infinity and NaN: integer bit set, payload shifted up.
        (0x7FFF, 1u64 << 63 | fraction << 11)
    } else if exponent == 0 {
        if fraction == 0 {
            (0, 0)
        } else {
            // Denormal: normalize into the explicit integer bit. With the
            // top fraction bit moved to position 63 - lz, the biased
            // extended exponent works out to 15372 - lz.
            let lz = fraction.leading_zeros();
            (15372 - lz as i32, fraction << lz)
        }
    } else {
        (exponent - 1023 + 16383, 1u64 << 63 | fraction << 11)
    };

    let mut bytes = [0u8; 10];
    bytes[..8].copy_from_slice(&mantissa.to_le_bytes());
    let sign_exponent = sign << 15 | exponent80 as u16;
    bytes[8..].copy_from_slice(&sign_exponent.to_le_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0)]
    #[case(1.0)]
    #[case(-2.5)]
    #[case(std::f64::consts::PI)]
    #[case(f64::INFINITY)]
    #[case(f64::NEG_INFINITY)]
    #[case(1.5e-320)] // subnormal
    fn f80_round_trips_f64(#[case] value: f64) {
        let back = f80_to_f64(f64_to_f80(value));
        assert_eq!(back.to_bits(), value.to_bits());
    }

    #[test]
    fn f80_round_trips_nan_quietly() {
        let back = f80_to_f64(f64_to_f80(f64::NAN));
        assert!(back.is_nan());
    }

    #[test]
    fn stack_wraps_through_top() {
        let mut fpu = FpuRegisters::default();
        fpu.push(1.0).unwrap();
        fpu.push(2.0).unwrap();
        assert_eq!(fpu.top(), 6);
        assert_eq!(fpu.st(0).unwrap(), 2.0);
        assert_eq!(fpu.st(1).unwrap(), 1.0);
        assert_eq!(fpu.pop().unwrap(), 2.0);
        assert_eq!(fpu.top(), 7);
    }

    #[test]
    fn masked_overflow_yields_indefinite() {
        let mut fpu = FpuRegisters::default();
        for i in 0..8 {
            fpu.push(f64::from(i)).unwrap();
        }
        fpu.push(8.0).unwrap();
        assert!(fpu.status.contains(FpuStatus::IE | FpuStatus::SF | FpuStatus::C1));
        assert!(fpu.st(0).unwrap().is_nan());
    }

    #[test]
    fn unmasked_underflow_faults() {
        let mut fpu = FpuRegisters::default();
        fpu.control.remove(FpuControl::IM);
        assert!(matches!(
            fpu.pop(),
            Err(Fault::FpuFault(FpuException::InvalidOperation))
        ));
    }

    #[test]
    fn status_word_carries_top() {
        let mut fpu = FpuRegisters::default();
        fpu.push(1.0).unwrap();
        assert_eq!(fpu.status_word() >> 11 & 0x7, 7);
        fpu.set_status_word(3 << 11);
        assert_eq!(fpu.top(), 3);
    }

    #[rstest]
    #[case(2.5, Rounding::Nearest, 2.0)]
    #[case(3.5, Rounding::Nearest, 4.0)]
    #[case(2.5, Rounding::Down, 2.0)]
    #[case(-2.5, Rounding::Down, -3.0)]
    #[case(2.5, Rounding::Up, 3.0)]
    #[case(-2.5, Rounding::Zero, -2.0)]
    fn integer_rounding_honors_mode(#[case] value: f64, #[case] mode: Rounding, #[case] expected: f64) {
        assert_eq!(round_to_integer(value, mode), expected);
    }

    #[test]
    fn f32_narrowing_direction() {
        // 0.1 is inexact in binary; down and up must straddle it.
        let down = round_to_f32(0.1, Rounding::Down);
        let up = round_to_f32(0.1, Rounding::Up);
        assert!(f64::from(down) < 0.1);
        assert!(f64::from(up) > 0.1);
        assert_eq!(next_f32(down, true), up);
    }
}
