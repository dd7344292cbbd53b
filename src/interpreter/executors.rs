use super::fpu::FpuArith;
use super::{ExecutionParams, ExecutionUnit};
use crate::consts::{HOST_RETURN_OFFSET, HOST_RETURN_SEGMENT};
use crate::error::{ExecResult, Fault};
use crate::memory::Decoded;
use crate::registers::{CpuFlags, CpuRegisters};
use crate::state::{ExecuteState, ExitStatus};

use iced_x86::Mnemonic;
use std::f64::consts;

impl ExecutionUnit {
    /// Run one guest entry to its terminal state and return the final
    /// register file.
    ///
    /// Seeds the register file per the standard startup state (unless
    /// `bypass_state`), pushes the initial stack and the simulated far
    /// return address, then steps until a return to the host, a `HLT`, a
    /// fault, or cancellation.
    #[tracing::instrument(name = "execute", skip_all, fields(entry = %params.entry_point, channel = params.channel))]
    pub fn execute(&mut self, params: ExecutionParams) -> ExecResult<CpuRegisters> {
        self.executed = 0;
        if !params.bypass_state {
            self.registers.reset();
            self.registers.set_ax(params.channel);
            let (data_segment, stack_segment) = {
                let memory = self.memory.lock();
                (memory.default_data_segment(), memory.stack_segment())
            };
            if let Some(selector) = data_segment {
                self.registers.ds = selector;
                self.registers.es = selector;
            }
            if let Some(selector) = stack_segment {
                self.registers.ss = selector;
            }
        }
        self.registers.cs = params.entry_point.segment;
        self.registers.ip = params.entry_point.offset;
        self.registers.set_sp(params.initial_sp);
        for value in params.initial_stack.iter().rev() {
            self.push_word(*value)?;
        }
        if params.simulate_call_far {
            self.push_word(HOST_RETURN_SEGMENT)?;
            self.push_word(HOST_RETURN_OFFSET)?;
        }
        let status = self.run()?;
        tracing::debug!(%status, executed = self.executed, "guest entry finished");
        Ok(self.registers.clone())
    }

    /// Step until a terminal state. Cancellation and the instruction budget
    /// are consulted only between instructions.
    pub fn run(&mut self) -> ExecResult<ExitStatus> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Fault::Cancelled);
            }
            if let Some(budget) = self.instruction_budget {
                if self.executed >= budget {
                    return Err(Fault::Cancelled);
                }
            }
            match self.step()? {
                state if state.should_continue() => (),
                ExecuteState::Halted => return Ok(ExitStatus::Halted),
                _ => return Ok(ExitStatus::Completed),
            }
        }
    }

    /// Fetch, dispatch, and retire a single instruction.
    pub fn step(&mut self) -> ExecResult<ExecuteState> {
        let decoded = self
            .memory
            .instruction_at(self.registers.cs, self.registers.ip)?;
        let state = self.dispatch(&decoded)?;
        self.executed += 1;
        if state == ExecuteState::Proceed {
            self.registers.ip = self
                .registers
                .ip
                .wrapping_add(decoded.instruction.len() as u16);
        }
        Ok(state)
    }

    fn dispatch(&mut self, d: &Decoded) -> ExecResult<ExecuteState> {
        use Mnemonic::*;

        tracing::trace!(
            cs = format_args!("{:04X}", self.registers.cs),
            ip = format_args!("{:04X}", self.registers.ip),
            mnemonic = ?d.instruction.mnemonic(),
        );

        let state = match d.instruction.mnemonic() {
            /* data movement */
            Mov => self.proceed(d, Self::op_mov)?,
            Movzx => self.proceed(d, Self::op_movzx)?,
            Movsx => self.proceed(d, Self::op_movsx)?,
            Xchg => self.proceed(d, Self::op_xchg)?,
            Lea => self.proceed(d, Self::op_lea)?,
            Lds => self.proceed(d, Self::op_lds)?,
            Les => self.proceed(d, Self::op_les)?,
            Push => self.proceed(d, Self::op_push)?,
            Pop => self.proceed(d, Self::op_pop)?,
            Pusha => {
                self.op_pusha()?;
                ExecuteState::Proceed
            }
            Popa => {
                self.op_popa()?;
                ExecuteState::Proceed
            }
            Pushf => {
                self.op_pushf()?;
                ExecuteState::Proceed
            }
            Popf => {
                self.op_popf()?;
                ExecuteState::Proceed
            }
            Lahf => {
                self.op_lahf();
                ExecuteState::Proceed
            }
            Sahf => {
                self.op_sahf();
                ExecuteState::Proceed
            }
            Cbw => {
                self.op_cbw();
                ExecuteState::Proceed
            }
            Cwd => {
                self.op_cwd();
                ExecuteState::Proceed
            }
            Cwde => {
                self.op_cwde();
                ExecuteState::Proceed
            }
            Cdq => {
                self.op_cdq();
                ExecuteState::Proceed
            }
            Xlatb => self.proceed(d, Self::op_xlat)?,
            Enter => self.proceed(d, Self::op_enter)?,
            Leave => {
                self.op_leave()?;
                ExecuteState::Proceed
            }

            /* arithmetic */
            Add => self.proceed(d, Self::op_add)?,
            Adc => self.proceed(d, Self::op_adc)?,
            Sub => self.proceed(d, Self::op_sub)?,
            Sbb => self.proceed(d, Self::op_sbb)?,
            Cmp => self.proceed(d, Self::op_cmp)?,
            Inc => self.proceed(d, Self::op_inc)?,
            Dec => self.proceed(d, Self::op_dec)?,
            Neg => self.proceed(d, Self::op_neg)?,
            Mul => self.proceed(d, Self::op_mul)?,
            Imul => self.proceed(d, Self::op_imul)?,
            Div => self.proceed(d, Self::op_div)?,
            Idiv => self.proceed(d, Self::op_idiv)?,
            Daa => {
                self.op_daa();
                ExecuteState::Proceed
            }
            Das => {
                self.op_das();
                ExecuteState::Proceed
            }
            Aaa => {
                self.op_aaa();
                ExecuteState::Proceed
            }
            Aas => {
                self.op_aas();
                ExecuteState::Proceed
            }
            Aam => self.proceed(d, Self::op_aam)?,
            Aad => self.proceed(d, Self::op_aad)?,

            /* logic, shifts, rotates, bit scans */
            And => self.proceed(d, Self::op_and)?,
            Or => self.proceed(d, Self::op_or)?,
            Xor => self.proceed(d, Self::op_xor)?,
            Not => self.proceed(d, Self::op_not)?,
            Test => self.proceed(d, Self::op_test)?,
            Shl => self.proceed(d, Self::op_shl)?,
            Shr => self.proceed(d, Self::op_shr)?,
            Sar => self.proceed(d, Self::op_sar)?,
            Rol => self.proceed(d, Self::op_rol)?,
            Ror => self.proceed(d, Self::op_ror)?,
            Rcl => self.proceed(d, Self::op_rcl)?,
            Rcr => self.proceed(d, Self::op_rcr)?,
            Bt => self.proceed(d, Self::op_bt)?,
            Bts => self.proceed(d, Self::op_bts)?,
            Btr => self.proceed(d, Self::op_btr)?,
            Btc => self.proceed(d, Self::op_btc)?,
            Bsf => self.proceed(d, Self::op_bsf)?,
            Bsr => self.proceed(d, Self::op_bsr)?,

            /* control transfer */
            Jmp => self.op_jmp(d)?,
            Ja | Jae | Jb | Jbe | Je | Jne | Jg | Jge | Jl | Jle | Jo | Jno | Jp | Jnp | Js
            | Jns => self.op_jcc(d)?,
            Loop | Loope | Loopne | Jcxz => self.op_loop(d)?,
            Call => self.op_call(d)?,
            Ret => self.op_ret(d)?,
            Retf => self.op_retf(d)?,
            Int | Int3 | Into => self.op_int(d)?,
            Iret => self.op_iret()?,

            /* strings */
            Movsb | Movsw | Cmpsb | Cmpsw | Scasb | Scasw | Lodsb | Lodsw | Stosb | Stosw => {
                self.op_string(d)?;
                ExecuteState::Proceed
            }

            /* flag control */
            Clc => self.set_flag_state(CpuFlags::CF, false),
            Stc => self.set_flag_state(CpuFlags::CF, true),
            Cmc => {
                let carry = self.registers.flag(CpuFlags::CF);
                self.set_flag_state(CpuFlags::CF, !carry)
            }
            Cld => self.set_flag_state(CpuFlags::DF, false),
            Std => self.set_flag_state(CpuFlags::DF, true),
            Cli => self.set_flag_state(CpuFlags::IF, false),
            Sti => self.set_flag_state(CpuFlags::IF, true),

            /* x87 */
            Fld => self.proceed(d, Self::op_fld)?,
            Fst => {
                self.op_fst(d, false)?;
                ExecuteState::Proceed
            }
            Fstp => {
                self.op_fst(d, true)?;
                ExecuteState::Proceed
            }
            Fild => self.proceed(d, Self::op_fild)?,
            Fist => {
                self.op_fist(d, false)?;
                ExecuteState::Proceed
            }
            Fistp => {
                self.op_fist(d, true)?;
                ExecuteState::Proceed
            }
            Fadd | Fiadd => self.farith(d, FpuArith::Add, false)?,
            Faddp => self.farith(d, FpuArith::Add, true)?,
            Fsub | Fisub => self.farith(d, FpuArith::Sub, false)?,
            Fsubp => self.farith(d, FpuArith::Sub, true)?,
            Fsubr | Fisubr => self.farith(d, FpuArith::SubR, false)?,
            Fsubrp => self.farith(d, FpuArith::SubR, true)?,
            Fmul | Fimul => self.farith(d, FpuArith::Mul, false)?,
            Fmulp => self.farith(d, FpuArith::Mul, true)?,
            Fdiv | Fidiv => self.farith(d, FpuArith::Div, false)?,
            Fdivp => self.farith(d, FpuArith::Div, true)?,
            Fdivr | Fidivr => self.farith(d, FpuArith::DivR, false)?,
            Fdivrp => self.farith(d, FpuArith::DivR, true)?,
            Fabs => {
                self.op_fabs()?;
                ExecuteState::Proceed
            }
            Fchs => {
                self.op_fchs()?;
                ExecuteState::Proceed
            }
            Fsqrt => {
                self.op_fsqrt()?;
                ExecuteState::Proceed
            }
            Fscale => {
                self.op_fscale()?;
                ExecuteState::Proceed
            }
            Fprem => {
                self.op_fprem()?;
                ExecuteState::Proceed
            }
            Frndint => {
                self.op_frndint()?;
                ExecuteState::Proceed
            }
            Fxch => self.proceed(d, Self::op_fxch)?,
            Fxam => {
                self.op_fxam();
                ExecuteState::Proceed
            }
            Ftst => {
                self.op_ftst()?;
                ExecuteState::Proceed
            }
            Fcom => {
                self.op_fcom(d, 0, false)?;
                ExecuteState::Proceed
            }
            Fcomp => {
                self.op_fcom(d, 1, false)?;
                ExecuteState::Proceed
            }
            Fcompp => {
                self.op_fcom(d, 2, false)?;
                ExecuteState::Proceed
            }
            Fucom => {
                self.op_fcom(d, 0, true)?;
                ExecuteState::Proceed
            }
            Fucomp => {
                self.op_fcom(d, 1, true)?;
                ExecuteState::Proceed
            }
            Fucompp => {
                self.op_fcom(d, 2, true)?;
                ExecuteState::Proceed
            }
            Fsin => {
                self.op_fsin()?;
                ExecuteState::Proceed
            }
            Fcos => {
                self.op_fcos()?;
                ExecuteState::Proceed
            }
            Fsincos => {
                self.op_fsincos()?;
                ExecuteState::Proceed
            }
            Fptan => {
                self.op_fptan()?;
                ExecuteState::Proceed
            }
            F2xm1 => {
                self.op_f2xm1()?;
                ExecuteState::Proceed
            }
            Fyl2x => {
                self.op_fyl2x()?;
                ExecuteState::Proceed
            }
            Fpatan => {
                self.op_fpatan()?;
                ExecuteState::Proceed
            }
            Fldcw => self.proceed(d, Self::op_fldcw)?,
            Fnstcw => self.proceed(d, Self::op_fnstcw)?,
            Fnstsw => self.proceed(d, Self::op_fnstsw)?,
            Fninit => {
                self.op_fninit();
                ExecuteState::Proceed
            }
            Fnclex => {
                self.op_fnclex();
                ExecuteState::Proceed
            }
            Ffree => self.proceed(d, Self::op_ffree)?,
            Fincstp => {
                self.registers.fpu.rotate_top(false);
                ExecuteState::Proceed
            }
            Fdecstp => {
                self.registers.fpu.rotate_top(true);
                ExecuteState::Proceed
            }
            Fldz => self.fconst(0.0)?,
            Fld1 => self.fconst(1.0)?,
            Fldpi => self.fconst(consts::PI)?,
            Fldl2e => self.fconst(consts::LOG2_E)?,
            Fldl2t => self.fconst(consts::LOG2_10)?,
            Fldlg2 => self.fconst(consts::LOG10_2)?,
            Fldln2 => self.fconst(consts::LN_2)?,

            /* misc */
            Nop | Wait => ExecuteState::Proceed,
            Hlt => ExecuteState::Halted,

            other => return Err(Fault::UnsupportedMnemonic(other)),
        };
        Ok(state)
    }

    /// Run a fallthrough handler and report `Proceed`.
    fn proceed(
        &mut self,
        d: &Decoded,
        handler: fn(&mut Self, &Decoded) -> ExecResult<()>,
    ) -> ExecResult<ExecuteState> {
        handler(self, d)?;
        Ok(ExecuteState::Proceed)
    }

    fn set_flag_state(&mut self, flag: CpuFlags, value: bool) -> ExecuteState {
        self.registers.set_flag(flag, value);
        ExecuteState::Proceed
    }

    fn farith(&mut self, d: &Decoded, op: FpuArith, pop: bool) -> ExecResult<ExecuteState> {
        self.op_farith(d, op, pop)?;
        Ok(ExecuteState::Proceed)
    }

    fn fconst(&mut self, value: f64) -> ExecResult<ExecuteState> {
        self.op_fconst(value)?;
        Ok(ExecuteState::Proceed)
    }
}
