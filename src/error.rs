//! Runtime fault taxonomy

use crate::far_ptr::FarPtr;

use iced_x86::{Mnemonic, OpKind};
use thiserror::Error;

/// Boxed error surfaced by a host callback.
pub type HostError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shorthand for fallible core operations.
pub type ExecResult<T> = Result<T, Fault>;

/// Faults that terminate an execution unit.
///
/// Every variant propagates to the host unchanged; nothing is retried inside
/// the core. The host may log the fault, discard the unit, and resume the
/// module by checking out a fresh unit at its next entry point.
#[derive(Debug, Error)]
pub enum Fault {
    /// The decoder could not interpret the bytes at `CS:IP`.
    #[error("undecodable bytes at {location}: {bytes:02x?}")]
    Decode {
        /// Location of the fetch.
        location: FarPtr,
        /// Leading bytes at the fetch location.
        bytes: Vec<u8>,
    },
    /// The instruction decoded but its mnemonic is not implemented.
    #[error("mnemonic {0:?} is not implemented")]
    UnsupportedMnemonic(Mnemonic),
    /// The mnemonic is implemented but not for this operand pairing.
    #[error("{mnemonic:?} does not support operand shape ({op0:?}, {op1:?})")]
    UnsupportedOperands {
        /// Decoded mnemonic.
        mnemonic: Mnemonic,
        /// First operand kind, if present.
        op0: Option<OpKind>,
        /// Second operand kind, if present.
        op1: Option<OpKind>,
    },
    /// `#DE`: divide by zero, or a quotient that overflows its register.
    #[error("integer divide fault")]
    DivideError,
    /// An x87 exception fired with its mask bit clear in the control word.
    #[error("unmasked x87 exception: {0}")]
    FpuFault(FpuException),
    /// A push or pop ran outside the stack segment bounds.
    #[error("stack access outside segment {segment:#06x} at sp={sp:#06x}")]
    StackFault {
        /// Stack segment selector.
        segment: u16,
        /// Stack pointer at the time of the fault.
        sp: u16,
    },
    /// A far control transfer read the `0xFFFF` sentinel where no relocation
    /// record is registered.
    #[error("relocation sentinel at {location} has no record")]
    RelocationMissing {
        /// Fix-up site that was consulted.
        location: FarPtr,
    },
    /// An access named a selector the loader never mapped.
    #[error("segment {0:#06x} is not mapped")]
    SegmentNotMapped(u16),
    /// A host callback reported a failure.
    #[error("host call ({module}, {ordinal}) failed: {cause}")]
    HostCall {
        /// Imported module ordinal.
        module: u16,
        /// Function ordinal within the module.
        ordinal: u16,
        /// Failure reported by the callback.
        cause: HostError,
    },
    /// A software interrupt handler reported a failure.
    #[error("interrupt {vector:#04x} handler failed: {cause}")]
    InterruptFailure {
        /// Interrupt vector.
        vector: u8,
        /// Failure reported by the handler.
        cause: HostError,
    },
    /// A software interrupt has no entry in the host's interrupt table.
    #[error("no handler for software interrupt {vector:#04x}")]
    UnhandledInterrupt {
        /// Interrupt vector.
        vector: u8,
    },
    /// The host cancelled execution between instructions, or the configured
    /// instruction budget ran out.
    #[error("execution cancelled by the host")]
    Cancelled,
}

impl Fault {
    /// Whether the fault is a cooperative cancellation rather than an error
    /// in the guest or host.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Build the operand-shape fault for an instruction the dispatcher
    /// understands but the semantics tables do not cover.
    pub(crate) fn unsupported_operands(instruction: &iced_x86::Instruction) -> Self {
        let op = |n| (n < instruction.op_count()).then(|| instruction.op_kind(n));
        Self::UnsupportedOperands {
            mnemonic: instruction.mnemonic(),
            op0: op(0),
            op1: op(1),
        }
    }
}

/// x87 exception kinds, in status-word sticky-bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FpuException {
    /// Invalid operation, including register-stack overflow and underflow.
    InvalidOperation,
    /// Denormal operand.
    Denormal,
    /// Division of a finite nonzero value by zero.
    ZeroDivide,
    /// Rounded result too large to represent.
    Overflow,
    /// Rounded result too small to represent.
    Underflow,
    /// Inexact result.
    Precision,
}
