#![allow(dead_code)]

use mbbs_vm::prelude::*;
use std::sync::{Arc, Mutex};

pub const CODE_SEGMENT: u16 = 0x0001;
pub const DATA_SEGMENT: u16 = 0x0002;
pub const STACK_SEGMENT: u16 = 0x0000;
pub const INITIAL_SP: u16 = 0x1000;

/// Memory image with a code segment, an empty data segment, and a stack
/// segment, the way the loader lays out a minimal module.
pub fn build_memory(code: &[u8]) -> SharedMemory {
    build_module(code, vec![], &[], vec![])
}

/// Same, with explicit images and relocation records.
pub fn build_module(
    code: &[u8],
    code_relocations: Vec<RelocationRecord>,
    data: &[u8],
    data_relocations: Vec<RelocationRecord>,
) -> SharedMemory {
    let mut memory = SegmentedMemory::new();
    memory.add_segment(CODE_SEGMENT, SegmentKind::Code, code, code_relocations);
    memory.add_segment(DATA_SEGMENT, SegmentKind::Data, data, data_relocations);
    memory.add_segment(STACK_SEGMENT, SegmentKind::Stack, &[], vec![]);
    SharedMemory::new(memory)
}

/// Entry at `CODE_SEGMENT:0` with a simulated far call frame, the shape the
/// host uses for module entry points.
pub fn entry() -> ExecutionParams {
    ExecutionParams {
        entry_point: FarPtr::new(CODE_SEGMENT, 0),
        simulate_call_far: true,
        initial_sp: INITIAL_SP,
        ..ExecutionParams::default()
    }
}

/// Run `code` against a silent host and return the final registers.
pub fn run_program(code: &[u8]) -> CpuRegisters {
    let pool = UnitPool::new(build_memory(code), Arc::new(NoHost));
    pool.checkout().execute(entry()).expect("program faulted")
}

type InvokeFn =
    dyn Fn(HostView<'_>, u16, u16) -> Result<(), HostError> + Send + Sync;

/// Host that records every bridge crossing and optionally scripts the
/// invoke behavior.
#[derive(Default)]
pub struct ScriptedHost {
    pub calls: Mutex<Vec<(u16, u16)>>,
    pub interrupts: Mutex<Vec<u8>>,
    pub handled_vectors: Vec<u8>,
    pub on_invoke: Option<Box<InvokeFn>>,
}

impl ScriptedHost {
    pub fn recording() -> Self {
        Self::default()
    }

    pub fn with_invoke(
        handler: impl Fn(HostView<'_>, u16, u16) -> Result<(), HostError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_invoke: Some(Box::new(handler)),
            ..Self::default()
        }
    }

    pub fn handling_vectors(vectors: &[u8]) -> Self {
        Self {
            handled_vectors: vectors.to_vec(),
            ..Self::default()
        }
    }
}

impl HostCalls for ScriptedHost {
    fn invoke(&self, vm: HostView<'_>, module: u16, ordinal: u16) -> Result<(), HostError> {
        self.calls.lock().unwrap().push((module, ordinal));
        match &self.on_invoke {
            Some(handler) => handler(vm, module, ordinal),
            None => Ok(()),
        }
    }

    fn interrupt(&self, _vm: HostView<'_>, vector: u8) -> Result<bool, HostError> {
        self.interrupts.lock().unwrap().push(vector);
        Ok(self.handled_vectors.contains(&vector))
    }
}
