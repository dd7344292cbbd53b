mod common;

use common::*;
use mbbs_vm::prelude::*;
use std::sync::Arc;

/// The 5-byte far call through a sentinel fix-up site, plus a return.
const IMPORT_CALL: [u8; 6] = [0x9A, 0xFF, 0xFF, 0xFF, 0xFF, 0xC3];

fn import_record(module: u16, ordinal: u16) -> RelocationRecord {
    RelocationRecord::new(1, RelocationTarget::ImportOrdinal { module, ordinal })
}

#[test]
fn far_call_through_import_record_invokes_the_host_once() {
    let memory = build_module(&IMPORT_CALL, vec![import_record(3, 42)], &[], vec![]);
    let host = Arc::new(ScriptedHost::recording());
    let pool = UnitPool::new(memory, Arc::clone(&host) as Arc<dyn HostCalls>);
    let regs = pool.checkout().execute(entry()).unwrap();
    assert_eq!(*host.calls.lock().unwrap(), [(3, 42)]);
    // Execution resumed after the 5-byte call and ran the final ret.
    assert_eq!(regs.sp(), INITIAL_SP);
}

#[test]
fn far_call_with_no_record_is_a_relocation_fault() {
    let memory = build_module(&IMPORT_CALL, vec![], &[], vec![]);
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    let fault = pool.checkout().execute(entry()).unwrap_err();
    assert!(matches!(
        fault,
        Fault::RelocationMissing { location } if location == FarPtr::new(CODE_SEGMENT, 1)
    ));
}

#[test]
fn pascal_convention_arguments_and_cleanup() {
    // mov ax, 7; push ax; mov ax, 42; push ax; call import; ret
    let code = [
        0xB8, 0x07, 0x00, 0x50, // mov ax, 7; push ax
        0xB8, 0x2A, 0x00, 0x50, // mov ax, 42; push ax
        0x9A, 0xFF, 0xFF, 0xFF, 0xFF, // call far import
        0xC3,
    ];
    let memory = build_module(
        &code,
        vec![RelocationRecord::new(
            9,
            RelocationTarget::ImportOrdinal { module: 1, ordinal: 1 },
        )],
        &[],
        vec![],
    );
    let host = Arc::new(ScriptedHost::with_invoke(|mut vm, _, _| {
        let last = vm.arg(0)?;
        let first = vm.arg(1)?;
        vm.set_return(first + last);
        vm.discard_args(2);
        Ok(())
    }));
    let pool = UnitPool::new(memory, Arc::clone(&host) as Arc<dyn HostCalls>);
    let regs = pool.checkout().execute(entry()).unwrap();
    assert_eq!(regs.ax(), 49);
    assert_eq!(regs.sp(), INITIAL_SP, "callee must clean the stack");
}

#[test]
fn host_callback_reenters_guest_on_a_fresh_unit() {
    // Outer: mov bx, 0x1234; call import; ret.
    // Inner entry at offset 0x10: mov ax, 0x9999; ret.
    let mut code = vec![0xBB, 0x34, 0x12, 0x9A, 0xFF, 0xFF, 0xFF, 0xFF, 0xC3];
    code.resize(0x10, 0x90);
    code.extend_from_slice(&[0xB8, 0x99, 0x99, 0xC3]);
    let memory = build_module(
        &code,
        vec![RelocationRecord::new(
            4,
            RelocationTarget::ImportOrdinal { module: 2, ordinal: 9 },
        )],
        &[],
        vec![],
    );
    let host = Arc::new(ScriptedHost::with_invoke(|mut vm, _, _| {
        let inner = vm.reenter(ExecutionParams {
            entry_point: FarPtr::new(CODE_SEGMENT, 0x10),
            simulate_call_far: true,
            initial_sp: 0x0800,
            ..ExecutionParams::default()
        })?;
        vm.set_return(inner.ax());
        Ok(())
    }));
    let pool = UnitPool::new(memory, Arc::clone(&host) as Arc<dyn HostCalls>);
    let regs = pool.checkout().execute(entry()).unwrap();
    assert_eq!(regs.ax(), 0x9999, "inner result surfaces through AX");
    assert_eq!(regs.bx(), 0x1234, "caller registers survive the nested run");
    assert_eq!(regs.sp(), INITIAL_SP);
}

#[test]
fn host_error_propagates_as_a_host_call_fault() {
    let memory = build_module(&IMPORT_CALL, vec![import_record(5, 7)], &[], vec![]);
    let host = Arc::new(ScriptedHost::with_invoke(|_, _, _| {
        Err("btrieve file missing".into())
    }));
    let pool = UnitPool::new(memory, Arc::clone(&host) as Arc<dyn HostCalls>);
    let fault = pool.checkout().execute(entry()).unwrap_err();
    match fault {
        Fault::HostCall { module: 5, ordinal: 7, cause } => {
            assert!(cause.to_string().contains("btrieve"));
        }
        other => panic!("expected a host call fault, got {other:?}"),
    }
}

#[test]
fn recognized_interrupt_routes_to_the_host() {
    // int 0x21; ret
    let memory = build_memory(&[0xCD, 0x21, 0xC3]);
    let host = Arc::new(ScriptedHost::handling_vectors(&[0x21]));
    let pool = UnitPool::new(memory, Arc::clone(&host) as Arc<dyn HostCalls>);
    pool.checkout().execute(entry()).unwrap();
    assert_eq!(*host.interrupts.lock().unwrap(), [0x21]);
}

#[test]
fn unrecognized_interrupt_is_fatal() {
    let memory = build_memory(&[0xCD, 0x7F, 0xC3]);
    let pool = UnitPool::new(memory, Arc::new(ScriptedHost::recording()));
    let fault = pool.checkout().execute(entry()).unwrap_err();
    assert!(matches!(fault, Fault::UnhandledInterrupt { vector: 0x7F }));
}

#[test]
fn cancellation_stops_before_the_next_instruction() {
    // jmp $: spins forever without cancellation
    let memory = build_memory(&[0xEB, 0xFE]);
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    pool.cancel_token().cancel();
    let fault = pool.checkout().execute(entry()).unwrap_err();
    assert!(fault.is_cancellation());
}

#[test]
fn instruction_budget_bounds_a_runaway_loop() {
    let memory = build_memory(&[0xEB, 0xFE]);
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    let mut unit = pool.checkout();
    unit.set_instruction_budget(Some(64));
    let fault = unit.execute(entry()).unwrap_err();
    assert!(fault.is_cancellation());
    assert_eq!(unit.instructions_executed(), 64);
}

#[test]
fn recycled_units_share_memory_but_not_registers() {
    let memory = build_memory(&[0xB8, 0x55, 0x00, 0xC3]);
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    let first = pool.checkout().execute(entry()).unwrap();
    assert_eq!(first.ax(), 0x55);
    // The recycled unit starts from reset state, not the prior run's.
    let unit = pool.checkout();
    assert_eq!(unit.registers().ax(), 0);
}
