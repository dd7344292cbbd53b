mod common;

use common::*;
use mbbs_vm::prelude::*;
use std::sync::Arc;

#[test]
fn word_write_wraps_at_the_segment_end() {
    let memory = build_memory(&[]);
    memory.set_word(DATA_SEGMENT, 0xFFFF, 0xABCD).unwrap();
    assert_eq!(memory.byte(DATA_SEGMENT, 0xFFFF).unwrap(), 0xCD);
    assert_eq!(memory.byte(DATA_SEGMENT, 0x0000).unwrap(), 0xAB);
    assert_eq!(memory.word(DATA_SEGMENT, 0xFFFF).unwrap(), 0xABCD);
}

#[test]
fn sentinel_immediate_resolves_through_the_relocation_record() {
    // mov ax, 0xFFFF with a record at the immediate's fix-up site: the
    // executed value is the low half of the far target.
    let memory = build_module(
        &[0xB8, 0xFF, 0xFF, 0xC3],
        vec![RelocationRecord::new(
            1,
            RelocationTarget::Internal(FarPtr::new(0x0007, 0x1000)),
        )],
        &[],
        vec![],
    );
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    let regs = pool.checkout().execute(entry()).unwrap();
    assert_eq!(regs.ax(), 0x1000);
}

#[test]
fn sentinel_immediate_without_a_record_is_plain_minus_one() {
    // mov ax, 0xFFFF with no record stays the constant -1.
    let regs = run_program(&[0xB8, 0xFF, 0xFF, 0xC3]);
    assert_eq!(regs.ax(), 0xFFFF);
}

#[test]
fn raw_decode_path_sees_the_on_disk_sentinel() {
    let memory = build_module(
        &[0xB8, 0xFF, 0xFF, 0xC3],
        vec![RelocationRecord::new(
            1,
            RelocationTarget::Internal(FarPtr::new(0x0007, 0x1000)),
        )],
        &[],
        vec![],
    );
    // The decoder consumed the raw bytes: its immediate is still 0xFFFF.
    let decoded = memory.instruction_at(CODE_SEGMENT, 0).unwrap();
    assert_eq!(decoded.instruction.immediate16(), 0xFFFF);
    assert_eq!(memory.word(CODE_SEGMENT, 1).unwrap(), 0xFFFF);
}

#[test]
fn lds_reads_a_relocated_far_pointer_from_data() {
    // lds bx, [0x0000]; ret
    let memory = build_module(
        &[0xC5, 0x1E, 0x00, 0x00, 0xC3],
        vec![],
        &[0xFF, 0xFF, 0xFF, 0xFF],
        vec![RelocationRecord::new(
            0,
            RelocationTarget::Internal(FarPtr::new(0x4000, 0x0010)),
        )],
    );
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    let regs = pool.checkout().execute(entry()).unwrap();
    assert_eq!(regs.bx(), 0x0010);
    assert_eq!(regs.ds, 0x4000);
}

#[test]
fn self_modifying_code_invalidates_the_decode_cache() {
    // mov byte ptr [0x0006], 0x42 (through DS pointed at the code segment);
    // mov al, 0x00 whose immediate byte lives at offset 6; ret
    let memory = build_memory(&[0xC6, 0x06, 0x06, 0x00, 0x42, 0xB0, 0x00, 0xC3]);
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    let mut unit = pool.checkout();
    {
        let regs = unit.registers_mut();
        regs.ds = CODE_SEGMENT;
        regs.ss = STACK_SEGMENT;
    }
    let regs = unit
        .execute(ExecutionParams {
            bypass_state: true,
            ..entry()
        })
        .unwrap();
    assert_eq!(regs.al(), 0x42, "stale decode served after overwrite");
}

#[test]
fn unmapped_segment_access_faults() {
    // mov al, [bx] with DS pointing at a selector the loader never added
    let pool = UnitPool::new(build_memory(&[0x8A, 0x07, 0xC3]), Arc::new(NoHost));
    let mut unit = pool.checkout();
    unit.registers_mut().ds = 0x0666;
    unit.registers_mut().ss = STACK_SEGMENT;
    let fault = unit
        .execute(ExecutionParams {
            bypass_state: true,
            ..entry()
        })
        .unwrap_err();
    assert!(matches!(fault, Fault::SegmentNotMapped(0x0666)));
}

#[test]
fn push_below_the_segment_floor_is_a_stack_fault() {
    // push ax with SP at zero
    let pool = UnitPool::new(build_memory(&[0x50, 0xC3]), Arc::new(NoHost));
    let mut unit = pool.checkout();
    let fault = unit
        .execute(ExecutionParams {
            initial_sp: 0,
            simulate_call_far: false,
            ..entry()
        })
        .unwrap_err();
    assert!(matches!(
        fault,
        Fault::StackFault {
            segment: STACK_SEGMENT,
            sp: 0
        }
    ));
}

#[test]
fn undecodable_bytes_fault_with_location() {
    // A LOCK prefix on a non-lockable instruction does not decode.
    let pool = UnitPool::new(build_memory(&[0xF0, 0x90, 0xC3]), Arc::new(NoHost));
    let fault = pool.checkout().execute(entry()).unwrap_err();
    match fault {
        Fault::Decode { location, .. } => {
            assert_eq!(location, FarPtr::new(CODE_SEGMENT, 0));
        }
        other => panic!("expected a decode fault, got {other:?}"),
    }
}

#[test]
fn named_variables_live_in_their_own_segment() {
    let memory = build_memory(&[]);
    let ptr = {
        let mut guard = memory.lock();
        guard.allocate_variable("NTERMS", 2)
    };
    memory.set_word(ptr.segment, ptr.offset, 64).unwrap();
    assert_eq!(memory.word(ptr.segment, ptr.offset).unwrap(), 64);
    assert_ne!(ptr.segment, CODE_SEGMENT);
    assert_ne!(ptr.segment, DATA_SEGMENT);
}
