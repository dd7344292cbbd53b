mod common;

use common::*;
use mbbs_vm::prelude::*;
use rstest::rstest;
use std::sync::Arc;

/// Run `code` with `data` preloaded into the data segment.
fn run_with_data(code: &[u8], data: &[u8]) -> (CpuRegisters, SharedMemory) {
    let memory = build_module(code, vec![], data, vec![]);
    let pool = UnitPool::new(memory.clone(), Arc::new(NoHost));
    let regs = pool.checkout().execute(entry()).expect("program faulted");
    (regs, memory)
}

fn f32_at(memory: &SharedMemory, offset: u16) -> f32 {
    f32::from_bits(memory.dword(DATA_SEGMENT, offset).unwrap())
}

#[test]
fn fmul_by_memory_dword() {
    // fld dword [4] (10.0); fmul dword [0] (2.5); fstp dword [8]; ret
    let mut data = Vec::new();
    data.extend_from_slice(&2.5f32.to_bits().to_le_bytes());
    data.extend_from_slice(&10.0f32.to_bits().to_le_bytes());
    let code = [
        0xD9, 0x06, 0x04, 0x00, // fld dword ptr [4]
        0xD8, 0x0E, 0x00, 0x00, // fmul dword ptr [0]
        0xD9, 0x1E, 0x08, 0x00, // fstp dword ptr [8]
        0xC3,
    ];
    let (_, memory) = run_with_data(&code, &data);
    assert_eq!(f32_at(&memory, 8), 25.0);
}

#[rstest]
#[case(0.0f32)]
#[case(0.5f32)]
#[case(1.0f32)]
#[case(std::f32::consts::PI)]
#[case(-2.5f32)]
#[case(f32::INFINITY)]
#[case(f32::from_bits(0x7FC0_0001))] // quiet NaN with payload
fn m32_load_store_round_trips_bit_identically(#[case] value: f32) {
    // fld dword [0]; fstp dword [4]; ret
    let code = [
        0xD9, 0x06, 0x00, 0x00, // fld dword ptr [0]
        0xD9, 0x1E, 0x04, 0x00, // fstp dword ptr [4]
        0xC3,
    ];
    let (_, memory) = run_with_data(&code, &value.to_bits().to_le_bytes());
    assert_eq!(
        memory.dword(DATA_SEGMENT, 4).unwrap(),
        value.to_bits(),
        "m32 round trip must preserve the bit pattern"
    );
}

#[test]
fn fild_fistp_round_trips_an_integer() {
    // fild word [0]; fistp word [2]; ret
    let code = [
        0xDF, 0x06, 0x00, 0x00, // fild word ptr [0]
        0xDF, 0x1E, 0x02, 0x00, // fistp word ptr [2]
        0xC3,
    ];
    let (_, memory) = run_with_data(&code, &(-375i16).to_le_bytes());
    assert_eq!(memory.word(DATA_SEGMENT, 2).unwrap() as i16, -375);
}

#[test]
fn fcompp_orders_operands_into_the_condition_codes() {
    // fldz; fld1; fcompp; fnstsw ax; ret -- ST(0)=1.0 > ST(1)=0.0
    let regs = run_program(&[0xD9, 0xEE, 0xD9, 0xE8, 0xDE, 0xD9, 0xDF, 0xE0, 0xC3]);
    let c0 = regs.ax() & 0x0100 != 0;
    let c2 = regs.ax() & 0x0400 != 0;
    let c3 = regs.ax() & 0x4000 != 0;
    assert!(!c0 && !c2 && !c3, "greater-than clears C0/C2/C3");
}

#[test]
fn fcompp_equal_sets_c3() {
    // fld1; fld1; fcompp; fnstsw ax; ret
    let regs = run_program(&[0xD9, 0xE8, 0xD9, 0xE8, 0xDE, 0xD9, 0xDF, 0xE0, 0xC3]);
    assert!(regs.ax() & 0x4000 != 0, "equality sets C3");
    assert!(regs.ax() & 0x0100 == 0);
}

#[test]
fn fxam_classifies_zero() {
    // fldz; fxam; fnstsw ax; ret
    let regs = run_program(&[0xD9, 0xEE, 0xD9, 0xE5, 0xDF, 0xE0, 0xC3]);
    assert!(regs.ax() & 0x4000 != 0, "C3 set for zero");
    assert!(regs.ax() & 0x0400 == 0, "C2 clear for zero");
    assert!(regs.ax() & 0x0100 == 0, "C0 clear for zero");
}

#[test]
fn fxam_reports_empty_stack() {
    // fxam; fnstsw ax; ret
    let regs = run_program(&[0xD9, 0xE5, 0xDF, 0xE0, 0xC3]);
    assert!(regs.ax() & 0x4000 != 0, "C3 set for empty");
    assert!(regs.ax() & 0x0100 != 0, "C0 set for empty");
}

#[test]
fn fsqrt_of_a_loaded_square() {
    // fld dword [0] (4.0); fsqrt; fstp dword [4]; ret
    let code = [
        0xD9, 0x06, 0x00, 0x00, 0xD9, 0xFA, 0xD9, 0x1E, 0x04, 0x00, 0xC3,
    ];
    let (_, memory) = run_with_data(&code, &4.0f32.to_bits().to_le_bytes());
    assert_eq!(f32_at(&memory, 4), 2.0);
}

#[test]
fn masked_zero_divide_yields_infinity_and_a_sticky() {
    // fld dword [0] (1.0); fdiv dword [4] (0.0); fnstsw ax; ret
    let mut data = Vec::new();
    data.extend_from_slice(&1.0f32.to_bits().to_le_bytes());
    data.extend_from_slice(&0.0f32.to_bits().to_le_bytes());
    let code = [
        0xD9, 0x06, 0x00, 0x00, // fld dword ptr [0]
        0xD8, 0x36, 0x04, 0x00, // fdiv dword ptr [4]
        0xDF, 0xE0, // fnstsw ax
        0xC3,
    ];
    let (regs, _) = run_with_data(&code, &data);
    assert!(regs.ax() & 0x0004 != 0, "ZE sticky must latch");
    let mut fpu = regs.fpu.clone();
    assert!(fpu.st(0).unwrap().is_infinite());
}

#[test]
fn unmasked_zero_divide_faults() {
    // fldcw [8] unmasks ZE first
    let mut data = Vec::new();
    data.extend_from_slice(&1.0f32.to_bits().to_le_bytes());
    data.extend_from_slice(&0.0f32.to_bits().to_le_bytes());
    data.extend_from_slice(&0x037Bu16.to_le_bytes()); // control word, ZM clear
    let code = [
        0xD9, 0x2E, 0x08, 0x00, // fldcw [8]
        0xD9, 0x06, 0x00, 0x00, // fld dword ptr [0]
        0xD8, 0x36, 0x04, 0x00, // fdiv dword ptr [4]
        0xC3,
    ];
    let memory = build_module(&code, vec![], &data, vec![]);
    let pool = UnitPool::new(memory, Arc::new(NoHost));
    let fault = pool.checkout().execute(entry()).unwrap_err();
    assert!(matches!(fault, Fault::FpuFault(FpuException::ZeroDivide)));
}

#[test]
fn fistp_truncates_when_the_control_word_says_so() {
    // fldcw [4] (round toward zero); fld dword [0] (2.75); fistp word [8]; ret
    let mut data = Vec::new();
    data.extend_from_slice(&2.75f32.to_bits().to_le_bytes());
    data.extend_from_slice(&0x0F7Fu16.to_le_bytes()); // RC = toward zero
    let code = [
        0xD9, 0x2E, 0x04, 0x00, // fldcw [4]
        0xD9, 0x06, 0x00, 0x00, // fld dword ptr [0]
        0xDF, 0x1E, 0x08, 0x00, // fistp word ptr [8]
        0xC3,
    ];
    let (_, memory) = run_with_data(&code, &data);
    assert_eq!(memory.word(DATA_SEGMENT, 8).unwrap(), 2);
}

#[test]
fn fnstsw_reports_top_after_loads() {
    // fld1; fld1; fnstsw ax; ret -- two pushes leave TOP at 6
    let regs = run_program(&[0xD9, 0xE8, 0xD9, 0xE8, 0xDF, 0xE0, 0xC3]);
    assert_eq!(regs.ax() >> 11 & 0x7, 6);
}

#[test]
fn fninit_empties_the_stack() {
    // fld1; fninit; fxam; fnstsw ax; ret
    let regs = run_program(&[0xD9, 0xE8, 0xDB, 0xE3, 0xD9, 0xE5, 0xDF, 0xE0, 0xC3]);
    assert!(regs.ax() & 0x4000 != 0, "C3 set for empty");
    assert!(regs.ax() & 0x0100 != 0, "C0 set for empty");
}
