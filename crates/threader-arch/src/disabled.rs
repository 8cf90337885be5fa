//! Stand-in encoder for architectures this crate does not know how to thread.
//!
//! `threader-core` checks [`crate::arch_supported`] at `Engine` construction time
//! and disables itself permanently before any of these methods would run; they
//! exist only so the crate compiles on every target.

use crate::{CodeSink, Encoder};

/// A placeholder register type: there is nothing to name on a disabled target,
/// so this carries no data and every instance compares equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoReg;

pub struct Disabled;

impl Encoder for Disabled {
    type Reg = NoReg;

    const ARG_REGS: [NoReg; 6] = [NoReg, NoReg, NoReg, NoReg, NoReg, NoReg];

    const SAVED_REG: NoReg = NoReg;

    const SCRATCH_REG: NoReg = NoReg;

    const PROLOGUE_LEN: usize = 0;

    const PROLOGUE_BYTES: &'static [u8] = &[];

    const MAX_BRANCH_DISPLACEMENT: i64 = 0;

    fn prologue(_sink: &mut impl CodeSink) {
        unreachable!("threader-core disables the engine before emitting on this target")
    }

    fn epilogue(_sink: &mut impl CodeSink) {
        unreachable!("threader-core disables the engine before emitting on this target")
    }

    fn set_reg(_sink: &mut impl CodeSink, _reg: NoReg, _value: u64) {
        unreachable!("threader-core disables the engine before emitting on this target")
    }

    fn mov_reg(_sink: &mut impl CodeSink, _dst: NoReg, _src: NoReg) {
        unreachable!("threader-core disables the engine before emitting on this target")
    }

    fn call(_sink: &mut impl CodeSink, _addr: usize) {
        unreachable!("threader-core disables the engine before emitting on this target")
    }

    fn jmp(_sink: &mut impl CodeSink, _addr: usize) {
        unreachable!("threader-core disables the engine before emitting on this target")
    }
}
