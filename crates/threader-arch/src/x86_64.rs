//! x86-64 byte-code emitter.
//!
//! Every emitted sequence is built up by hand from opcode/ModRM/REX arithmetic
//! rather than pulled from a table, because the surface is tiny (six instruction
//! shapes) and the threader needs tight control over exactly how many bytes each
//! one costs, to keep `GetPc`-based displacement math correct.

use crate::{CodeSink, Encoder};

/// A general-purpose 64-bit register, encoded the way the ISA numbers them
/// (0-7 addressable without a REX prefix, 8-15 require REX.B/R/X).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    const fn index(self) -> u8 {
        self as u8
    }

    const fn low3(self) -> u8 {
        self.index() & 0x7
    }

    const fn needs_rex_ext(self) -> bool {
        self.index() >= 8
    }
}

pub struct X86_64;

impl X86_64 {
    /// `push reg`, with REX.B if `reg` is r8-r15.
    fn emit_push(sink: &mut impl CodeSink, reg: Reg) {
        if reg.needs_rex_ext() {
            sink.emit(&[0x41, 0x50 + reg.low3()]);
        } else {
            sink.emit(&[0x50 + reg.low3()]);
        }
    }

    /// `pop reg`, with REX.B if `reg` is r8-r15.
    fn emit_pop(sink: &mut impl CodeSink, reg: Reg) {
        if reg.needs_rex_ext() {
            sink.emit(&[0x41, 0x58 + reg.low3()]);
        } else {
            sink.emit(&[0x58 + reg.low3()]);
        }
    }
}

impl Encoder for X86_64 {
    type Reg = Reg;

    const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

    const SAVED_REG: Reg = Reg::R15;

    const SCRATCH_REG: Reg = Reg::Rax;

    // push rbp; mov rbp, rsp; push r15; mov r15, rdi
    const PROLOGUE_LEN: usize = 1 + 3 + 2 + 3;

    const PROLOGUE_BYTES: &'static [u8] =
        &[0x55, 0x48, 0x89, 0xE5, 0x41, 0x57, 0x49, 0x89, 0xFF];

    const MAX_BRANCH_DISPLACEMENT: i64 = 0x7FFF_FFFF;

    fn prologue(sink: &mut impl CodeSink) {
        sink.emit(&[0x55]); // push rbp
        sink.emit(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
        Self::emit_push(sink, Self::SAVED_REG);
        Self::mov_reg(sink, Self::SAVED_REG, Self::ARG_REGS[0]);
    }

    fn epilogue(sink: &mut impl CodeSink) {
        Self::emit_pop(sink, Self::SAVED_REG);
        sink.emit(&[0xC9]); // leave
        sink.emit(&[0xC3]); // ret
    }

    fn set_reg(sink: &mut impl CodeSink, reg: Reg, value: u64) {
        if value == 0 {
            // xor r, r — zeroes the full 64-bit register, and is shorter than
            // any `mov` form. Needs REX.R and REX.B when the same extended
            // register appears in both the ModRM.reg and ModRM.rm fields.
            let modrm = 0xC0 | (reg.low3() << 3) | reg.low3();
            if reg.needs_rex_ext() {
                sink.emit(&[0x40 | 0x04 | 0x01, 0x31, modrm]);
            } else {
                sink.emit(&[0x31, modrm]);
            }
            return;
        }

        if value <= u32::MAX as u64 {
            // mov r32, imm32 — zero-extends into the full 64-bit register.
            let imm = (value as u32).to_le_bytes();
            if reg.needs_rex_ext() {
                sink.emit(&[0x41, 0xB8 + reg.low3()]);
            } else {
                sink.emit(&[0xB8 + reg.low3()]);
            }
            sink.emit(&imm);
        } else {
            // mov r64, imm64 (REX.W form, aka movabs).
            let rex = 0x48 | if reg.needs_rex_ext() { 0x01 } else { 0x00 };
            sink.emit(&[rex, 0xB8 + reg.low3()]);
            sink.emit(&value.to_le_bytes());
        }
    }

    fn mov_reg(sink: &mut impl CodeSink, dst: Reg, src: Reg) {
        // mov r/m64, r64 — dst is the r/m operand, src is the reg operand.
        let rex = 0x48
            | if src.needs_rex_ext() { 0x04 } else { 0x00 }
            | if dst.needs_rex_ext() { 0x01 } else { 0x00 };
        let modrm = 0xC0 | (src.low3() << 3) | dst.low3();
        sink.emit(&[rex, 0x89, modrm]);
    }

    fn call(sink: &mut impl CodeSink, addr: usize) {
        // The displacement is measured from the first byte *after* this
        // instruction, which for `E8 disp32` is 5 bytes further on.
        let disp = addr as i64 - (sink.pc() as i64 + 5);
        if let Ok(disp32) = i32::try_from(disp) {
            sink.emit(&[0xE8]);
            sink.emit(&disp32.to_le_bytes());
        } else {
            Self::set_reg(sink, Self::SCRATCH_REG, addr as u64);
            // call *rax — FF /2
            sink.emit(&[0xFF, 0xD0]);
        }
    }

    fn jmp(sink: &mut impl CodeSink, addr: usize) {
        let disp = addr as i64 - (sink.pc() as i64 + 5);
        if let Ok(disp32) = i32::try_from(disp) {
            sink.emit(&[0xE9]);
            sink.emit(&disp32.to_le_bytes());
        } else {
            Self::set_reg(sink, Self::SCRATCH_REG, addr as u64);
            // jmp *rax — FF /4
            sink.emit(&[0xFF, 0xE0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Buf {
        bytes: Vec<u8>,
        base: usize,
    }

    impl CodeSink for Buf {
        fn emit(&mut self, bytes: &[u8]) -> bool {
            self.bytes.extend_from_slice(bytes);
            true
        }

        fn pc(&self) -> usize {
            self.base + self.bytes.len()
        }
    }

    #[test]
    fn zero_immediate_low_register() {
        let mut buf = Buf::default();
        X86_64::set_reg(&mut buf, Reg::Rax, 0);
        assert_eq!(buf.bytes, [0x31, 0xC0]);
    }

    #[test]
    fn zero_immediate_extended_register() {
        let mut buf = Buf::default();
        X86_64::set_reg(&mut buf, Reg::R8, 0);
        assert_eq!(buf.bytes, [0x45, 0x31, 0xC0]);
    }

    #[test]
    fn small_immediate() {
        let mut buf = Buf::default();
        X86_64::set_reg(&mut buf, Reg::Rax, 0x1234);
        assert_eq!(buf.bytes, [0xB8, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn large_immediate_uses_rex_w() {
        let mut buf = Buf::default();
        X86_64::set_reg(&mut buf, Reg::Rax, 0x1_0000_0000);
        assert_eq!(buf.bytes[0], 0x48);
        assert_eq!(buf.bytes[1], 0xB8);
        assert_eq!(buf.bytes.len(), 10);
    }

    #[test]
    fn near_call_is_five_bytes() {
        let mut buf = Buf { base: 0x1000, bytes: Vec::new() };
        X86_64::call(&mut buf, 0x2000);
        assert_eq!(buf.bytes.len(), 5);
        assert_eq!(buf.bytes[0], 0xE8);
    }

    #[test]
    fn far_call_uses_indirect_form() {
        let mut buf = Buf { base: 0, bytes: Vec::new() };
        X86_64::call(&mut buf, 0x1_0000_0000_0000);
        assert!(buf.bytes.len() >= 10 + 2);
        assert_eq!(&buf.bytes[buf.bytes.len() - 2..], [0xFF, 0xD0]);
    }

    #[test]
    fn prologue_matches_published_constant() {
        let mut buf = Buf::default();
        X86_64::prologue(&mut buf);
        assert_eq!(buf.bytes, X86_64::PROLOGUE_BYTES);
        assert_eq!(buf.bytes.len(), X86_64::PROLOGUE_LEN);
    }
}
