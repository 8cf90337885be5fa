//! ISA-specific byte-code emitters used by the JIT threader's code-emission engine.
//!
//! This crate knows nothing about pages, pools, or hooks. It only knows how to turn
//! the six instruction shapes the threader needs (load-immediate, register move,
//! call, jump, prologue, epilogue) into bytes, for whichever of the two supported
//! ISAs the host is running on. On any other architecture [`disabled::Disabled`] is
//! selected, and every emission call panics — callers never reach it because
//! `threader-core` disables the engine permanently on such targets before any
//! encoder method would be invoked.

#![forbid(unsafe_code)]

pub mod aarch64;
pub mod disabled;
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86_64 as Active;

#[cfg(target_arch = "aarch64")]
pub use self::aarch64::AArch64 as Active;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub use self::disabled::Disabled as Active;

/// Whether this build targets one of the two ISAs this crate actually encodes for.
pub const fn arch_supported() -> bool {
    cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
}

/// A destination for emitted bytes.
///
/// Implemented by `threader-core`'s page buffer. An encoder never sees a `PageBuffer`
/// directly, only this narrow capability, so the two crates stay decoupled: this
/// crate has no notion of pools, commits, or hooks.
pub trait CodeSink {
    /// Appends `bytes` to the sink. Returns `false` (and sticks the sink in an
    /// overflowed state) if they do not fit; callers must stop emitting once this
    /// happens, but the sink itself guarantees it will not corrupt its cursor.
    fn emit(&mut self, bytes: &[u8]) -> bool;

    /// The absolute address the next emitted byte would land at.
    fn pc(&self) -> usize;
}

/// The common capability set every ISA back-end implements.
///
/// Methods are generic over the sink rather than hard-coded to `threader-core`'s
/// page buffer type, so this trait can be unit-tested against a plain `Vec<u8>`.
pub trait Encoder {
    /// The register type this ISA's encoder operates on.
    type Reg: Copy + Eq + core::fmt::Debug;

    /// The first six integer argument registers, in calling-convention order.
    const ARG_REGS: [Self::Reg; 6];

    /// The callee-saved register the prologue stashes argument 0 into.
    const SAVED_REG: Self::Reg;

    /// A scratch register used for indirect calls/jumps when a displacement is
    /// out of range. Unused on ISAs (AArch64) where out-of-range displacements
    /// are a precondition violation instead.
    const SCRATCH_REG: Self::Reg;

    /// Length in bytes of the fixed prologue sequence [`Encoder::prologue`] emits.
    const PROLOGUE_LEN: usize;

    /// The exact bytes [`Encoder::prologue`] emits, save for the trailing
    /// register move that stashes argument 0 (which is identical on every call
    /// since `ARG_REGS[0]` and `SAVED_REG` are both fixed per-ISA constants, so
    /// this is in fact the *entire* prologue, provided verbatim so callers like
    /// `Splice` can validate a chunk begins with a canonical prologue).
    const PROLOGUE_BYTES: &'static [u8];

    /// The largest PC-relative branch displacement (in bytes, each direction)
    /// this ISA's direct call/jump instruction can reach.
    const MAX_BRANCH_DISPLACEMENT: i64;

    /// Emits the chunk prologue: establishes a frame and copies argument 0 into
    /// [`Encoder::SAVED_REG`] so it survives across calls that clobber argument
    /// registers.
    fn prologue(sink: &mut impl CodeSink);

    /// Emits the chunk epilogue: tears down the frame and returns.
    fn epilogue(sink: &mut impl CodeSink);

    /// Loads a 64-bit immediate into `reg`.
    fn set_reg(sink: &mut impl CodeSink, reg: Self::Reg, value: u64);

    /// Moves `src` into `dst`.
    fn mov_reg(sink: &mut impl CodeSink, dst: Self::Reg, src: Self::Reg);

    /// Emits a call to the absolute address `addr`.
    fn call(sink: &mut impl CodeSink, addr: usize);

    /// Emits an unconditional jump to the absolute address `addr`.
    fn jmp(sink: &mut impl CodeSink, addr: usize);
}
