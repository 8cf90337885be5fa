//! Page-managed, multi-threaded JIT function-threading engine.
//!
//! This crate assembles short machine-code stubs that chain together existing,
//! statically-compiled functions, so an interpreter loop can replace a chain of
//! indirect dispatches with one straight-line call sequence. It owns:
//!
//! - reservation of executable memory near the host image ([`engine`]),
//! - per-thread staging of emitted chunks ([`page`]),
//! - atomic publication of function pointers once pages are made executable
//!   ([`hook`]), and
//! - the tiny architecture-specific assembler that does the actual byte
//!   emission (delegated to [`threader_arch`]).
//!
//! What decides *what* to thread — the interpreter/VM — is deliberately not
//! this crate's concern; it only hands this crate pre-resolved function
//! addresses and reads back a hook once it is safe to jump through.

pub mod config;
pub mod engine;
pub mod error;
pub mod hook;
mod hostmem;
pub mod page;
mod pool;

pub use config::Config;
pub use engine::Engine;
pub use error::Error;
pub use hook::Hook;
pub use page::PageBuffer;

/// The concrete encoder this build threads with, re-exported for callers that
/// want to name `Reg` values directly (e.g. to pre-size a reserve).
pub use threader_arch::Active as ActiveEncoder;

/// The register type [`PageBuffer::set_reg`] and friends accept on this build.
pub type Reg = <threader_arch::Active as threader_arch::Encoder>::Reg;
