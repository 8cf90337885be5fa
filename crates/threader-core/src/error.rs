//! Init/config-time failures.
//!
//! Hot-path engine operations (`acquire`, `release`, `splice`, ...) never
//! return this type — they report failure the way the rest of the interface
//! does, with `Option`/`bool`, and fold anything fatal into permanently
//! disabling the engine instead. This enum is reserved for the handful of
//! calls made once, up front, where a caller benefits from knowing *why*
//! setup failed.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to reserve executable memory near the host image")]
    Mmap(#[source] std::io::Error),

    #[error("failed to change page protection")]
    Mprotect(#[source] std::io::Error),

    #[error("host architecture has no registered code emitter")]
    UnsupportedArch,
}
