//! The pointer-sized cell a reader polls to find out where to jump.
//!
//! A [`Hook`] is shared, reference-counted storage rather than a borrowed
//! reference: the engine may hold a clone inside a pending [`Staging`]
//! (crate::page::Staging) record long after the caller that created the hook
//! has moved on, so a borrow would tie the engine's lifetime to the caller's
//! stack frame for no reason. `Arc` is the same tool the host kernel reaches
//! for whenever a value needs to outlive the scope that created it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A shared, atomically-updated jump target.
///
/// Readers load it with `Ordering::Acquire`; the engine only ever stores to
/// it with `Ordering::Release`, so a non-zero load is guaranteed to observe
/// every write that happened-before the store (the freshly emitted bytes in
/// particular).
#[derive(Clone, Debug)]
pub struct Hook(Arc<AtomicUsize>);

impl Hook {
    /// A fresh hook, initially pointing nowhere (`0`).
    pub fn new() -> Self {
        Self(Arc::new(AtomicUsize::new(0)))
    }

    /// Wrap an existing cell, e.g. one embedded in a caller's own struct.
    pub fn from_cell(cell: Arc<AtomicUsize>) -> Self {
        Self(cell)
    }

    /// Read the current jump target.
    pub fn load(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn store(&self, value: usize) {
        self.0.store(value, Ordering::Release);
    }

    /// Access the underlying cell, e.g. to hand a second clone to a reader
    /// thread directly rather than going through this wrapper.
    pub fn cell(&self) -> &Arc<AtomicUsize> {
        &self.0
    }
}

impl Default for Hook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_hook_points_nowhere() {
        assert_eq!(Hook::new().load(), 0);
    }

    #[test]
    fn clones_share_the_same_cell() {
        let hook = Hook::new();
        let clone = hook.clone();
        hook.store(0x1234);
        assert_eq!(clone.load(), 0x1234);
    }

    #[test]
    fn from_cell_wraps_an_existing_atomic() {
        let cell = Arc::new(AtomicUsize::new(42));
        let hook = Hook::from_cell(cell.clone());
        assert_eq!(hook.load(), 42);
        cell.store(7, Ordering::Release);
        assert_eq!(hook.load(), 7);
    }
}
