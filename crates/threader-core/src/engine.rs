//! Lifecycle and page-pool orchestration.
//!
//! The pool's lock is only ever held for the vector lookup/insert itself —
//! never across a syscall, a byte emission, or a hook publication — so one
//! thread writing into a checked-out page never blocks another thread
//! acquiring or releasing a different one.

use std::sync::atomic::{AtomicBool, Ordering};

use threader_arch::{Active, Encoder};

use crate::config::Config;
use crate::error::Error;
use crate::hook::Hook;
use crate::hostmem;
use crate::page::{PageBuffer, Staging};
use crate::pool::Pool;

fn round_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

/// Gap kept between the host image's end and the first placement hint, so a
/// page never lands immediately adjacent to whatever the loader mapped last.
const HINT_GAP: usize = 16 * 1024 * 1024;

/// Page-managed, multi-threaded JIT function-threading engine.
///
/// Cheap to share: every method takes `&self`, so callers typically wrap one
/// `Engine` in an `Arc` and hand clones to each worker thread.
pub struct Engine {
    config: Config,
    image_end_locator: fn() -> usize,
    pool: spin::Mutex<Pool>,
    disabled: AtomicBool,
    warned_far: AtomicBool,
}

impl Engine {
    /// Construct an engine. Always succeeds: on a target with no registered
    /// code emitter, the engine starts permanently disabled rather than
    /// failing to construct, so a caller that only conditionally wants
    /// threading (falling back to pure interpretation otherwise) never has
    /// to handle a constructor error. Use [`Engine::try_new`] instead to
    /// surface that case as an [`Error`] up front.
    pub fn new() -> Self {
        Self::try_new().unwrap_or_else(|err| {
            log::warn!("threader: {err}; engine starts disabled");
            Self::new_in_state(true)
        })
    }

    /// Like [`Engine::new`], but returns `Err(Error::UnsupportedArch)`
    /// instead of silently starting a disabled engine when this build has no
    /// registered code emitter for the host architecture.
    pub fn try_new() -> Result<Self, Error> {
        if !threader_arch::arch_supported() {
            return Err(Error::UnsupportedArch);
        }
        Ok(Self::new_in_state(false))
    }

    fn new_in_state(disabled: bool) -> Self {
        Self {
            config: Config::new(),
            image_end_locator: hostmem::default_image_end,
            pool: spin::Mutex::new(Pool::default()),
            disabled: AtomicBool::new(disabled),
            warned_far: AtomicBool::new(false),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Override how the engine finds the end of the host image when seeding
    /// its first placement hint. Defaults to parsing `/proc/self/maps` on
    /// Linux and to "no hint" elsewhere.
    pub fn with_image_end_locator(mut self, locator: fn() -> usize) -> Self {
        self.image_end_locator = locator;
        self
    }

    pub fn config(&self) -> Config {
        self.config
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Permanently stop handing out new pages. A one-way latch: once set,
    /// every future [`Engine::acquire`] (and anything built on it, like
    /// [`Engine::start`]) returns `None` without retrying. Pages already
    /// checked out are unaffected and may still be released normally.
    ///
    /// The engine calls this itself when a mapping fails; embedders can also
    /// call it directly, e.g. in response to a sandbox policy that is
    /// expected to start refusing `mmap`/`mprotect` calls.
    pub fn disable(&self) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            log::error!("threader: engine disabled; no further pages will be acquired");
        }
    }

    /// Check out a page with room for at least `reserve` bytes, mapping a
    /// fresh one if none in the pool qualifies. Returns `None` if the engine
    /// is disabled or mapping fails (which also disables it).
    pub fn acquire(&self, reserve: usize) -> Option<PageBuffer> {
        assert!(
            reserve > 0 && reserve <= self.config.page_size,
            "reserve of {reserve} bytes does not fit in a {}-byte page",
            self.config.page_size
        );
        if self.is_disabled() {
            return None;
        }
        if let Some(page) = self.pool.lock().take_with_room(reserve) {
            return Some(page);
        }
        match self.map_new_page() {
            Some(page) => Some(page),
            None => {
                self.disable();
                None
            }
        }
    }

    /// Check out a page and emit the standard chunk prologue into it.
    pub fn start(&self) -> Option<PageBuffer> {
        let mut page = self.acquire(Active::PROLOGUE_LEN)?;
        Active::prologue(&mut page);
        Some(page)
    }

    /// Close out a chunk with the standard epilogue (a normal return) and
    /// release it back to the pool.
    pub fn finish(&self, mut page: PageBuffer, hook: Option<Hook>, staging_value: usize) -> Option<usize> {
        if !page.overflowed {
            Active::epilogue(&mut page);
        }
        self.release(page, hook, staging_value)
    }

    /// Close out a chunk by jumping straight into an already-published
    /// chunk's body (skipping its prologue), chaining the two without a
    /// second call frame. `chunk` of `None` closes the chunk exactly like
    /// [`Engine::finish`] — a normal epilogue and return — since there is
    /// then nothing to splice into.
    pub fn splice(
        &self,
        mut page: PageBuffer,
        hook: Option<Hook>,
        staging_value: usize,
        chunk: Option<usize>,
    ) -> Option<usize> {
        if !page.overflowed {
            match chunk {
                Some(target) => {
                    // SAFETY: `target` is documented to be an address this
                    // engine previously returned from
                    // `release`/`finish`/`splice`, i.e. the start of a live
                    // chunk beginning with the canonical prologue.
                    let observed = unsafe {
                        std::slice::from_raw_parts(target as *const u8, Active::PROLOGUE_LEN)
                    };
                    assert_eq!(
                        observed,
                        Active::PROLOGUE_BYTES,
                        "splice target does not begin with the canonical chunk prologue"
                    );
                    page.jmp(target + Active::PROLOGUE_LEN);
                }
                None => Active::epilogue(&mut page),
            }
        }
        self.release(page, hook, staging_value)
    }

    /// Discard the chunk in progress and return the page to the pool
    /// untouched, as if nothing had been written this round.
    pub fn abandon(&self, mut page: PageBuffer) {
        page.index = page.start;
        page.overflowed = false;
        self.pool.lock().reinsert(page);
    }

    fn release(&self, mut page: PageBuffer, hook: Option<Hook>, staging_value: usize) -> Option<usize> {
        // Checked ahead of the "no bytes written" case below: an overflow can
        // latch with `index` still equal to `start` (the very first append
        // in the chunk was the one that didn't fit), and that must still be
        // handled as an overflow, not mistaken for an empty release.
        if page.overflowed {
            if page.start == 0 {
                // The chunk did not fit even on a freshly mapped page: there
                // is no point retrying on this same page, so leave the
                // caller's hook in a defined transitional state rather than
                // stranding it unset.
                log::warn!(
                    "threader: a chunk did not fit in a freshly mapped page; \
                     increase the configured page size"
                );
                if let Some(hook) = &hook {
                    hook.store(staging_value);
                }
            }
            // Either way nothing was committed; a reused-page overflow
            // (`start > 0`) leaves any hook untouched since the caller will
            // simply retry on a fresh Acquire and the operation is fully
            // recoverable.
            page.index = page.start;
            page.overflowed = false;
            self.pool.lock().reinsert(page);
            return None;
        }

        if page.index == page.start {
            self.pool.lock().reinsert(page);
            return None;
        }

        let chunk_start = page.start;
        let chunk_addr = page.base() as usize + chunk_start;

        page.index = round_up(page.index, page.config().page_align).min(page.config().page_size);
        if let Some(hook) = hook {
            hook.store(staging_value);
            page.staged.push_back(Staging {
                start: chunk_start,
                end: page.index,
                hook,
            });
        }

        if page.config().page_size - page.index < page.config().page_fit {
            page.index = page.config().page_size;
        }
        page.start = page.index;
        page.commit();

        self.pool.lock().reinsert(page);
        Some(chunk_addr)
    }

    /// Force every page with pending staged hooks to publish as much as it
    /// can right now, regardless of the OS-page-alignment boundary that
    /// normal `release` commits respect. Returns how many hooks were
    /// published. Intended for shutdown/quiescence paths, not the hot path.
    pub fn flush(&self) -> usize {
        let mut total = 0;
        loop {
            let mut page = match self.pool.lock().take_with_pending_staging() {
                Some(page) => page,
                None => break,
            };
            if let Some(last) = page.staged.back() {
                let target = round_up(last.end, hostmem::os_page_size()).min(page.config().page_size);
                page.start = target;
                page.index = target;
            }
            total += page.commit();
            self.pool.lock().reinsert(page);
        }
        total
    }

    fn map_new_page(&self) -> Option<PageBuffer> {
        let mut hint = self.next_hint();
        // A handful of retries covers the case where the hint lands on
        // something another allocator mapped first; anything beyond that
        // is treated as the address space being hostile and the engine
        // gives up rather than hunting indefinitely.
        for _ in 0..64 {
            match hostmem::reserve_near(hint, self.config.page_size) {
                hostmem::Placement::Mapped(base) => {
                    // A retry may have walked the hint further than the
                    // single-page advance `next_hint` already committed;
                    // make sure the pool's persisted hint reflects where we
                    // actually landed so the next mapping does not retread
                    // the same occupied addresses.
                    let landed_past = (base as usize).wrapping_add(self.config.page_size);
                    let mut pool = self.pool.lock();
                    if pool.hint.is_none_or(|h| h < landed_past) {
                        pool.hint = Some(landed_past);
                    }
                    drop(pool);
                    self.warn_if_far_from_image(base as usize);
                    return Some(PageBuffer::new(base, self.config));
                }
                hostmem::Placement::HintTaken => {
                    hint += self.config.page_size;
                    continue;
                }
                hostmem::Placement::Failed(err) => {
                    log::error!("threader: failed to map a code page: {err}");
                    return None;
                }
            }
        }
        log::error!("threader: gave up finding an unused placement hint for a code page");
        None
    }

    fn next_hint(&self) -> usize {
        let mut pool = self.pool.lock();
        let base = *pool.hint.get_or_insert_with(|| {
            let image_end = (self.image_end_locator)();
            if image_end == 0 {
                0
            } else {
                round_up(image_end, self.config.page_size) + HINT_GAP
            }
        });
        pool.hint = Some(base + self.config.page_size);
        base
    }

    fn warn_if_far_from_image(&self, base: usize) {
        let image_end = (self.image_end_locator)();
        if image_end == 0 {
            return;
        }
        let distance = base.abs_diff(image_end) as i64;
        if distance > Active::MAX_BRANCH_DISPLACEMENT / 2 && !self.warned_far.swap(true, Ordering::AcqRel) {
            log::warn!(
                "threader: a code page landed {distance:#x} bytes from the host image; \
                 chunk calls/jumps may need the indirect fallback form"
            );
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let mut pool = self.pool.lock();
        for page in pool.drain() {
            // SAFETY: each page's base/len came from a matching
            // `hostmem::reserve_near(_, self.config.page_size)` and nothing
            // outlives the engine holding the only handle to it.
            unsafe {
                hostmem::unmap(page.base(), self.config.page_size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn tiny_engine() -> Engine {
        // Small enough that a handful of chunks cross page boundaries in a
        // test without mapping megabytes of memory.
        Engine::new().with_config(Config::new().with_page_size(4096).with_page_fit(32))
    }

    #[test]
    fn start_finish_publishes_a_callable_chunk() {
        let engine = tiny_engine();
        if engine.is_disabled() {
            return; // unsupported host architecture
        }
        let page = engine.start().unwrap();
        let addr = engine.finish(page, None, 0);
        assert!(addr.is_some());
    }

    #[test]
    fn hook_gets_fallback_then_real_address_after_flush() {
        let engine = tiny_engine();
        if engine.is_disabled() {
            return;
        }
        let hook = Hook::new();
        let page = engine.start().unwrap();
        let addr = engine.finish(page, Some(hook.clone()), 0xDEAD).unwrap();

        assert_eq!(hook.load(), 0xDEAD, "hook should show the transitional value before commit");
        engine.flush();
        assert_eq!(hook.load(), addr, "flush should publish the real chunk address");
    }

    #[test]
    fn abandon_returns_page_to_pool_unchanged() {
        let engine = tiny_engine();
        if engine.is_disabled() {
            return;
        }
        let page = engine.start().unwrap();
        let cursor_before = page.pc();
        engine.abandon(page);

        let page = engine.acquire(1).unwrap();
        assert_eq!(page.pc(), cursor_before);
        engine.abandon(page);
    }

    #[test]
    fn pages_are_reused_until_they_run_out_of_room() {
        let engine = tiny_engine();
        if engine.is_disabled() {
            return;
        }
        let mut addrs = Vec::new();
        for _ in 0..4 {
            let page = engine.start().unwrap();
            addrs.push(engine.finish(page, None, 0).unwrap());
        }
        let page_size = engine.config().page_size;
        let base = addrs[0] & !(page_size - 1);
        assert!(
            addrs.iter().all(|a| a & !(page_size - 1) == base),
            "small chunks should share one mapped page instead of allocating four"
        );
    }

    #[test]
    fn splice_jumps_past_the_target_prologue() {
        let engine = tiny_engine();
        if engine.is_disabled() {
            return;
        }
        let target_page = engine.start().unwrap();
        let target_addr = engine.finish(target_page, None, 0).unwrap();
        engine.flush();

        let page = engine.start().unwrap();
        let addr = engine
            .splice(page, None, 0, Some(target_addr))
            .expect("splice chunk fits in one page");
        assert_ne!(addr, target_addr);
    }

    #[test]
    fn disabled_engine_refuses_to_acquire() {
        let engine = tiny_engine();
        engine.disable();
        assert!(engine.is_disabled());
        assert!(engine.acquire(16).is_none());
    }

    #[test]
    fn release_overflow_on_fresh_page_publishes_staging_value() {
        let engine = tiny_engine();
        if engine.is_disabled() {
            return;
        }
        let mut page = engine.acquire(16).unwrap();
        assert_eq!(page.start, 0, "first chunk on a freshly mapped page");
        // Simulate the chunk's very first emission not fitting.
        page.overflowed = true;

        let hook = Hook::new();
        let result = engine.release(page, Some(hook.clone()), 0xFEED);

        assert!(result.is_none());
        assert_eq!(
            hook.load(),
            0xFEED,
            "a chunk too large for a fresh page must publish the transitional value"
        );
    }

    #[test]
    fn release_overflow_on_reused_page_rewinds_without_touching_hook() {
        let engine = tiny_engine();
        if engine.is_disabled() {
            return;
        }
        // Release one small chunk first so the next acquire reuses a page
        // with `start > 0`.
        let first = engine.start().unwrap();
        engine.finish(first, None, 0).unwrap();

        let mut page = engine.acquire(16).unwrap();
        assert!(page.start > 0, "page should carry the prior release's cursor forward");
        page.overflowed = true;

        let hook = Hook::new();
        hook.store(0xC0FFEE); // a prior, still-valid published address
        let result = engine.release(page, Some(hook.clone()), 0xDEAD);

        assert!(result.is_none());
        assert_eq!(
            hook.load(),
            0xC0FFEE,
            "a chunk that overflows a reused page must leave an existing hook untouched; \
             the caller retries on a fresh acquire and nothing was committed"
        );
    }
}
