//! A single mapped code page and the chunks staged inside it.

use std::collections::VecDeque;

use threader_arch::{Active, CodeSink, Encoder};

use crate::config::Config;
use crate::hook::Hook;
use crate::hostmem;
use crate::Reg;

/// A chunk that has been written but whose hook still points at a transitional
/// value, waiting for the page region it lives in to become executable.
pub(crate) struct Staging {
    pub start: usize,
    pub end: usize,
    pub hook: Hook,
}

/// One mapped, page-sized region of writable/executable memory, plus the
/// bookkeeping needed to hand it out for writing and fold finished chunks
/// back into the pool.
pub struct PageBuffer {
    base: *mut u8,
    config: Config,
    /// Bytes from `0` to this offset have been `mprotect`'d read-execute.
    committed: usize,
    /// Start of the chunk currently being written (or of the next one, for a
    /// page sitting idle in the pool).
    pub(crate) start: usize,
    /// Write cursor.
    pub(crate) index: usize,
    /// Set once a write has not fit; subsequent writes on this chunk are
    /// suppressed until the chunk is abandoned or released.
    pub(crate) overflowed: bool,
    /// Bitmask of which of the six argument registers `SetArg` has already
    /// written for the chunk in progress.
    setargs: u8,
    pub(crate) staged: VecDeque<Staging>,
}

// The page owns its mapping exclusively while checked out of the pool (the
// pool itself only ever holds one page per slot), so moving it across
// threads is sound; nothing here is aliased.
unsafe impl Send for PageBuffer {}

impl PageBuffer {
    pub(crate) fn new(base: *mut u8, config: Config) -> Self {
        Self {
            base,
            config,
            committed: 0,
            start: 0,
            index: 0,
            overflowed: false,
            setargs: 0,
            staged: VecDeque::new(),
        }
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn config(&self) -> Config {
        self.config
    }

    /// Whether this page currently has room for a reserve of `reserve` bytes.
    pub(crate) fn has_room(&self, reserve: usize) -> bool {
        self.config.page_size - self.index >= reserve
    }

    /// Whether this page is retired from the reusable set (full, or a chunk
    /// just emptied it below the fit threshold).
    pub(crate) fn is_full(&self) -> bool {
        self.index >= self.config.page_size
    }

    /// Bytes remaining for the chunk in progress.
    pub fn remaining(&self) -> usize {
        if self.overflowed {
            0
        } else {
            self.config.page_size - self.index
        }
    }

    /// Address the next emitted byte will land at.
    pub fn pc(&self) -> usize {
        self.base as usize + self.index
    }

    /// Append raw bytes to the chunk in progress. Returns `false`, and marks
    /// the chunk overflowed, if they do not fit.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if self.overflowed {
            return false;
        }
        let n = bytes.len();
        if n > self.config.page_size - self.index {
            self.overflowed = true;
            return false;
        }
        // SAFETY: `index + n <= page_size`, and this page is checked out
        // exclusively by the caller driving this chunk.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(self.index), n);
        }
        self.index += n;
        true
    }

    pub fn set_reg(&mut self, reg: Reg, value: u64) {
        if self.overflowed {
            return;
        }
        Active::set_reg(self, reg, value);
    }

    pub fn mov_reg(&mut self, dst: Reg, src: Reg) {
        if self.overflowed {
            return;
        }
        Active::mov_reg(self, dst, src);
    }

    /// Load `value` into the `param`-th (0-based) argument register, marking
    /// it as explicitly set so `call`/`jmp` do not clobber it with the
    /// chained-in previous chunk's saved argument.
    pub fn set_arg(&mut self, param: usize, value: u64) {
        assert!(param < 6, "argument index {param} out of range (0..6)");
        if self.overflowed {
            return;
        }
        self.setargs |= 1 << param;
        let reg = Active::ARG_REGS[param];
        self.set_reg(reg, value);
    }

    /// Emit a call to `addr`, restoring argument 0 from the saved
    /// callee-register first unless `set_arg(0, ..)` already set it for this
    /// chunk.
    pub fn call(&mut self, addr: usize) {
        if self.overflowed {
            return;
        }
        if self.setargs & 1 == 0 {
            self.mov_reg(Active::ARG_REGS[0], Active::SAVED_REG);
        }
        self.setargs = 0;
        Active::call(self, addr);
    }

    /// Emit a tail jump to `addr`, without touching argument registers.
    pub fn jmp(&mut self, addr: usize) {
        if self.overflowed {
            return;
        }
        Active::jmp(self, addr);
    }

    /// `mprotect` the committed prefix forward to cover every fully-written,
    /// OS-page-aligned byte range, publishing any staged hooks that now fall
    /// within it. Returns the number of hooks published.
    ///
    /// Caller must have already set `self.start == self.index` (i.e. there is
    /// no chunk in progress) before calling this.
    pub(crate) fn commit(&mut self) -> usize {
        debug_assert_eq!(self.start, self.index);
        let os_page = hostmem::os_page_size();
        let target = (self.start / os_page) * os_page;
        if target <= self.committed {
            return 0;
        }

        // SAFETY: `[committed, target)` has only ever been written through
        // `append`/the encoder, never concurrently, and this page is
        // checked out exclusively by the thread calling `commit`. Only the
        // new delta needs `mprotect`; `[0, committed)` is already read-exec.
        unsafe {
            hostmem::protect_exec(self.base.add(self.committed), target - self.committed)
                .expect("mprotect to read-execute failed; executable memory state is unrecoverable");
        }
        self.committed = target;

        let mut published = 0;
        while let Some(front) = self.staged.front() {
            if front.end > target {
                break;
            }
            let staging = self.staged.pop_front().unwrap();
            staging.hook.store(self.base as usize + staging.start);
            published += 1;
        }
        published
    }
}

impl CodeSink for PageBuffer {
    fn emit(&mut self, bytes: &[u8]) -> bool {
        self.append(bytes)
    }

    fn pc(&self) -> usize {
        PageBuffer::pc(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapped_page(page_size: usize) -> PageBuffer {
        let config = Config::new().with_page_size(page_size);
        let base = hostmem::reserve_for_test(page_size);
        PageBuffer::new(base, config)
    }

    #[test]
    fn append_advances_the_cursor() {
        let mut page = mapped_page(4096);
        assert!(page.append(&[1, 2, 3]));
        assert_eq!(page.index, 3);
        assert_eq!(page.remaining(), 4096 - 3);
        unsafe { hostmem::unmap(page.base(), 4096) };
    }

    #[test]
    fn append_past_the_end_overflows_instead_of_writing() {
        let mut page = mapped_page(4096);
        assert!(!page.append(&vec![0u8; 4097]));
        assert!(page.overflowed);
        assert_eq!(page.remaining(), 0);
        unsafe { hostmem::unmap(page.base(), 4096) };
    }

    #[test]
    fn is_full_only_once_the_cursor_reaches_page_size() {
        let mut page = mapped_page(64);
        assert!(!page.is_full());
        page.index = 64;
        assert!(page.is_full());
        unsafe { hostmem::unmap(page.base(), 64) };
    }
}
