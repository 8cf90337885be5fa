//! The set of mapped pages an [`Engine`](crate::Engine) owns, split so that
//! every page with room precedes every full one without needing to scan for
//! the boundary.

use crate::page::PageBuffer;

#[derive(Default)]
pub(crate) struct Pool {
    /// Pages with room for at least a small reserve. Not necessarily sorted
    /// by free space; `acquire` scans for the first fit.
    pub partial: Vec<PageBuffer>,
    /// Pages retired from the reusable set (full, or `Engine::destroy`'d
    /// already and kept here only long enough to be unmapped).
    pub full: Vec<PageBuffer>,
    /// Next placement hint for a fresh mapping, lazily seeded from the host
    /// image's end address on first use.
    pub hint: Option<usize>,
}

impl Pool {
    pub fn reinsert(&mut self, page: PageBuffer) {
        if page.is_full() {
            self.full.push(page);
        } else {
            self.partial.push(page);
        }
    }

    pub fn take_with_room(&mut self, reserve: usize) -> Option<PageBuffer> {
        let idx = self.partial.iter().position(|p| p.has_room(reserve))?;
        Some(self.partial.swap_remove(idx))
    }

    /// Pull out the first partial page with pending staged hooks, for
    /// `Engine::flush`. Restart the scan after each removal since the
    /// caller reinserts pages as it goes.
    pub fn take_with_pending_staging(&mut self) -> Option<PageBuffer> {
        let idx = self.partial.iter().position(|p| !p.staged.is_empty())?;
        Some(self.partial.swap_remove(idx))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PageBuffer> + '_ {
        self.partial.drain(..).chain(self.full.drain(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hostmem;

    fn page(page_size: usize) -> PageBuffer {
        let base = hostmem::reserve_for_test(page_size);
        PageBuffer::new(base, Config::new().with_page_size(page_size))
    }

    #[test]
    fn full_pages_never_enter_the_partial_set() {
        let mut pool = Pool::default();
        let mut full = page(64);
        full.index = 64;
        pool.reinsert(full);
        assert!(pool.partial.is_empty());
        assert_eq!(pool.full.len(), 1);
    }

    #[test]
    fn take_with_room_only_returns_pages_that_fit() {
        let mut pool = Pool::default();
        let mut tight = page(64);
        tight.index = 60; // 4 bytes left
        pool.reinsert(tight);

        assert!(pool.take_with_room(8).is_none());
        let taken = pool.take_with_room(4).expect("4 bytes fit");
        assert_eq!(taken.remaining(), 4);
    }
}
