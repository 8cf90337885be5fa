//! Thin wrapper over the host's `mmap`/`mprotect`/`munmap`, grounded in the
//! same direct-`libc` style used by production JITs for exactly this purpose
//! (reserving writable memory, then flipping it read-execute once code has
//! been staged into it).
//!
//! Every function here is `unsafe` at the FFI boundary but the wrappers
//! themselves take plain integers and return `Result`, so nothing above this
//! module needs to reach for `unsafe` to drive the engine's memory lifecycle.

use std::io;
use std::sync::OnceLock;

use crate::error::Error;

/// The OS page size, queried once and cached for the life of the process.
pub fn os_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: `_SC_PAGESIZE` is always a valid `sysconf` name.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n <= 0 {
            4096
        } else {
            n as usize
        }
    })
}

/// Outcome of a single placement attempt, distinguishing "the hint address
/// is already spoken for, try elsewhere nearby" from every other failure.
pub enum Placement {
    Mapped(*mut u8),
    HintTaken,
    Failed(Error),
}

/// Reserve `len` bytes of writable, non-executable memory, with a placement
/// hint of `hint`. On Linux, `MAP_FIXED_NOREPLACE` is added whenever `hint` is
/// non-zero so the kernel refuses rather than silently relocates when
/// something already occupies that range; elsewhere the hint is advisory
/// only and the kernel is free to pick elsewhere.
pub fn reserve_near(hint: usize, len: usize) -> Placement {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    #[cfg(target_os = "linux")]
    if hint != 0 {
        flags |= libc::MAP_FIXED_NOREPLACE;
    }

    // SAFETY: all arguments are well-formed per `mmap(2)`; MAP_PRIVATE |
    // MAP_ANONYMOUS with a null fd and zero offset never touches a real file.
    let ptr = unsafe {
        libc::mmap(
            hint as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        #[cfg(target_os = "linux")]
        if flags & libc::MAP_FIXED_NOREPLACE != 0 && err.raw_os_error() == Some(libc::EEXIST) {
            return Placement::HintTaken;
        }
        return Placement::Failed(Error::Mmap(err));
    }
    Placement::Mapped(ptr as *mut u8)
}

/// Flip `len` bytes starting at `base` from writable to read-execute. `base`
/// and `len` must already be OS-page-aligned.
///
/// # Safety
/// `base` must point at a live mapping of at least `len` bytes obtained from
/// [`reserve_near`], with no other references concurrently writing through
/// it — callers observe this because a page is only committed after it is
/// removed from circulation for writing (see `Engine::release`).
pub unsafe fn protect_exec(base: *mut u8, len: usize) -> Result<(), Error> {
    let rc = libc::mprotect(
        base as *mut libc::c_void,
        len,
        libc::PROT_READ | libc::PROT_EXEC,
    );
    if rc != 0 {
        return Err(Error::Mprotect(io::Error::last_os_error()));
    }
    Ok(())
}

/// Release a mapping obtained from [`reserve_near`].
///
/// # Safety
/// `base`/`len` must be the exact pointer and length returned by the
/// matching `reserve_near` call, and nothing may reference the mapping
/// afterward.
pub unsafe fn unmap(base: *mut u8, len: usize) {
    libc::munmap(base as *mut libc::c_void, len);
}

/// Best-effort end address of the host binary's own image in memory, used to
/// pick an initial placement hint that keeps chunk call/jump displacements
/// small. Returns `0` if it cannot be determined, which callers treat as "no
/// useful hint" rather than a hard failure.
pub fn default_image_end() -> usize {
    #[cfg(target_os = "linux")]
    {
        linux_image_end().unwrap_or(0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn linux_image_end() -> Option<usize> {
    use std::fs;

    let exe = fs::read_link("/proc/self/exe").ok()?;
    let maps = fs::read_to_string("/proc/self/maps").ok()?;
    let exe = exe.to_string_lossy();

    let mut end = None;
    for line in maps.lines() {
        let Some(path) = line.split_whitespace().last() else {
            continue;
        };
        if path != exe {
            continue;
        }
        let range = line.split_whitespace().next()?;
        let (_, hi) = range.split_once('-')?;
        let hi = usize::from_str_radix(hi, 16).ok()?;
        end = Some(end.map_or(hi, |prev: usize| prev.max(hi)));
    }
    end
}

/// Map `len` bytes with no placement hint, for use by tests elsewhere in this
/// crate that just need a writable scratch page and do not care where it
/// lands (a bare `hint` of `0` never triggers `MAP_FIXED_NOREPLACE`, so this
/// always succeeds barring real memory exhaustion).
#[cfg(test)]
pub(crate) fn reserve_for_test(len: usize) -> *mut u8 {
    match reserve_near(0, len) {
        Placement::Mapped(base) => base,
        Placement::HintTaken => unreachable!("a null hint never collides"),
        Placement::Failed(err) => panic!("test mmap failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_page_size_is_a_plausible_power_of_two() {
        let size = os_page_size();
        assert!(size >= 4096);
        assert_eq!(size & (size - 1), 0, "page size should be a power of two");
    }

    #[test]
    fn reserve_then_protect_then_unmap_round_trips() {
        let len = os_page_size();
        let base = reserve_for_test(len);
        unsafe {
            std::ptr::write_bytes(base, 0xC3, len); // filler `ret`-ish bytes
            protect_exec(base, len).expect("mprotect to r-x");
            unmap(base, len);
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn default_image_end_finds_something_for_the_test_binary() {
        assert_ne!(default_image_end(), 0);
    }
}
