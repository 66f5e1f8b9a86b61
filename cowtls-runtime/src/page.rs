//! # Pages
//!
//! A [`Page`] is one anonymous private mapping of exactly one system page.
//! Pages are shared between regions through `Arc<Page>`: the strong count
//! is the page's share count, and dropping the last handle unmaps it.
//!
//! ## Page Directory
//!
//! Every live page is recorded in a process-wide directory of base
//! addresses. The fault trap consults the directory to decide whether a
//! faulting address belongs to TLS memory; it is the only structure the
//! trap reads, so the trap never has to walk regions owned by a
//! [`TlsSpace`](crate::TlsSpace).
//!
//! ## Failure Policy
//!
//! Reservation failures are reported to the caller. A failed `mprotect` or
//! `munmap` on a mapping the runtime created means the environment is
//! broken; the process aborts through [`fatal`].

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::libc;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use parking_lot::Mutex;

/// Access permission of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// No access; the resting state of every page.
    None,
    /// Read-only; held for the duration of a read.
    Read,
    /// Read-write; held for the duration of a write.
    ReadWrite,
}

impl Protection {
    fn flags(self) -> ProtFlags {
        match self {
            Protection::None => ProtFlags::PROT_NONE,
            Protection::Read => ProtFlags::PROT_READ,
            Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        }
    }
}

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// System page size in bytes.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if raw > 0 { raw as usize } else { 4096 };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Number of pages backing a region of `size` bytes.
///
/// Always one more than `size / page_size`, so an exact multiple of the
/// page size gets a trailing page nothing can address.
pub fn pages_for(size: usize) -> usize {
    size / page_size() + 1
}

/// Log and abort. Used when a call on a mapping we own fails.
#[cold]
pub(crate) fn fatal(what: &str, base: usize, err: nix::Error) -> ! {
    tracing::error!(base = format_args!("{base:#x}"), error = %err, "{what} failed; aborting");
    std::process::abort()
}

// ============================================================================
// Page Directory
// ============================================================================

/// Base addresses of every live page.
static DIRECTORY: Mutex<BTreeSet<usize>> = Mutex::new(BTreeSet::new());

/// Number of pages currently mapped by the runtime.
pub fn live_pages() -> usize {
    DIRECTORY.lock().len()
}

/// Whether `base` is the start of a page currently mapped by the runtime.
pub fn is_live(base: usize) -> bool {
    DIRECTORY.lock().contains(&base)
}

/// Look up `addr` in the page directory without blocking.
///
/// Makes at most `spins` attempts to take the directory lock and yields
/// between attempts. Returns `None` if the lock could not be taken.
/// Called from the fault handler; must stay free of allocation and logging.
pub(crate) fn directory_lookup(addr: usize, containment: bool, spins: u32) -> Option<bool> {
    for _ in 0..spins {
        if let Some(dir) = DIRECTORY.try_lock() {
            let hit = if containment {
                dir.range(..=addr)
                    .next_back()
                    .map_or(false, |&base| addr - base < PAGE_SIZE.load(Ordering::Relaxed))
            } else {
                dir.contains(&addr)
            };
            return Some(hit);
        }
        // SAFETY: sched_yield is async-signal-safe and has no preconditions.
        unsafe {
            libc::sched_yield();
        }
    }
    None
}

// ============================================================================
// Page
// ============================================================================

/// One mapped page of backing storage.
pub struct Page {
    base: NonNull<u8>,
}

// The mapping is only read or written through `&mut [u8]`/`&[u8]` copies made
// while the caller holds the space's access lock.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Reserve a fresh zero-filled page with the given protection.
    pub fn reserve(protection: Protection) -> nix::Result<Self> {
        let len = NonZeroUsize::new(page_size()).ok_or(nix::Error::EINVAL)?;
        // SAFETY: anonymous mapping at a kernel-chosen address; touches no
        // existing memory.
        let base = unsafe {
            mman::mmap_anonymous(None, len, protection.flags(), MapFlags::MAP_PRIVATE)?
        };
        let page = Self { base: base.cast() };
        DIRECTORY.lock().insert(page.base_addr());
        tracing::trace!(base = format_args!("{:#x}", page.base_addr()), "page reserved");
        Ok(page)
    }

    /// Reserve a new read-write page holding a copy of this one.
    ///
    /// `self` must currently be readable.
    pub fn duplicate(&self) -> nix::Result<Self> {
        let copy = Self::reserve(Protection::ReadWrite)?;
        // SAFETY: both mappings are one page long, distinct, and readable
        // (source) / writable (copy).
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.as_ptr(), copy.base.as_ptr(), page_size());
        }
        tracing::trace!(
            from = format_args!("{:#x}", self.base_addr()),
            to = format_args!("{:#x}", copy.base_addr()),
            "page duplicated"
        );
        Ok(copy)
    }

    /// Change the protection of this page. Aborts on failure.
    pub fn protect(&self, protection: Protection) {
        // SAFETY: `base` is a live mapping of exactly one page owned by self.
        let result = unsafe { mman::mprotect(self.base.cast(), page_size(), protection.flags()) };
        if let Err(err) = result {
            fatal("mprotect", self.base_addr(), err);
        }
    }

    /// Opaque base address of the mapping.
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the page.
    ///
    /// # Safety
    ///
    /// The page must be readable and `offset + dst.len()` must not exceed the
    /// page size.
    pub(crate) unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(offset + dst.len() <= page_size());
        std::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
    }

    /// Copy `src` into the page starting at `offset`.
    ///
    /// # Safety
    ///
    /// The page must be writable, not shared with another region, and
    /// `offset + src.len()` must not exceed the page size.
    pub(crate) unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= page_size());
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let base = self.base_addr();
        DIRECTORY.lock().remove(&base);
        // SAFETY: the mapping was created by `reserve` and this is its last
        // handle.
        if let Err(err) = unsafe { mman::munmap(self.base.cast(), page_size()) } {
            fatal("munmap", base, err);
        }
        tracing::trace!(base = format_args!("{base:#x}"), "page released");
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("base", &format_args!("{:#x}", self.base_addr()))
            .finish()
    }
}
