//! # TLS Space
//!
//! [`TlsSpace`] is the service object behind the TLS API. It owns the
//! region [`Registry`] and serializes access to page contents.
//!
//! ## Locking
//!
//! Two locks, always taken in this order:
//!
//! 1. `access`: held by `read` and `write` for the whole protection
//!    bracket, so no two access calls ever have pages unprotected at the
//!    same time.
//! 2. `registry`: held by every operation while it looks up or mutates
//!    regions. Share counts only change under this lock, so two threads can
//!    never both decide they dropped the last reference to a page.
//!
//! ## Protection Bracket
//!
//! Outside of `read`/`write`, every page of every region is no-access. The
//! bracket is restored on every normal exit path; a panic inside it aborts
//! the process instead of leaving pages exposed.

use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::TlsConfig;
use crate::error::{TlsError, TlsResult};
use crate::page::Protection;
use crate::region::{Region, RegionInfo};
use crate::registry::{Registry, RegistryStats};
use crate::thread::ThreadKey;
use crate::trap;

/// A directory of per-thread TLS regions.
#[derive(Debug)]
pub struct TlsSpace {
    config: TlsConfig,
    access: Mutex<()>,
    registry: Mutex<Registry>,
}

impl Default for TlsSpace {
    fn default() -> Self {
        Self::new(TlsConfig::default())
    }
}

impl TlsSpace {
    /// Create an empty space.
    pub fn new(config: TlsConfig) -> Self {
        let registry = Registry::new(config.index_capacity);
        Self {
            config,
            access: Mutex::new(()),
            registry: Mutex::new(registry),
        }
    }

    /// Configuration of this space.
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Create a region of `size` bytes for the calling thread.
    ///
    /// The first create in the process installs the fault trap (unless the
    /// configuration disables it).
    pub fn create(&self, size: usize) -> TlsResult<()> {
        if size < 1 {
            return Err(TlsError::InvalidSize(size));
        }
        if self.config.trap.install {
            trap::install(&self.config.trap);
        }

        let owner = ThreadKey::current();
        let mut registry = self.registry.lock();
        if registry.contains(owner) {
            return Err(TlsError::AlreadyExists(owner));
        }

        let region = Region::allocate(owner, size)?;
        let pages = region.page_count();
        let slot = registry.insert(region);
        if slot.is_none() {
            tracing::warn!(%owner, "registry index full; region reachable by list scan only");
        }
        tracing::debug!(%owner, size, pages, ?slot, "region created");
        Ok(())
    }

    /// Destroy the calling thread's region.
    ///
    /// Pages shared with other regions stay mapped for their remaining
    /// owners; private pages are released.
    pub fn destroy(&self) -> TlsResult<()> {
        let owner = ThreadKey::current();
        let mut registry = self.registry.lock();
        let region = registry.remove(owner).ok_or(TlsError::NotFound(owner))?;
        let info = region.info();
        // Dropping the region releases every page whose count reaches zero.
        drop(region);
        tracing::debug!(
            %owner,
            pages = info.page_count(),
            still_shared = info.shared_pages(),
            "region destroyed"
        );
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `offset` from the calling thread's
    /// region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> TlsResult<()> {
        let owner = ThreadKey::current();
        let _access = self.access.lock();
        let registry = self.registry.lock();
        let region = registry.find(owner).ok_or(TlsError::NotFound(owner))?;
        region.check_range(offset, buf.len())?;

        let bracket = Bracket::open(region, Protection::Read);
        region.copy_out(offset, buf);
        bracket.close(region);
        Ok(())
    }

    /// Write `data` starting at `offset` into the calling thread's region.
    ///
    /// Every touched page that is shared with another region is first
    /// replaced by a private copy. If a copy cannot be reserved the call
    /// fails with `OutOfMemory` and the region's contents are unchanged.
    pub fn write(&self, offset: usize, data: &[u8]) -> TlsResult<()> {
        let owner = ThreadKey::current();
        let _access = self.access.lock();
        let mut registry = self.registry.lock();
        let region = registry.find_mut(owner).ok_or(TlsError::NotFound(owner))?;
        region.check_range(offset, data.len())?;

        let bracket = Bracket::open(region, Protection::ReadWrite);
        let result = region.unshare(offset, data.len());
        if result.is_ok() {
            region.copy_in(offset, data);
        }
        bracket.close(region);

        let duplicated = result?;
        if duplicated > 0 {
            tracing::debug!(%owner, offset, len = data.len(), duplicated, "write split shared pages");
        }
        Ok(())
    }

    /// Create a region for the calling thread that shares every page of
    /// `target`'s region.
    pub fn clone_region(&self, target: ThreadKey) -> TlsResult<()> {
        let owner = ThreadKey::current();
        let mut registry = self.registry.lock();
        if registry.contains(owner) {
            return Err(TlsError::AlreadyExists(owner));
        }
        let alias = registry
            .find(target)
            .ok_or(TlsError::NotFound(target))?
            .alias(owner);
        let pages = alias.page_count();
        let slot = registry.insert(alias);
        tracing::debug!(%owner, %target, pages, ?slot, "region cloned");
        Ok(())
    }

    /// Whether the calling thread owns a region.
    pub fn has_region(&self) -> bool {
        self.registry.lock().contains(ThreadKey::current())
    }

    /// Shape of the calling thread's region.
    pub fn region_info(&self) -> TlsResult<RegionInfo> {
        let owner = ThreadKey::current();
        let registry = self.registry.lock();
        registry
            .find(owner)
            .map(Region::info)
            .ok_or(TlsError::NotFound(owner))
    }

    /// Base addresses of the calling thread's pages.
    ///
    /// The addresses are not usable as pointers: the pages rest at
    /// no-access, and touching one terminates the touching thread.
    pub fn page_bases(&self) -> TlsResult<Vec<usize>> {
        let owner = ThreadKey::current();
        let registry = self.registry.lock();
        registry
            .find(owner)
            .map(Region::page_bases)
            .ok_or(TlsError::NotFound(owner))
    }

    /// Registry occupancy counters.
    pub fn stats(&self) -> RegistryStats {
        self.registry.lock().stats()
    }

    /// Owners of every registered region, in insertion order.
    pub fn owners(&self) -> Vec<ThreadKey> {
        self.registry.lock().iter().map(Region::owner).collect()
    }
}

/// Protection bracket around one access call.
///
/// Opening raises every page of the region; [`Bracket::close`] drops them
/// back to no-access. Unwinding past an open bracket aborts.
struct Bracket;

impl Bracket {
    fn open(region: &Region, protection: Protection) -> Self {
        region.protect_all(protection);
        Bracket
    }

    fn close(self, region: &Region) {
        region.protect_all(Protection::None);
        std::mem::forget(self);
    }
}

impl Drop for Bracket {
    fn drop(&mut self) {
        tracing::error!("TLS pages left unprotected by an interrupted access; aborting");
        std::process::abort();
    }
}

// ============================================================================
// Global space
// ============================================================================

static GLOBAL_SPACE: OnceLock<TlsSpace> = OnceLock::new();

/// Initialize the global space with `config`.
///
/// Returns `false` if the global space already exists, in which case
/// `config` is ignored.
pub fn init_with(config: TlsConfig) -> bool {
    let mut fresh = false;
    GLOBAL_SPACE.get_or_init(|| {
        fresh = true;
        TlsSpace::new(config)
    });
    fresh
}

/// The global space, created from the environment on first use.
pub fn global() -> &'static TlsSpace {
    GLOBAL_SPACE.get_or_init(|| TlsSpace::new(TlsConfig::from_env()))
}

/// Create a region of `size` bytes for the calling thread in the global space.
pub fn create(size: usize) -> TlsResult<()> {
    global().create(size)
}

/// Destroy the calling thread's region in the global space.
pub fn destroy() -> TlsResult<()> {
    global().destroy()
}

/// Read from the calling thread's region in the global space.
pub fn read(offset: usize, buf: &mut [u8]) -> TlsResult<()> {
    global().read(offset, buf)
}

/// Write to the calling thread's region in the global space.
pub fn write(offset: usize, data: &[u8]) -> TlsResult<()> {
    global().write(offset, data)
}

/// Clone `target`'s region for the calling thread in the global space.
pub fn clone(target: ThreadKey) -> TlsResult<()> {
    global().clone_region(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page;
    use std::sync::Arc;
    use std::thread;

    fn space() -> Arc<TlsSpace> {
        Arc::new(TlsSpace::new(TlsConfig::default()))
    }

    #[test]
    fn test_create_rejects_zero_size() {
        let space = space();
        assert!(matches!(space.create(0), Err(TlsError::InvalidSize(0))));
        assert!(!space.has_region());
    }

    #[test]
    fn test_create_huge_size_is_out_of_memory() {
        let space = space();
        let before = space.stats();
        assert!(matches!(space.create(usize::MAX), Err(TlsError::OutOfMemory { .. })));
        assert!(!space.has_region());
        assert_eq!(space.stats(), before);
    }

    #[test]
    fn test_create_twice_fails() {
        let space = space();
        space.create(10).unwrap();
        assert!(matches!(space.create(10), Err(TlsError::AlreadyExists(_))));
        space.destroy().unwrap();
    }

    #[test]
    fn test_create_installs_trap() {
        let space = space();
        space.create(1).unwrap();
        assert!(trap::is_installed());
        space.destroy().unwrap();
    }

    #[test]
    fn test_no_region_is_not_found() {
        let space = space();
        let mut buf = [0u8; 1];
        assert!(matches!(space.read(0, &mut buf), Err(TlsError::NotFound(_))));
        assert!(matches!(space.write(0, &buf), Err(TlsError::NotFound(_))));
        assert!(matches!(space.destroy(), Err(TlsError::NotFound(_))));
        assert!(matches!(space.region_info(), Err(TlsError::NotFound(_))));
    }

    #[test]
    fn test_hello_roundtrip() {
        let space = space();
        space.create(10).unwrap();
        assert_eq!(space.region_info().unwrap().page_count(), 1);

        space.write(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        space.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let mut rest = [0xffu8; 5];
        space.read(5, &mut rest).unwrap();
        assert_eq!(rest, [0u8; 5]);
        let mut again = [0xffu8; 5];
        space.read(5, &mut again).unwrap();
        assert_eq!(rest, again);

        space.destroy().unwrap();
    }

    #[test]
    fn test_out_of_bounds_leaves_contents() {
        let space = space();
        space.create(10).unwrap();
        space.write(0, b"0123456789").unwrap();

        let err = space.write(8, b"xyz").unwrap_err();
        assert!(matches!(err, TlsError::OutOfBounds { offset: 8, len: 3, size: 10 }));
        let mut buf = [0u8; 3];
        assert!(space.read(8, &mut buf).is_err());

        let mut all = [0u8; 10];
        space.read(0, &mut all).unwrap();
        assert_eq!(&all, b"0123456789");
        space.destroy().unwrap();
    }

    #[test]
    fn test_create_destroy_restores_stats() {
        let space = space();
        let before = space.stats();
        space.create(3 * page::page_size()).unwrap();
        assert_eq!(space.stats().live_regions, before.live_regions + 1);
        space.destroy().unwrap();
        assert_eq!(space.stats(), before);
    }

    #[test]
    fn test_clone_shares_then_diverges() {
        let ps = page::page_size();
        let space = space();
        space.create(2 * ps).unwrap();
        space.write(ps, b"base").unwrap();
        let owner = ThreadKey::current();

        let cloned = Arc::clone(&space);
        thread::spawn(move || {
            cloned.clone_region(owner).unwrap();
            assert_eq!(cloned.region_info().unwrap().share_counts, vec![2, 2, 2]);

            let mut buf = [0u8; 4];
            cloned.read(ps, &mut buf).unwrap();
            assert_eq!(&buf, b"base");

            cloned.write(ps, b"mine").unwrap();
            assert_eq!(cloned.region_info().unwrap().share_counts, vec![2, 1, 2]);
            cloned.destroy().unwrap();
        })
        .join()
        .unwrap();

        let mut buf = [0u8; 4];
        space.read(ps, &mut buf).unwrap();
        assert_eq!(&buf, b"base");
        assert_eq!(space.region_info().unwrap().share_counts, vec![1, 1, 1]);
        space.destroy().unwrap();
    }

    #[test]
    fn test_clone_errors() {
        let space = space();
        let stranger = ThreadKey::from_u64(u64::MAX).unwrap();
        assert!(matches!(space.clone_region(stranger), Err(TlsError::NotFound(_))));

        space.create(4).unwrap();
        assert!(matches!(
            space.clone_region(ThreadKey::current()),
            Err(TlsError::AlreadyExists(_))
        ));
        space.destroy().unwrap();
    }

    #[test]
    fn test_zero_length_access() {
        let space = space();
        space.create(4).unwrap();
        space.write(4, &[]).unwrap();
        space.read(4, &mut []).unwrap();
        space.destroy().unwrap();
    }

    #[test]
    fn test_owners_in_insertion_order() {
        let space = space();
        space.create(1).unwrap();
        let first = ThreadKey::current();

        let other = Arc::clone(&space);
        let second = thread::spawn(move || {
            other.clone_region(first).unwrap();
            ThreadKey::current()
        })
        .join()
        .unwrap();

        assert_eq!(space.owners(), vec![first, second]);
        space.destroy().unwrap();
        assert_eq!(space.owners(), vec![second]);
    }
}
