//! Regions: one thread's logical TLS block.

use std::sync::Arc;

use crate::error::{TlsError, TlsResult};
use crate::page::{self, Page, Protection};
use crate::thread::ThreadKey;

/// A thread's TLS region: a declared byte size backed by a sequence of
/// shared pages.
#[derive(Debug)]
pub struct Region {
    owner: ThreadKey,
    size: usize,
    pages: Vec<Arc<Page>>,
    slot: Option<usize>,
}

/// Snapshot of a region's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Owning thread.
    pub owner: ThreadKey,
    /// Declared size in bytes.
    pub size: usize,
    /// Share count of each page, in page order.
    pub share_counts: Vec<usize>,
    /// Registry index slot, if the region is indexed.
    pub slot: Option<usize>,
}

impl RegionInfo {
    /// Number of pages backing the region.
    pub fn page_count(&self) -> usize {
        self.share_counts.len()
    }

    /// Number of pages shared with at least one other region.
    pub fn shared_pages(&self) -> usize {
        self.share_counts.iter().filter(|&&count| count > 1).count()
    }
}

impl Region {
    /// Allocate a region of `size` bytes with fresh no-access pages.
    ///
    /// Pages reserved before a failing reservation are released again.
    pub fn allocate(owner: ThreadKey, size: usize) -> TlsResult<Self> {
        if size < 1 {
            return Err(TlsError::InvalidSize(size));
        }
        let count = page::pages_for(size);
        let mut pages = Vec::new();
        if pages.try_reserve_exact(count).is_err() {
            return Err(TlsError::OutOfMemory { pages: count, source: nix::Error::ENOMEM });
        }
        for _ in 0..count {
            match Page::reserve(Protection::None) {
                Ok(page) => pages.push(Arc::new(page)),
                // `pages` drops here and unmaps what was reserved so far.
                Err(source) => return Err(TlsError::OutOfMemory { pages: count, source }),
            }
        }
        Ok(Self { owner, size, pages, slot: None })
    }

    /// Build a region for `owner` that shares every page of `self`.
    pub fn alias(&self, owner: ThreadKey) -> Self {
        Self {
            owner,
            size: self.size,
            pages: self.pages.iter().map(Arc::clone).collect(),
            slot: None,
        }
    }

    /// Owning thread.
    pub fn owner(&self) -> ThreadKey {
        self.owner
    }

    /// Declared size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of backing pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Registry slot recorded at insertion.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    pub(crate) fn set_slot(&mut self, slot: Option<usize>) {
        self.slot = slot;
    }

    /// Number of regions referencing page `index`.
    pub fn share_count(&self, index: usize) -> usize {
        Arc::strong_count(&self.pages[index])
    }

    /// Base addresses of the backing pages.
    pub fn page_bases(&self) -> Vec<usize> {
        self.pages.iter().map(|page| page.base_addr()).collect()
    }

    /// Shape of the region.
    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            owner: self.owner,
            size: self.size,
            share_counts: self.pages.iter().map(Arc::strong_count).collect(),
            slot: self.slot,
        }
    }

    /// Check that `[offset, offset + len)` lies inside the region.
    pub fn check_range(&self, offset: usize, len: usize) -> TlsResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(TlsError::OutOfBounds { offset, len, size: self.size }),
        }
    }

    /// Set every page to `protection`.
    pub(crate) fn protect_all(&self, protection: Protection) {
        for page in &self.pages {
            page.protect(protection);
        }
    }

    /// Copy `[offset, offset + dst.len())` into `dst`.
    ///
    /// The range must have been checked and every page must be readable.
    pub(crate) fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        for (index, within, span) in spans(offset, dst.len()) {
            // SAFETY: span lies inside page `index`; the caller holds the
            // pages readable.
            unsafe { self.pages[index].copy_out(within, &mut dst[span]) };
        }
    }

    /// Give this region a private copy of every shared page in
    /// `[offset, offset + len)`.
    ///
    /// Every page must be readable. Superseded pages are set back to no-access
    /// and released by this region. On a reservation failure the pages
    /// duplicated so far are kept (their contents are identical) and the
    /// error is returned.
    pub(crate) fn unshare(&mut self, offset: usize, len: usize) -> TlsResult<usize> {
        if len == 0 {
            return Ok(0);
        }
        let ps = page::page_size();
        let first = offset / ps;
        let last = (offset + len - 1) / ps;
        let mut duplicated = 0;
        for index in first..=last {
            if Arc::strong_count(&self.pages[index]) < 2 {
                continue;
            }
            let copy = self.pages[index]
                .duplicate()
                .map_err(|source| TlsError::OutOfMemory { pages: 1, source })?;
            let old = std::mem::replace(&mut self.pages[index], Arc::new(copy));
            old.protect(Protection::None);
            tracing::trace!(
                owner = %self.owner,
                page = index,
                remaining = Arc::strong_count(&old) - 1,
                "copy-on-write"
            );
            duplicated += 1;
        }
        Ok(duplicated)
    }

    /// Copy `src` into `[offset, offset + src.len())`.
    ///
    /// The range must have been checked, every touched page must be private
    /// to this region (see [`Region::unshare`]) and writable.
    pub(crate) fn copy_in(&self, offset: usize, src: &[u8]) {
        for (index, within, span) in spans(offset, src.len()) {
            debug_assert_eq!(Arc::strong_count(&self.pages[index]), 1);
            // SAFETY: span lies inside page `index`, which is private and
            // writable.
            unsafe { self.pages[index].copy_in(within, &src[span]) };
        }
    }
}

/// Split `[offset, offset + len)` into per-page pieces.
///
/// Yields `(page_index, offset_within_page, buffer_range)`: the first piece
/// may start mid-page and the last may end mid-page.
fn spans(offset: usize, len: usize) -> impl Iterator<Item = (usize, usize, std::ops::Range<usize>)> {
    let ps = page::page_size();
    let mut done = 0;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let pos = offset + done;
        let within = pos % ps;
        let take = (ps - within).min(len - done);
        let piece = (pos / ps, within, done..done + take);
        done += take;
        Some(piece)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ThreadKey {
        ThreadKey::current()
    }

    #[test]
    fn test_allocate_rejects_zero() {
        assert!(matches!(Region::allocate(key(), 0), Err(TlsError::InvalidSize(0))));
    }

    #[test]
    fn test_allocate_unmappable_size_is_out_of_memory() {
        let err = Region::allocate(key(), usize::MAX).unwrap_err();
        assert!(matches!(err, TlsError::OutOfMemory { pages, .. } if pages == page::pages_for(usize::MAX)));
    }

    #[test]
    fn test_last_release_unmaps_once() {
        let region = Region::allocate(key(), 100).unwrap();
        let alias = region.alias(ThreadKey::from_u64(u64::MAX).unwrap());
        let watch = Arc::downgrade(&region.pages[0]);
        let base = region.page_bases()[0];

        drop(region);
        assert!(watch.upgrade().is_some());
        assert!(page::is_live(base));

        drop(alias);
        assert!(watch.upgrade().is_none());
    }

    #[test]
    fn test_allocate_page_count() {
        let ps = page::page_size();
        assert_eq!(Region::allocate(key(), 10).unwrap().page_count(), 1);
        assert_eq!(Region::allocate(key(), 2 * ps).unwrap().page_count(), 3);
    }

    #[test]
    fn test_check_range() {
        let region = Region::allocate(key(), 10).unwrap();
        assert!(region.check_range(0, 10).is_ok());
        assert!(region.check_range(10, 0).is_ok());
        assert!(region.check_range(5, 6).is_err());
        assert!(region.check_range(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_spans_partial_pages() {
        let ps = page::page_size();
        let pieces: Vec<_> = spans(ps - 2, ps + 4).collect();
        assert_eq!(
            pieces,
            vec![(0, ps - 2, 0..2), (1, 0, 2..ps + 2), (2, 0, ps + 2..ps + 4)]
        );
        assert_eq!(spans(3, 0).count(), 0);
    }

    #[test]
    fn test_alias_shares_pages() {
        let region = Region::allocate(key(), 100).unwrap();
        let alias = region.alias(ThreadKey::from_u64(u64::MAX).unwrap());
        assert_eq!(region.share_count(0), 2);
        assert_eq!(region.page_bases(), alias.page_bases());

        drop(alias);
        assert_eq!(region.share_count(0), 1);
    }

    #[test]
    fn test_unshare_only_touched_pages() {
        let ps = page::page_size();
        let mut region = Region::allocate(key(), 2 * ps).unwrap();
        let alias = region.alias(ThreadKey::from_u64(u64::MAX).unwrap());

        region.protect_all(Protection::ReadWrite);
        let duplicated = region.unshare(ps, 4).unwrap();
        region.protect_all(Protection::None);

        assert_eq!(duplicated, 1);
        assert_eq!(region.info().share_counts, vec![2, 1, 2]);
        assert_eq!(alias.info().share_counts, vec![2, 1, 2]);
        assert_ne!(region.page_bases()[1], alias.page_bases()[1]);
    }

    #[test]
    fn test_copy_roundtrip_across_pages() {
        let ps = page::page_size();
        let region = Region::allocate(key(), 3 * ps).unwrap();
        let data: Vec<u8> = (0..ps + 10).map(|i| (i % 251) as u8).collect();

        region.protect_all(Protection::ReadWrite);
        region.copy_in(ps - 5, &data);
        let mut back = vec![0u8; data.len()];
        region.copy_out(ps - 5, &mut back);
        region.protect_all(Protection::None);

        assert_eq!(back, data);
    }
}
