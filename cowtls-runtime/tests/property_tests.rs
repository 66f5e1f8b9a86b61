//! Property-based tests for the TLS access protocol.
//!
//! Uses proptest to generate random ranges and verify invariants hold.

use std::sync::Arc;
use std::thread;

use cowtls_runtime::{page_size, TlsConfig, TlsError, TlsSpace, ThreadKey};
use proptest::prelude::*;

fn space() -> TlsSpace {
    TlsSpace::new(TlsConfig::default())
}

/// Strategy for region sizes spanning up to four pages.
fn region_size() -> impl Strategy<Value = usize> {
    1usize..=4 * 4096
}

/// Strategy for a region size plus an in-bounds `(offset, data)` pair.
fn sized_range() -> impl Strategy<Value = (usize, usize, Vec<u8>)> {
    region_size().prop_flat_map(|size| {
        (0..=size).prop_flat_map(move |offset| {
            let max_len = (size - offset).min(2 * 4096);
            (Just(size), Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Reading back a write returns exactly the written bytes
    #[test]
    fn write_then_read_roundtrip((size, offset, data) in sized_range()) {
        let space = space();
        space.create(size).unwrap();

        space.write(offset, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        space.read(offset, &mut back).unwrap();
        space.destroy().unwrap();

        prop_assert_eq!(back, data);
    }

    /// Out-of-bounds writes fail and leave every byte untouched
    #[test]
    fn out_of_bounds_write_changes_nothing(
        size in region_size(),
        overshoot in 1usize..64,
        fill in any::<u8>(),
    ) {
        let space = space();
        space.create(size).unwrap();
        space.write(0, &vec![fill; size]).unwrap();

        let offset = size / 2;
        let len = size - offset + overshoot;
        let result = space.write(offset, &vec![fill.wrapping_add(1); len]);
        prop_assert!(
            matches!(result, Err(TlsError::OutOfBounds { .. })),
            "expected OutOfBounds, got {:?}",
            result
        );

        let mut all = vec![0u8; size];
        space.read(0, &mut all).unwrap();
        space.destroy().unwrap();
        prop_assert!(all.iter().all(|&b| b == fill));
    }

    /// Page count is always floor(size / page_size) + 1
    #[test]
    fn page_count_matches_size(size in region_size()) {
        let space = space();
        space.create(size).unwrap();
        let info = space.region_info().unwrap();
        space.destroy().unwrap();

        prop_assert_eq!(info.page_count(), size / page_size() + 1);
        prop_assert_eq!(info.size, size);
    }

    /// Create followed by destroy leaves the registry as it was
    #[test]
    fn create_destroy_restores_registry(size in region_size()) {
        let space = space();
        let before = space.stats();
        space.create(size).unwrap();
        space.destroy().unwrap();
        prop_assert_eq!(space.stats(), before);
    }

    /// A clone's writes never leak into the original and vice versa
    #[test]
    fn clone_writes_are_isolated((size, offset, data) in sized_range()) {
        let space = Arc::new(space());
        space.create(size).unwrap();
        let original = vec![0u8; size];
        let owner = ThreadKey::current();

        let clone_space = Arc::clone(&space);
        let clone_data = data.clone();
        let clone_view = thread::spawn(move || {
            clone_space.clone_region(owner).unwrap();
            clone_space.write(offset, &clone_data).unwrap();
            let mut view = vec![0u8; size];
            clone_space.read(0, &mut view).unwrap();
            clone_space.destroy().unwrap();
            view
        })
        .join()
        .unwrap();

        let mut mine = vec![0u8; size];
        space.read(0, &mut mine).unwrap();
        space.destroy().unwrap();

        prop_assert_eq!(mine, original);
        prop_assert_eq!(&clone_view[offset..offset + data.len()], &data[..]);
    }
}
