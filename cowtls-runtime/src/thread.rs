//! Thread identity.
//!
//! Every OS thread that touches the runtime is lazily assigned a
//! [`ThreadKey`]. Keys are handed out from a process-wide counter, so a key
//! is never reused even after its thread exits; a region left behind by a
//! thread that exited without calling `destroy` can therefore never be
//! adopted by an unrelated thread.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identity of an OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(NonZeroU64);

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadKey = ThreadKey::allocate();
}

impl ThreadKey {
    fn allocate() -> Self {
        let raw = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 threads to wrap.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Key of the calling thread.
    pub fn current() -> Self {
        CURRENT.with(|key| *key)
    }

    /// Rebuild a key from its raw value (as handed out by [`ThreadKey::as_u64`]).
    ///
    /// Returns `None` for zero, which is never a valid key.
    pub fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw value of this key.
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// Home slot of this key in an index of `capacity` slots.
    pub(crate) fn slot(self, capacity: usize) -> usize {
        (self.0.get() % capacity as u64) as usize
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
