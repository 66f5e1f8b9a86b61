//! Error types for TLS operations.

use thiserror::Error;

use crate::thread::ThreadKey;

/// Errors reported by the TLS API.
///
/// Failures of the environment itself (a protection change or unmap the
/// runtime issued that the kernel refused) are not represented here: they
/// abort the process.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A region of zero bytes was requested.
    #[error("invalid region size: {0} (must be at least 1 byte)")]
    InvalidSize(usize),

    /// The thread already owns a region.
    #[error("thread {0} already owns a TLS region")]
    AlreadyExists(ThreadKey),

    /// The thread owns no region.
    #[error("no TLS region registered for thread {0}")]
    NotFound(ThreadKey),

    /// The requested byte range does not fit inside the region.
    #[error("range {offset}+{len} exceeds region size {size}")]
    OutOfBounds {
        /// Start of the requested range.
        offset: usize,
        /// Length of the requested range.
        len: usize,
        /// Declared size of the region.
        size: usize,
    },

    /// Backing memory could not be reserved.
    #[error("failed to reserve {pages} page(s): {source}")]
    OutOfMemory {
        /// Number of pages the call tried to reserve.
        pages: usize,
        /// Error reported by the mapping call.
        #[source]
        source: nix::Error,
    },
}

/// Result type for TLS operations.
pub type TlsResult<T> = Result<T, TlsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_display() {
        let err = TlsError::OutOfBounds { offset: 8, len: 4, size: 10 };
        assert_eq!(err.to_string(), "range 8+4 exceeds region size 10");
    }

    #[test]
    fn test_out_of_memory_has_source() {
        use std::error::Error as _;

        let err = TlsError::OutOfMemory { pages: 3, source: nix::Error::ENOMEM };
        assert!(err.to_string().contains("3 page(s)"));
        assert!(err.source().is_some());
    }
}
