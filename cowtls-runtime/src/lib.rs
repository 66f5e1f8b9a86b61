//! # cowtls Runtime Library
//!
//! Thread-local storage that lives in protected pages and is reachable only
//! through an explicit read/write API:
//!
//! - **Regions**: each thread owns at most one region of a declared size,
//!   backed by whole pages
//! - **Copy-on-Write Cloning**: a thread can clone another thread's region;
//!   both share pages until one of them writes
//! - **Fault Trap**: pages rest at no-access, and a thread that touches one
//!   through a raw pointer is terminated without taking down the process
//! - **C ABI**: `tls_create`/`tls_read`/`tls_write`/... for non-Rust callers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        COWTLS RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   TlsSpace   │  │   Registry   │  │  Fault Trap  │          │
//! │  │  (space.rs)  │  │(registry.rs) │  │  (trap.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Region    │  │     Page     │  │     FFI      │          │
//! │  │ (region.rs)  │  │  (page.rs)   │  │   (ffi.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use cowtls_runtime::{self as tls, ThreadKey};
//!
//! tls::create(64)?;
//! tls::write(0, b"hello")?;
//! let parent = ThreadKey::current();
//!
//! std::thread::spawn(move || {
//!     tls::clone(parent)?;      // shares the parent's pages
//!     tls::write(0, b"HELLO")?; // private copy of page 0 from here on
//!     tls::destroy()
//! });
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod ffi;
pub mod page;
pub mod region;
pub mod registry;
pub mod space;
pub mod thread;
pub mod trap;

// Re-exports
pub use config::{ConfigError, FaultMatch, TlsConfig, TlsConfigBuilder, TrapConfig};
pub use error::{TlsError, TlsResult};
pub use page::page_size;
pub use region::RegionInfo;
pub use registry::RegistryStats;
pub use space::{clone, create, destroy, global, init_with, read, write, TlsSpace};
pub use thread::ThreadKey;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the global space from `COWTLS_*` environment variables.
///
/// Returns `false` if the global space already existed.
pub fn init_from_env() -> bool {
    init_with(TlsConfig::from_env())
}
