//! # FFI Exports
//!
//! C-compatible exports of the TLS API, operating on the global space.
//!
//! ## Usage
//!
//! The crate builds a `cdylib` alongside the `rlib`; link C code against it
//! with `-lcowtls_runtime` and declare:
//!
//! ```c
//! int tls_create(unsigned int size);
//! int tls_destroy(void);
//! int tls_read(unsigned int offset, unsigned int length, char *buffer);
//! int tls_write(unsigned int offset, unsigned int length, const char *buffer);
//! int tls_clone(uint64_t tid);
//! uint64_t tls_self(void);
//! ```
//!
//! Every call returns `0` on success and `-1` on failure. `tls_clone` takes
//! the value another thread obtained from `tls_self`.

use std::ffi::{c_char, c_int, c_uint};

use crate::error::TlsResult;
use crate::space;
use crate::thread::ThreadKey;

fn status(result: TlsResult<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(err) => {
            tracing::debug!(error = %err, "tls call failed");
            -1
        }
    }
}

/// Create a region of `size` bytes for the calling thread.
#[no_mangle]
pub extern "C" fn tls_create(size: c_uint) -> c_int {
    status(space::create(size as usize))
}

/// Destroy the calling thread's region.
#[no_mangle]
pub extern "C" fn tls_destroy() -> c_int {
    status(space::destroy())
}

/// Read `length` bytes at `offset` into `buffer`.
///
/// # Safety
///
/// `buffer` must be valid for writes of `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn tls_read(offset: c_uint, length: c_uint, buffer: *mut c_char) -> c_int {
    if buffer.is_null() && length > 0 {
        return -1;
    }
    let buf: &mut [u8] = if length == 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(buffer.cast::<u8>(), length as usize)
    };
    status(space::read(offset as usize, buf))
}

/// Write `length` bytes from `buffer` at `offset`.
///
/// # Safety
///
/// `buffer` must be valid for reads of `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn tls_write(offset: c_uint, length: c_uint, buffer: *const c_char) -> c_int {
    if buffer.is_null() && length > 0 {
        return -1;
    }
    let data: &[u8] = if length == 0 {
        &[]
    } else {
        std::slice::from_raw_parts(buffer.cast::<u8>(), length as usize)
    };
    status(space::write(offset as usize, data))
}

/// Clone the region of the thread identified by `tid`.
#[no_mangle]
pub extern "C" fn tls_clone(tid: u64) -> c_int {
    match ThreadKey::from_u64(tid) {
        Some(target) => status(space::clone(target)),
        None => -1,
    }
}

/// Identity of the calling thread, for use with `tls_clone`.
#[no_mangle]
pub extern "C" fn tls_self() -> u64 {
    ThreadKey::current().as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_c_roundtrip() {
        assert_eq!(tls_create(32), 0);
        assert_eq!(tls_create(32), -1);

        let msg = b"abc";
        let mut out = [0 as c_char; 3];
        unsafe {
            assert_eq!(tls_write(4, 3, msg.as_ptr().cast()), 0);
            assert_eq!(tls_read(4, 3, out.as_mut_ptr()), 0);
            assert_eq!(tls_read(30, 3, out.as_mut_ptr()), -1);
        }
        assert_eq!(out.map(|c| c as u8), *msg);

        assert_eq!(tls_destroy(), 0);
        assert_eq!(tls_destroy(), -1);
    }

    #[test]
    fn test_c_clone() {
        assert_eq!(tls_create(8), 0);
        unsafe { assert_eq!(tls_write(0, 2, b"hi".as_ptr().cast()), 0) };
        let me = tls_self();

        let seen = thread::spawn(move || {
            assert_eq!(tls_clone(me), 0);
            let mut out = [0 as c_char; 2];
            unsafe { assert_eq!(tls_read(0, 2, out.as_mut_ptr()), 0) };
            assert_eq!(tls_destroy(), 0);
            out.map(|c| c as u8)
        })
        .join()
        .unwrap();

        assert_eq!(&seen, b"hi");
        assert_eq!(tls_clone(0), -1);
        assert_eq!(tls_destroy(), 0);
    }

    #[test]
    fn test_null_buffer_rejected() {
        unsafe {
            assert_eq!(tls_read(0, 1, std::ptr::null_mut()), -1);
            assert_eq!(tls_write(0, 1, std::ptr::null()), -1);
        }
    }
}
