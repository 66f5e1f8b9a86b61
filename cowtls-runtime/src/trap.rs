//! Fault Trap
//!
//! Process-wide `SIGSEGV`/`SIGBUS` handler that keeps TLS pages reachable
//! only through the read/write API.
//!
//! Every TLS page rests at no-access, so touching one through a raw pointer
//! faults. The handler looks the faulting address up in the page directory:
//!
//! - **TLS page**: only the faulting thread is terminated; the rest of the
//!   process keeps running.
//! - **Anything else**: the action that was installed before the trap is
//!   restored and the fault re-delivered to it, so the standard library's
//!   stack overflow report still works and an unrelated crash still takes
//!   the process down.
//!
//! # Platform Support
//!
//! - **Linux**: the faulting thread exits through the raw `exit` syscall.
//! - **Other Unix**: the faulting thread exits through `pthread_exit`.
//!
//! # Restrictions
//!
//! The handler runs on the faulting thread in signal context. It takes no
//! blocking lock, allocates nothing and logs nothing; it reads the page
//! directory through a bounded number of `try_lock` attempts and bumps an
//! atomic counter. A terminated thread runs no destructors, so its
//! `JoinHandle` must not be joined.
//!
//! # Usage
//!
//! ```rust,ignore
//! use cowtls_runtime::trap;
//!
//! // Normally done by the first `create`.
//! trap::install(&TrapConfig::default());
//! assert!(trap::is_installed());
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::{FaultMatch, TrapConfig};
use crate::page;

/// Whether the handler has been installed.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Matching policy, as `FaultMatch as u8`.
static FAULT_MATCH: AtomicU8 = AtomicU8::new(FaultMatch::PageStart as u8);

/// Directory lock attempts per fault.
static LOCK_SPINS: AtomicU32 = AtomicU32::new(crate::config::DEFAULT_FAULT_LOCK_SPINS);

/// Threads terminated for touching TLS memory.
static TERMINATED: AtomicU64 = AtomicU64::new(0);

/// Actions the trap replaced, restored for faults it does not own.
static PREVIOUS_SEGV: OnceLock<SigAction> = OnceLock::new();
static PREVIOUS_BUS: OnceLock<SigAction> = OnceLock::new();

/// Install the fault handler for `SIGSEGV` and `SIGBUS`.
///
/// Only the first successful call installs anything; later calls return
/// `false` and leave the active policy untouched. If neither signal could be
/// hooked the trap stays uninstalled and a later call tries again.
pub fn install(config: &TrapConfig) -> bool {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return false;
    }

    FAULT_MATCH.store(config.fault_match as u8, Ordering::SeqCst);
    LOCK_SPINS.store(config.lock_spins.max(1), Ordering::SeqCst);
    // Resolve the page size outside signal context.
    page::page_size();

    // SA_ONSTACK lets the handler run on the alternate stack std sets up,
    // which is the only usable stack after an overflow.
    let action = SigAction::new(
        SigHandler::SigAction(handle_fault),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    let mut hooked = 0;
    for (sig, previous) in [(Signal::SIGSEGV, &PREVIOUS_SEGV), (Signal::SIGBUS, &PREVIOUS_BUS)] {
        // SAFETY: `handle_fault` only performs async-signal-safe work.
        match unsafe { signal::sigaction(sig, &action) } {
            Ok(old) => {
                let _ = previous.set(old);
                hooked += 1;
            }
            Err(err) => tracing::warn!(signal = ?sig, error = %err, "failed to install fault trap"),
        }
    }

    if hooked == 0 {
        INSTALLED.store(false, Ordering::SeqCst);
        tracing::error!("fault trap not installed; raw access to TLS pages will crash the process");
        return false;
    }
    tracing::debug!(fault_match = config.fault_match.as_str(), "fault trap installed");
    true
}

/// Whether the fault handler has been installed.
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

/// Matching policy of the installed handler.
pub fn fault_match() -> FaultMatch {
    FaultMatch::from_u8(FAULT_MATCH.load(Ordering::SeqCst))
}

/// Number of threads terminated for touching TLS memory.
pub fn terminated_threads() -> u64 {
    TERMINATED.load(Ordering::SeqCst)
}

/// Whether `addr` is TLS memory under the active policy.
///
/// `None` when the directory stayed locked for every attempt.
fn classify(addr: usize) -> Option<bool> {
    let containment = fault_match() == FaultMatch::Containment;
    page::directory_lookup(addr, containment, LOCK_SPINS.load(Ordering::Relaxed))
}

/// Signal handler.
///
/// This must be async-signal-safe.
extern "C" fn handle_fault(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = fault_address(info);

    if classify(addr) == Some(true) {
        TERMINATED.fetch_add(1, Ordering::SeqCst);
        exit_current_thread();
    }

    restore_previous(sig);
    // A fault raised by the hardware repeats when the handler returns and
    // reaches the restored action. A signal sent by a process does not.
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers;
    // raise is async-signal-safe.
    unsafe {
        if (*info).si_code <= 0 {
            libc::raise(sig);
        }
    }
}

/// Put back the action the trap replaced for `sig`, or the default one.
fn restore_previous(sig: libc::c_int) {
    let previous = match sig {
        libc::SIGSEGV => PREVIOUS_SEGV.get(),
        libc::SIGBUS => PREVIOUS_BUS.get(),
        _ => None,
    };
    // SAFETY: sigaction and signal are async-signal-safe.
    unsafe {
        match (previous, Signal::try_from(sig)) {
            (Some(action), Ok(target)) => {
                if signal::sigaction(target, action).is_err() {
                    libc::signal(sig, libc::SIG_DFL);
                }
            }
            _ => {
                libc::signal(sig, libc::SIG_DFL);
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
    // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers.
    unsafe { (*info).si_addr as usize }
}

/// Terminate the calling thread without unwinding.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn exit_current_thread() -> ! {
    loop {
        // SAFETY: SYS_exit ends only the calling thread.
        unsafe {
            libc::syscall(libc::SYS_exit, 0);
        }
    }
}

/// Terminate the calling thread without unwinding.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn exit_current_thread() -> ! {
    // SAFETY: ends only the calling thread.
    unsafe { libc::pthread_exit(std::ptr::null_mut()) }
}
