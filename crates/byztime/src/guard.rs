// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Page-fault guard for reads of the mapped timedata page.
//!
//! A provider (or any process with write permission to the file) can
//! truncate the timedata file after a consumer has mapped it; the
//! consumer's next access to the vanished page then raises a synchronous
//! `SIGBUS` on the faulting instruction. Benign mistakes are caught before
//! mapping, but upholding the promise that a malicious provider can never
//! crash a consumer requires trapping the fault itself.
//!
//! Each page-touching operation runs inside [`guarded`], which arms a
//! thread-local resumption point before the accesses and disarms it after.
//! The process-wide `SIGBUS` handler checks that slot: if armed, it jumps
//! back into the guarded call, which then returns a protocol error; if not
//! armed (or the fault is not a synchronous address error), the handler
//! abstains and the process dies exactly as it would have without us.
//!
//! Handler installation is explicit and process-global: call
//! [`install_bus_handler`] once before the first consumer read, or call
//! [`handle_bus`] from an application-owned handler that needs to share
//! the `SIGBUS` disposition.

use crate::{Error, Result};
use std::cell::Cell;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};

/// Opaque storage for a jump context; sized and aligned to cover the
/// platform `sigjmp_buf` (200 bytes on x86_64 glibc, 312 on aarch64).
#[repr(C, align(16))]
struct JmpBuf {
    _buf: [u64; 64],
}

extern "C" {
    // glibc defines sigsetjmp as a macro over __sigsetjmp; musl exports
    // the plain name.
    #[cfg_attr(target_env = "gnu", link_name = "__sigsetjmp")]
    fn sigsetjmp(env: *mut JmpBuf, savemask: libc::c_int) -> libc::c_int;
    fn siglongjmp(env: *mut JmpBuf, val: libc::c_int) -> !;
}

thread_local! {
    // Const-initialized so that a read from the signal handler is a plain
    // TLS load with no lazy initialization.
    static RESUME: Cell<*mut JmpBuf> = const { Cell::new(ptr::null_mut()) };
}

/// Runs `f` with a resumption point armed for the bus-error handler.
///
/// If a synchronous bus error fires inside `f`, control returns here and
/// the call evaluates to a protocol error.
///
/// `f` must not create values with destructors: the non-local return
/// skips the closure's frames without unwinding them. Every caller in
/// this crate only copies plain data out of the page.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    let mut jmp = MaybeUninit::<JmpBuf>::uninit();

    // SAFETY: jmp lives (and is not moved) until this function returns.
    // The second return happens only via siglongjmp from handle_bus, on
    // this thread, while RESUME still points at jmp; the error path below
    // reads no state written after the first return.
    if unsafe { sigsetjmp(jmp.as_mut_ptr(), 0) } != 0 {
        // Arrived from the signal handler: the page went away under us.
        RESUME.with(|slot| slot.set(ptr::null_mut()));
        return Err(Error::Protocol("bus error while reading the mapped page"));
    }

    RESUME.with(|slot| slot.set(jmp.as_mut_ptr()));
    // Signal ordering on the same thread needs only compiler fences: keep
    // the page accesses strictly inside the armed window.
    compiler_fence(Ordering::AcqRel);
    let result = f();
    compiler_fence(Ordering::AcqRel);
    RESUME.with(|slot| slot.set(ptr::null_mut()));
    result
}

/// Signal-handler half of the page-fault guard.
///
/// Call this from an application-owned `SIGBUS` handler when the
/// application cannot hand the whole disposition to
/// [`install_bus_handler`]. If the signal is a synchronous address error
/// raised inside a guarded timedata access, this function does not return;
/// in every other case it returns without doing anything.
///
/// # Safety
///
/// Must be called only from a signal handler installed with `SA_SIGINFO`,
/// with the arguments the kernel passed to it.
pub unsafe fn handle_bus(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if signo != libc::SIGBUS || info.is_null() {
        return;
    }
    // Anything but a synchronous address error is not ours, and inspecting
    // further state would not be async-signal-safe anyway.
    if (*info).si_code != libc::BUS_ADRERR {
        return;
    }
    // try_with: abstain if this thread's TLS is already being torn down.
    let jmp = match RESUME.try_with(Cell::get) {
        Ok(jmp) => jmp,
        Err(_) => return,
    };
    if jmp.is_null() {
        return;
    }
    // The jump context was armed by `guarded` on this thread and its frame
    // is still live; the fault interrupted the guarded region.
    siglongjmp(jmp, 1)
}

type SigactionFn = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

extern "C" fn bus_trampoline(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // SAFETY: the kernel invoked us with SA_SIGINFO arguments.
    unsafe { handle_bus(signo, info, context) };
    // handle_bus returned, so the fault is not ours: restore the default
    // disposition and re-raise, which terminates the process the way an
    // unhandled SIGBUS would.
    // SAFETY: signal/raise are async-signal-safe.
    unsafe {
        libc::signal(signo, libc::SIG_DFL);
        libc::raise(signo);
    }
}

/// Installs the process-wide `SIGBUS` handler for the page-fault guard.
///
/// Replaces whatever `SIGBUS` action was previously installed; the
/// previous action is stored through `old` when provided. Programs that
/// need their own `SIGBUS` handling should instead call [`handle_bus`]
/// from their handler.
///
/// Must be called before the first consumer read; the guard is inert
/// without it and a truncated file then kills the process.
pub fn install_bus_handler(old: Option<&mut libc::sigaction>) -> Result<()> {
    // SAFETY: an all-zero sigaction is a valid template to fill in.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = bus_trampoline as SigactionFn as usize;
    sa.sa_flags = libc::SA_SIGINFO;
    // SAFETY: sa_mask is valid storage inside sa.
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };

    let old_ptr = old.map_or(ptr::null_mut(), |o| o as *mut libc::sigaction);
    // SAFETY: both pointers are valid or null; SIGBUS is catchable.
    let ret = unsafe { libc::sigaction(libc::SIGBUS, &sa, old_ptr) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}
