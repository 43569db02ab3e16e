// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-shared mutex embedded in the timedata page.
//!
//! The lock-free read protocol never takes this mutex; it exists purely
//! to serialize writers within and across processes, guarding against the
//! undefined behavior two simultaneous updaters would otherwise cause
//! (e.g. a provider that forks after opening the file). The advisory
//! `.lock` file is the first line of defense against a second daemon; the
//! embedded mutex is the second.

use crate::{Error, Result};
use std::io;
use std::mem::MaybeUninit;

/// Handle to the `pthread_mutex_t` stored inside the mapped record.
pub(crate) struct SharedMutex {
    ptr: *mut libc::pthread_mutex_t,
}

impl SharedMutex {
    pub(crate) fn from_ptr(ptr: *mut libc::pthread_mutex_t) -> Self {
        Self { ptr }
    }

    /// (Re)initializes the mutex for cross-process use.
    ///
    /// Runs on every read-write open. The advisory lock guarantees no
    /// other writer exists at that point, so clobbering whatever state is
    /// in the file is safe - and un-wedges a mutex left locked by a
    /// provider that died holding it.
    pub(crate) fn init(&self) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr points at valid storage; init/setpshared/destroy
        // are called in the documented order, and self.ptr points at
        // suitably aligned storage inside the mapping.
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let ret = libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            );
            if ret != 0 {
                libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                return check(ret);
            }
            let ret = libc::pthread_mutex_init(self.ptr, attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            check(ret)
        }
    }

    pub(crate) fn lock(&self) -> Result<()> {
        // SAFETY: self.ptr points at the mutex initialized by init().
        check(unsafe { libc::pthread_mutex_lock(self.ptr) })
    }

    pub(crate) fn unlock(&self) -> Result<()> {
        // SAFETY: self.ptr points at the mutex locked by this thread.
        check(unsafe { libc::pthread_mutex_unlock(self.ptr) })
    }
}

/// pthread calls report errors as a returned code, not through errno.
fn check(ret: libc::c_int) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::Io(io::Error::from_raw_os_error(ret)))
    }
}
