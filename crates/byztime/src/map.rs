// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File mapping for the timedata page, plus the writer's advisory lock.
//!
//! # Lock protocol
//!
//! Writers hold an exclusive non-blocking `flock` for their whole
//! lifetime, taken not on the timedata file itself but on a sibling whose
//! path is the resolved real path plus `.lock`. The sibling is created
//! mode 0600 (the timedata file is world-readable 0644) so untrusted
//! users cannot wedge the daemon by sitting on a shared lock forever.

use crate::layout::{TimeData, PAGE_SIZE};
use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

/// An open timedata file and its page mapping.
///
/// Unmaps on drop; the owned descriptors (and with them the advisory
/// lock) close with the `File`s.
pub(crate) struct TimeDataMap {
    ptr: *mut TimeData,
    file: File,
    _lock_file: Option<File>,
}

// SAFETY: the mapping is shared memory meant for cross-process use; all
// concurrent access is mediated by TimeData's atomics and publication
// protocol.
unsafe impl Send for TimeDataMap {}
unsafe impl Sync for TimeDataMap {}

impl TimeDataMap {
    /// Opens and maps an existing timedata file read-only.
    pub(crate) fn open_ro(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        // Catches the common case of being pointed at the wrong file.
        // There is an inherent TOCTOU here - the owner can truncate the
        // file after this check - which is what the bus-error guard is
        // for.
        let len = file.metadata()?.len();
        if len < PAGE_SIZE as u64 {
            return Err(Error::Protocol("file is shorter than one page"));
        }

        let ptr = map_page(&file, libc::PROT_READ)?;
        Ok(Self { ptr, file, _lock_file: None })
    }

    /// Creates/opens the timedata file read-write, takes the writer lock,
    /// and maps the page.
    pub(crate) fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)?;

        let lock_file = acquire_lock(path)?;

        // Reserve real blocks for the whole page. A sparse truncate would
        // leave the provider itself open to a SIGBUS on first store if the
        // file system has no space left.
        // SAFETY: the fd is valid and the range is the fixed record size.
        let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, PAGE_SIZE as libc::off_t) };
        if ret != 0 {
            // Reports the error as its return value, not through errno.
            return Err(Error::Io(io::Error::from_raw_os_error(ret)));
        }

        let ptr = map_page(&file, libc::PROT_READ | libc::PROT_WRITE)?;
        Ok(Self { ptr, file, _lock_file: Some(lock_file) })
    }

    /// The mapped record.
    #[inline]
    pub(crate) fn data(&self) -> &TimeData {
        // SAFETY: ptr came from a successful PAGE_SIZE mapping and stays
        // valid until drop; TimeData is exactly one page, and every
        // concurrent access goes through its atomics/UnsafeCells.
        unsafe { &*self.ptr }
    }

    /// Flushes the backing file.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(Error::Io)
    }
}

impl Drop for TimeDataMap {
    fn drop(&mut self) {
        // SAFETY: ptr/PAGE_SIZE are exactly the mapping created in open_*.
        unsafe {
            libc::munmap(self.ptr.cast(), PAGE_SIZE);
        }
    }
}

fn map_page(file: &File, prot: libc::c_int) -> Result<*mut TimeData> {
    // SAFETY: null hint, fixed length, MAP_SHARED over a valid fd;
    // MAP_FAILED is checked below.
    let ptr = unsafe {
        libc::mmap(ptr::null_mut(), PAGE_SIZE, prot, libc::MAP_SHARED, file.as_raw_fd(), 0)
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(ptr.cast())
}

/// Opens the `.lock` sibling of `path` and takes an exclusive
/// non-blocking advisory lock on it.
fn acquire_lock(path: &Path) -> Result<File> {
    let mut lock_path = std::fs::canonicalize(path)?.into_os_string();
    lock_path.push(".lock");
    if lock_path.len() + 1 > libc::PATH_MAX as usize {
        return Err(Error::NameTooLong);
    }

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(&lock_path)?;

    // SAFETY: the fd is valid for the lifetime of lock_file.
    let ret = unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(lock_file)
}
