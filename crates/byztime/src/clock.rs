// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Platform clock facade.
//!
//! Three clocks matter here: the monotonic *local* clock (never steps or
//! slews, epoch is boot-relative), the best-effort wall clock, and the
//! *clock era* - a 16-byte identifier that changes iff the machine
//! rebooted, used to tell whether a timedata file's local-clock readings
//! are comparable with ours.

use crate::layout::{ClockEra, ERA_LEN};
use crate::stamp::Stamp;
use crate::{Error, Result};
use std::fs;
use std::io;
use std::mem::MaybeUninit;

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

fn clock_gettime(clock_id: libc::clockid_t) -> Result<Stamp> {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: ts points at writable storage for one timespec; the result
    // is only read after clock_gettime reports success.
    let ret = unsafe { libc::clock_gettime(clock_id, ts.as_mut_ptr()) };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: clock_gettime returned 0 and filled ts.
    let ts = unsafe { ts.assume_init() };
    Stamp::new(ts.tv_sec as i64, ts.tv_nsec as i64).try_normalize()
}

/// Current local time: monotonic, non-adjustable, measured from some
/// boot-relative epoch. Comparable only with other local times from the
/// same machine with no intervening reboot.
pub fn local_time() -> Result<Stamp> {
    clock_gettime(libc::CLOCK_MONOTONIC_RAW)
}

/// Current best-effort wall-clock time relative to the POSIX epoch.
pub fn real_time() -> Result<Stamp> {
    clock_gettime(libc::CLOCK_REALTIME)
}

/// The current clock era: 16 bytes that uniquely identify this boot.
///
/// Reads the kernel's dashed-hex boot id and packs it into raw bytes.
pub fn clock_era() -> Result<ClockEra> {
    let text = fs::read_to_string(BOOT_ID_PATH).map_err(Error::Io)?;
    parse_boot_id(text.trim()).ok_or_else(|| {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, "malformed boot id"))
    })
}

/// Parses a `8-4-4-4-12` dashed-hex UUID into 16 raw bytes.
fn parse_boot_id(text: &str) -> Option<ClockEra> {
    let hex: Vec<u8> = text.bytes().filter(|&b| b != b'-').collect();
    if hex.len() != 2 * ERA_LEN {
        return None;
    }
    let mut era = [0u8; ERA_LEN];
    for (out, pair) in era.iter_mut().zip(hex.chunks_exact(2)) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        *out = ((hi << 4) | lo) as u8;
    }
    Some(era)
}
