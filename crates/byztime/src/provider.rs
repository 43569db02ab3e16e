// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Provider (writer) side of the timedata channel.
//!
//! Exactly one provider exists per timedata file at a time, enforced by an
//! exclusive advisory lock on the `.lock` sibling. The provider
//! (re)initializes the record on open and then publishes entries into the
//! ring, each publish ending with a release-store of the ring index.
//!
//! # Initialization invariants
//!
//! 1. If the magic is correct, the rest of the record is well-formed.
//! 2. If the era is current, the entry at the published index is valid.
//!
//! So first-time initialization writes the magic last, and post-reboot
//! reinitialization (magic already valid) writes the era last. The fences
//! inside the magic/era accessors make the stores visible in that order.

use crate::clock;
use crate::estimate::{self, Bounds, Estimator};
use crate::layout::{Entry, MAGIC, NUM_ENTRIES};
use crate::map::TimeDataMap;
use crate::mutex::SharedMutex;
use crate::stamp::Stamp;
use crate::Result;
use std::path::Path;

/// Error bound published before any real measurement exists: wide enough
/// that every consumer treats the offset as no better than a guess.
const UNKNOWN_ERROR: Stamp = Stamp::new(i64::MAX >> 1, 0);

/// Read-write handle to a timedata file.
pub struct Provider {
    map: TimeDataMap,
    estimator: Estimator,
}

impl Provider {
    /// Opens `path` read-write, creating and initializing the record if it
    /// is missing, malformed, or from a previous boot.
    ///
    /// # Errors
    ///
    /// Any `Io` error from the OS - in particular the `flock` failure when
    /// another provider is alive - plus `NameTooLong` if the derived lock
    /// path exceeds the platform limit.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path.as_ref())
    }

    fn open_impl(path: &Path) -> Result<Self> {
        let era = clock::clock_era()?;
        let map = TimeDataMap::open_rw(path)?;
        let data = map.data();

        let index = data.load_index();
        if data.load_magic() != MAGIC || index < 0 || index as usize >= NUM_ENTRIES {
            // First-time initialization.
            log::debug!("[TIMEDATA] initializing {}", path.display());
            data.set_real_offset(Stamp::ZERO);
            data.write_entry(0, bootstrap_entry(Stamp::ZERO)?);
            data.store_index(0);
            data.store_era(&era);
            data.store_magic(&MAGIC);
        } else if data.load_era() != era {
            // The machine rebooted since the record was written: local
            // clock readings in the ring are no longer comparable with
            // ours. Reseed from the persisted (global - wall) offset.
            log::debug!("[TIMEDATA] clock era changed, reseeding {}", path.display());
            data.write_entry(0, bootstrap_entry(data.real_offset())?);
            data.store_index(0);
            data.store_era(&era);
        }

        // Safe to clobber: the advisory lock excludes every other writer,
        // including one that died while holding this mutex.
        SharedMutex::from_ptr(data.mutex_ptr()).init()?;

        Ok(Self { map, estimator: Estimator::new() })
    }

    /// Publishes a new offset and error bound.
    ///
    /// `as_of` is the local time the error was measured at; `None` means
    /// now. All three stamps are normalized before they hit the ring, so
    /// readers always observe normalized fields.
    pub fn set_offset(&mut self, offset: Stamp, error: Stamp, as_of: Option<Stamp>) -> Result<()> {
        let as_of = match as_of {
            Some(stamp) => stamp,
            None => clock::local_time()?,
        };
        let entry = Entry::new(
            offset.try_normalize()?,
            error.try_normalize()?,
            as_of.try_normalize()?,
        );

        let data = self.map.data();
        let mutex = SharedMutex::from_ptr(data.mutex_ptr());
        mutex.lock()?;
        let next = (data.load_index() as usize + 1) % NUM_ENTRIES;
        data.write_entry(next, entry);
        data.store_index(next as i32);
        mutex.unlock()
    }

    /// The last published offset, read without fences or validation.
    /// Best-effort introspection for the writer itself.
    #[must_use]
    pub fn offset_quick(&self) -> Stamp {
        self.current_entry().offset
    }

    /// The entry exactly as last published, without any recomputation of
    /// the error bound.
    #[must_use]
    pub fn offset_raw(&self) -> Entry {
        self.current_entry()
    }

    fn current_entry(&self) -> Entry {
        let data = self.map.data();
        // The index is ours to maintain; the modulo only guards against a
        // record scribbled on by some other process despite the lock.
        let index = data.load_index_relaxed().rem_euclid(NUM_ENTRIES as i32);
        data.read_entry(index as usize)
    }

    /// Recomputes and records the current `(global - wall)` difference.
    ///
    /// This is what seeds the bootstrap entry after the next reboot, when
    /// the monotonic clock has reset but the wall clock (battery-backed or
    /// restored by the OS) is still roughly meaningful.
    pub fn update_real_offset(&mut self) -> Result<()> {
        let global = self.global_time()?.est;
        let real = clock::real_time()?;
        let real_offset = global.try_sub(real)?;

        let data = self.map.data();
        let mutex = SharedMutex::from_ptr(data.mutex_ptr());
        mutex.lock()?;
        data.set_real_offset(real_offset);
        mutex.unlock()
    }

    /// Bounds and estimate of the offset `(global - local)`; see
    /// [`Consumer::offset`](crate::Consumer::offset).
    pub fn offset(&mut self) -> Result<Bounds> {
        let (_, bounds) = estimate::local_time_and_offset(self.map.data(), &mut self.estimator)?;
        Ok(bounds)
    }

    /// Bounds and estimate of the global time; see
    /// [`Consumer::global_time`](crate::Consumer::global_time).
    pub fn global_time(&mut self) -> Result<Bounds> {
        estimate::global_time(self.map.data(), &mut self.estimator)
    }

    /// Sets the drift rate (parts per billion) used in error projection.
    pub fn set_drift(&mut self, drift_ppb: i64) {
        self.estimator.set_drift_ppb(drift_ppb);
    }

    /// The drift rate used in error projection.
    #[must_use]
    pub fn drift(&self) -> i64 {
        self.estimator.drift_ppb()
    }

    /// Begins slewing this handle's own estimates; see
    /// [`Consumer::slew`](crate::Consumer::slew).
    pub fn slew(
        &mut self,
        min_rate_ppb: i64,
        max_rate_ppb: i64,
        max_error: Option<Stamp>,
    ) -> Result<()> {
        estimate::begin_slew(self.map.data(), &mut self.estimator, min_rate_ppb, max_rate_ppb, max_error)
    }

    /// Returns this handle's estimates to step mode.
    pub fn step(&mut self) {
        self.estimator.step();
    }

    /// Flushes the record to disk and closes the handle. The advisory lock
    /// is released as the handle goes away.
    pub fn close(self) -> Result<()> {
        self.map.sync()
    }
}

/// Seeds entry 0 with the best guess available: the wall clock (shifted by
/// the persisted `(global - wall)` offset) minus the local clock, with an
/// error bound wide enough to read as "unknown".
fn bootstrap_entry(real_offset: Stamp) -> Result<Entry> {
    let local = clock::local_time()?;
    let global = clock::real_time()?.try_add(real_offset)?;
    Ok(Entry::new(global.try_sub(local)?, UNKNOWN_ERROR, local))
}
