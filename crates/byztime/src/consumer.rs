// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer (reader) side of the timedata channel.
//!
//! Consumers map the timedata file read-only and never block: reading the
//! current entry is an acquire-load of the ring index followed by a plain
//! copy, with no locks, no allocation, and no syscalls other than the
//! clock query the projection needs.
//!
//! Nothing read from the page is trusted. The index is bounds-checked, the
//! copied entry is validated, and every dereference of the mapping runs
//! under the [`guard`](crate::guard) so a file truncated behind our back
//! surfaces as an error instead of a crash. Install the guard's handler
//! (once, process-wide) before the first read.

use crate::clock;
use crate::estimate::{self, Bounds, Estimator};
use crate::guard;
use crate::layout::MAGIC;
use crate::map::TimeDataMap;
use crate::stamp::Stamp;
use crate::{Error, Result};
use std::path::Path;

/// Read-only handle to a timedata file.
pub struct Consumer {
    map: TimeDataMap,
    estimator: Estimator,
}

impl Consumer {
    /// Opens `path` read-only and validates it.
    ///
    /// # Errors
    ///
    /// - `Protocol`: the file is shorter than one page, carries the wrong
    ///   magic, or was truncated while being validated.
    /// - `EraMismatch`: the file is valid but from a previous boot, which
    ///   usually means the provider daemon has not (re)started yet.
    /// - `Io`: the file could not be opened, statted, or mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path.as_ref())
    }

    fn open_impl(path: &Path) -> Result<Self> {
        let era = clock::clock_era()?;
        let map = TimeDataMap::open_ro(path)?;
        let data = map.data();

        // The owner may truncate the file at any point after the length
        // check in open_ro, so even this first look at the page runs under
        // the guard.
        guard::guarded(|| {
            if data.load_magic() != MAGIC {
                return Err(Error::Protocol("bad magic"));
            }
            if data.load_era() != era {
                return Err(Error::EraMismatch);
            }
            Ok(())
        })?;

        log::debug!("[TIMEDATA] attached to {}", path.display());
        Ok(Self { map, estimator: Estimator::new() })
    }

    /// Bounds and estimate of the offset `(global - local)`.
    ///
    /// The error bound is widened by the age of the datum times twice the
    /// configured drift rate. In step mode the estimate is the published
    /// offset; in slew mode it is rate-clamped against the previous
    /// estimate and may then fall outside `[min, max]`.
    pub fn offset(&mut self) -> Result<Bounds> {
        let (_, bounds) = estimate::local_time_and_offset(self.map.data(), &mut self.estimator)?;
        Ok(bounds)
    }

    /// Bounds and estimate of the global time (`local + offset`).
    ///
    /// `min` and `max` bound the *actual* global time, not other nodes'
    /// estimates of it: correct nodes' `[min, max]` ranges always overlap
    /// ours, but their estimates need not fall inside our range.
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

    /// Begins slewing estimates so that consecutive global-time estimates
    /// advance at a rate within `[min_rate_ppb, max_rate_ppb]` (parts per
    /// billion of real time; `i64::MAX` means no upper bound, so
    /// `slew(0, i64::MAX, ..)` lets the estimate move arbitrarily fast but
    /// never backward).
    ///
    /// Entering slew mode with a clock that is still wildly wrong can take
    /// arbitrarily long to catch up with a large future correction, so the
    /// call is refused with `OutOfRange` while the published error bound
    /// exceeds `max_error` (when given).
    ///
    /// Calling this while already slewing is equivalent to stepping and
    /// immediately slewing again: the estimate catches up to the current
    /// offset in a one-time step.
    pub fn slew(
        &mut self,
        min_rate_ppb: i64,
        max_rate_ppb: i64,
        max_error: Option<Stamp>,
    ) -> Result<()> {
        estimate::begin_slew(self.map.data(), &mut self.estimator, min_rate_ppb, max_rate_ppb, max_error)
    }

    /// Returns estimates to step mode: each estimate is the bare published
    /// offset, which may jump discontinuously.
    pub fn step(&mut self) {
        self.estimator.step();
    }

    /// Closes the handle.
    pub fn close(self) {}
}
