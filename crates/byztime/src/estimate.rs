// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Projection of the last published entry to "now", and the slew filter.
//!
//! The published datum `(offset, error, as_of)` is only exact at local
//! time `as_of`. Projecting it to the current local time widens the error
//! by the configured drift rate in both directions; the estimate itself is
//! either the bare published offset (step mode) or a rate-clamped value
//! that keeps consecutive global-time estimates continuous (slew mode).

use crate::clock;
use crate::guard;
use crate::layout::{Entry, TimeData, NUM_ENTRIES};
use crate::stamp::Stamp;
use crate::{Error, Result, DEFAULT_DRIFT_PPB};

/// Minimum, estimate, and maximum of an offset or global-time query.
///
/// `min` and `max` bound the actual value. In slew mode the estimate may
/// fall outside `[min, max]`: when a wide previous estimate is superseded
/// by a narrower interval that does not contain it, continuity of the
/// estimate wins over interval membership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bounds {
    pub min: Stamp,
    pub est: Stamp,
    pub max: Stamp,
}

#[derive(Clone, Copy, Debug)]
enum Mode {
    /// Estimates equal the last published offset and may jump.
    Step,
    /// Estimates are clamped so consecutive global-time estimates advance
    /// at a rate within `[min_rate_ppb, max_rate_ppb]`.
    Slew {
        min_rate_ppb: i64,
        max_rate_ppb: i64,
        /// Previous (local time, estimated offset), once seeded.
        prev: Option<(Stamp, Stamp)>,
    },
}

/// Per-handle estimation state: drift rate and step/slew mode.
pub(crate) struct Estimator {
    drift_ppb: i64,
    mode: Mode,
}

impl Estimator {
    pub(crate) fn new() -> Self {
        Self { drift_ppb: DEFAULT_DRIFT_PPB, mode: Mode::Step }
    }

    pub(crate) fn drift_ppb(&self) -> i64 {
        self.drift_ppb
    }

    pub(crate) fn set_drift_ppb(&mut self, drift_ppb: i64) {
        self.drift_ppb = drift_ppb;
    }

    pub(crate) fn step(&mut self) {
        self.mode = Mode::Step;
    }

    /// Enters slew mode. Any previous sample is dropped, so the next
    /// estimate steps once to the current offset and clamping resumes
    /// from there; this is also what makes re-entering slew mode behave
    /// like step-then-slew.
    pub(crate) fn slew(&mut self, min_rate_ppb: i64, max_rate_ppb: i64) {
        self.mode = Mode::Slew { min_rate_ppb, max_rate_ppb, prev: None };
    }

    /// Projects `entry` to local time `local`, returning offset bounds.
    pub(crate) fn project(&mut self, entry: &Entry, local: Stamp) -> Result<Bounds> {
        // Drift may have pulled the clocks apart in either direction since
        // the datum was measured, hence the factor of two.
        let drift_x2 = self.drift_ppb.checked_mul(2).ok_or(Error::Overflow)?;
        let age = local.try_sub(entry.as_of)?;
        let error = entry.error.try_add(age.try_scale(drift_x2)?)?;

        Ok(Bounds {
            min: entry.offset.try_sub(error)?,
            est: self.estimate(entry.offset, local)?,
            max: entry.offset.try_add(error)?,
        })
    }

    fn estimate(&mut self, offset: Stamp, local: Stamp) -> Result<Stamp> {
        let Mode::Slew { min_rate_ppb, max_rate_ppb, prev } = &mut self.mode else {
            return Ok(offset);
        };
        let (min_rate_ppb, max_rate_ppb) = (*min_rate_ppb, *max_rate_ppb);

        let est = match *prev {
            None => offset,
            Some((prev_local, prev_offset)) => {
                let elapsed = local.try_sub(prev_local)?;
                // The change in global time that stepping straight to the
                // new offset would imply.
                let advance = elapsed.try_add(offset.try_sub(prev_offset)?)?;

                let min_advance = elapsed.try_scale(min_rate_ppb)?;
                if advance < min_advance {
                    // Catch up more slowly than the bare step would.
                    offset.try_add(min_advance.try_sub(advance)?)?
                } else if max_rate_ppb < i64::MAX {
                    let max_advance = elapsed.try_scale(max_rate_ppb)?;
                    if advance > max_advance {
                        offset.try_sub(advance.try_sub(max_advance)?)?
                    } else {
                        offset
                    }
                } else {
                    // i64::MAX means an unbounded upper rate.
                    offset
                }
            }
        };

        *prev = Some((local, est));
        Ok(est)
    }
}

/// Wait-free read of the currently published entry, defended against a
/// truncated or malicious file.
pub(crate) fn read_current_entry(data: &TimeData) -> Result<Entry> {
    guard::guarded(|| {
        let index = data.load_index();
        // A hostile writer controls this field; never index with it
        // unchecked.
        if index < 0 || index as usize >= NUM_ENTRIES {
            return Err(Error::Protocol("entry index out of range"));
        }
        let entry = data.read_entry(index as usize);
        if !entry.is_normalized() {
            return Err(Error::Protocol("entry fields are not normalized"));
        }
        Ok(entry)
    })
}

/// Reads the current entry and projects it, returning the local time the
/// projection was made at alongside the offset bounds.
pub(crate) fn local_time_and_offset(
    data: &TimeData,
    estimator: &mut Estimator,
) -> Result<(Stamp, Bounds)> {
    let entry = read_current_entry(data)?;
    let local = clock::local_time()?;
    let bounds = estimator.project(&entry, local)?;
    Ok((local, bounds))
}

/// Offset bounds shifted to global time.
pub(crate) fn global_time(data: &TimeData, estimator: &mut Estimator) -> Result<Bounds> {
    let (local, bounds) = local_time_and_offset(data, estimator)?;
    Ok(Bounds {
        min: bounds.min.try_add(local)?,
        est: bounds.est.try_add(local)?,
        max: bounds.max.try_add(local)?,
    })
}

/// Gate and enter slew mode: refused while the published error bound
/// exceeds `max_error`.
pub(crate) fn begin_slew(
    data: &TimeData,
    estimator: &mut Estimator,
    min_rate_ppb: i64,
    max_rate_ppb: i64,
    max_error: Option<Stamp>,
) -> Result<()> {
    let entry = read_current_entry(data)?;
    if let Some(max_error) = max_error {
        if entry.error > max_error {
            return Err(Error::OutOfRange);
        }
    }
    estimator.slew(min_rate_ppb, max_rate_ppb);
    Ok(())
}
