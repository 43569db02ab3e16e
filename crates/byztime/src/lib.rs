// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # byztime - shared-memory timedata channel
//!
//! A single-writer, many-reader channel over one memory-mapped page through
//! which a time-keeping daemon publishes its current estimate of
//! `global time - local time` together with a rigorous error bound. Local
//! time is the machine's monotonic clock; global time is whatever
//! Byzantine-fault-tolerant clock the daemon agrees on with its peers.
//!
//! Consumers read the current offset (or global time) with wait-free,
//! allocation-free, syscall-free access to the shared page, and remain safe
//! even against a buggy or malicious provider: every field read from the
//! page is validated, and a `SIGBUS` guard converts page faults from a
//! truncated file into ordinary errors.
//!
//! ## Architecture
//!
//! ```text
//! +------------------+                 +------------------+
//! |  byztime daemon  |    timedata     |  consumer proc   |
//! |    Provider      |    (mmap'd      |    Consumer      |
//! |        |         |     page)       |        |         |
//! |        v         |                 |        v         |
//! |   set_offset  ---+---> entries ----+-> offset()       |
//! |                  |     ring        |   global_time()  |
//! +------------------+                 +------------------+
//!       flock(.lock)                     acquire-load index
//! ```
//!
//! The writer fills the next slot of a 62-entry ring and then
//! release-stores the ring index; readers acquire-load the index and copy
//! the published entry. Readers never lock anything.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! fn main() -> byztime::Result<()> {
//!     // Once per process, before the first read.
//!     byztime::install_bus_handler(None)?;
//!
//!     let mut consumer = byztime::Consumer::open("/run/byztime/timedata")?;
//!     let bounds = consumer.global_time()?;
//!     println!("global time {} in [{}, {}]", bounds.est, bounds.min, bounds.max);
//!     Ok(())
//! }
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Stamp`] | 64-bit seconds + 64-bit nanoseconds timestamp arithmetic |
//! | [`Provider`] | Read-write handle: initializes the file and publishes entries |
//! | [`Consumer`] | Read-only handle: validated wait-free reads and projections |
//! | [`Bounds`] | `(min, est, max)` triple returned by the projections |
//! | [`Entry`] | One published `(offset, error, as_of)` record |

/// Platform clock facade: monotonic local time, wall time, and the boot era.
pub mod clock;
/// Read-only consumer side of the channel.
pub mod consumer;
mod estimate;
/// Page-fault guard converting bus errors on the mapped page into errors.
pub mod guard;
/// On-disk/in-memory layout of the shared timedata page.
pub mod layout;
mod map;
mod mutex;
/// Read-write provider side of the channel.
pub mod provider;
/// Timestamp arithmetic with explicit overflow reporting.
pub mod stamp;

pub use consumer::Consumer;
pub use estimate::Bounds;
pub use guard::{handle_bus, install_bus_handler};
pub use layout::{Entry, ClockEra, ERA_LEN, NUM_ENTRIES};
pub use provider::Provider;
pub use stamp::Stamp;

use std::fmt;
use std::io;

/// Default assumed drift rate between the local and global clocks, in parts
/// per billion (2.5e-4).
pub const DEFAULT_DRIFT_PPB: i64 = 250_000;

/// Errors that can occur on the timedata channel.
#[derive(Debug)]
pub enum Error {
    /// An operating-system call failed.
    Io(io::Error),

    /// The timedata file does not match the expected layout or contents,
    /// or was truncated while mapped.
    Protocol(&'static str),

    /// The timedata file is valid but belongs to a previous boot. This
    /// usually means the provider daemon is not running.
    EraMismatch,

    /// Integer overflow during timestamp computation; any result fields
    /// carry two's-complement-wrapped values.
    Overflow,

    /// Slew mode was requested while the current error bound exceeds the
    /// caller's maximum.
    OutOfRange,

    /// The derived lock-file path exceeds the platform limit.
    NameTooLong,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Protocol(what) => write!(f, "timedata file is malformed: {what}"),
            Self::EraMismatch => {
                write!(f, "timedata era does not match the current boot (provider not running?)")
            }
            Self::Overflow => write!(f, "integer overflow during timestamp computation"),
            Self::OutOfRange => write!(f, "current error bound is too large to begin slewing"),
            Self::NameTooLong => write!(f, "lock file path exceeds the platform limit"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for timedata operations.
pub type Result<T> = std::result::Result<T, Error>;
