// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! On-disk/in-memory layout of the shared timedata page.
//!
//! # Memory Layout
//!
//! ```text
//! Offset  Size   Field
//! 0       12     magic ("BYZTIME\0" + four 0xff bytes)
//! 12      4      index of the currently-published entry (atomic i32)
//! 16      16     clock era for which entries[index] is valid
//! 32      16     last recorded (global - wall) offset
//! 48      ~      process-shared mutex (platform-defined size)
//! ...     pad    header padded to 128
//! 128     62*64  entry ring
//! ```
//!
//! The record fills exactly one 4096-byte page; 62 entries is what makes
//! the sizes come out even. All integer fields are little-endian on the
//! supported targets; the mutex storage makes the file non-portable across
//! operating systems.
//!
//! # Synchronization Protocol
//!
//! Writer publish:
//! 1. Write `entries[(index + 1) % 62]` completely
//! 2. Release-store the new index
//!
//! Reader:
//! 1. Acquire-load the index, bounds-check it
//! 2. Copy the entry with plain loads, then validate its fields
//!
//! The writer does not touch the slot at the old index again until 61
//! further publishes have happened, so a reader that copies promptly always
//! observes a self-consistent record; the validation catches both the
//! stalled-reader corner and a malicious writer.
//!
//! Magic and era are multi-word fields observed while the writer may be
//! (re)initializing the record, so they are accessed as relaxed 32-bit
//! word loads/stores bracketed by acquire/release fences: the whole block
//! becomes visible in the order it was written. During initialization the
//! magic is written last (a reader that sees it sees a well-formed record);
//! during post-reboot reinitialization the era is written last.

use crate::stamp::{Stamp, BILLION};
use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{fence, AtomicI32, AtomicU32, Ordering};

/// Length of the magic field in bytes.
pub const MAGIC_LEN: usize = 12;

/// Length of a clock era in bytes.
pub const ERA_LEN: usize = 16;

/// Number of entries in the ring.
pub const NUM_ENTRIES: usize = 62;

/// Size of the whole record: one memory page.
pub const PAGE_SIZE: usize = 4096;

/// Expected contents of the magic field.
pub const MAGIC: [u8; MAGIC_LEN] = *b"BYZTIME\x00\xff\xff\xff\xff";

/// A 16-byte identifier that changes iff the machine rebooted.
pub type ClockEra = [u8; ERA_LEN];

/// One published datum: the offset `(global - local)`, the non-negative
/// half-width of its confidence interval, and the local-clock reading the
/// error was measured at. Packed to 64 bytes; the tail is reserved padding.
#[derive(Clone, Copy, Debug)]
#[repr(C, align(64))]
pub struct Entry {
    pub offset: Stamp,
    pub error: Stamp,
    pub as_of: Stamp,
    _pad: [u8; 16],
}

impl Entry {
    #[must_use]
    pub fn new(offset: Stamp, error: Stamp, as_of: Stamp) -> Self {
        // Zeroed padding keeps the on-disk bytes deterministic.
        Self { offset, error, as_of, _pad: [0; 16] }
    }

    /// Returns `true` if all three nanosecond fields are within `[0, 1e9)`.
    ///
    /// Published entries always satisfy this; a copy that does not was torn
    /// from a cold ring slot or forged by a hostile writer.
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        let in_range = |n: i64| n >= 0 && n < BILLION;
        in_range(self.offset.nanoseconds)
            && in_range(self.error.nanoseconds)
            && in_range(self.as_of.nanoseconds)
    }
}

const HEADER_LEN: usize = 128;
const MUTEX_OFFSET: usize = 48;
const HEADER_PAD: usize = HEADER_LEN - MUTEX_OFFSET - mem::size_of::<libc::pthread_mutex_t>();

/// In-memory image of the timedata page.
///
/// Lives inside a `MAP_SHARED` mapping and is accessed concurrently from
/// multiple processes; every access goes through the atomic fields or the
/// `UnsafeCell`s below, following the protocol in the module docs.
#[repr(C)]
pub(crate) struct TimeData {
    magic: [AtomicU32; MAGIC_LEN / 4],
    index: AtomicI32,
    era: [AtomicU32; ERA_LEN / 4],
    real_offset: UnsafeCell<Stamp>,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    _pad: [u8; HEADER_PAD],
    entries: [UnsafeCell<Entry>; NUM_ENTRIES],
}

// The record must fill exactly one page, with the ring at byte 128.
const _: () = assert!(mem::size_of::<TimeData>() == PAGE_SIZE);
const _: () = assert!(mem::size_of::<Entry>() == 64);
const _: () = assert!(mem::size_of::<libc::pthread_mutex_t>() <= HEADER_LEN - MUTEX_OFFSET);

// SAFETY: TimeData is designed for concurrent access across processes.
// The index and the magic/era words are atomics; the entry ring and
// real_offset are only mutated by the single writer under the publication
// protocol (and its embedded mutex), and readers validate what they copy.
unsafe impl Send for TimeData {}
unsafe impl Sync for TimeData {}

impl TimeData {
    /// Loads the magic field as bytes.
    pub(crate) fn load_magic(&self) -> [u8; MAGIC_LEN] {
        let mut out = [0u8; MAGIC_LEN];
        fence(Ordering::Acquire);
        for (i, word) in self.magic.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        out
    }

    /// Stores the magic field; the trailing release fence publishes every
    /// write made before it.
    pub(crate) fn store_magic(&self, magic: &[u8; MAGIC_LEN]) {
        for (i, word) in self.magic.iter().enumerate() {
            let value =
                u32::from_le_bytes([magic[4 * i], magic[4 * i + 1], magic[4 * i + 2], magic[4 * i + 3]]);
            word.store(value, Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    /// Loads the era field as bytes.
    pub(crate) fn load_era(&self) -> ClockEra {
        let mut out = [0u8; ERA_LEN];
        fence(Ordering::Acquire);
        for (i, word) in self.era.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        out
    }

    /// Stores the era field with a trailing release fence.
    pub(crate) fn store_era(&self, era: &ClockEra) {
        for (i, word) in self.era.iter().enumerate() {
            let value =
                u32::from_le_bytes([era[4 * i], era[4 * i + 1], era[4 * i + 2], era[4 * i + 3]]);
            word.store(value, Ordering::Relaxed);
        }
        fence(Ordering::Release);
    }

    /// Acquire-loads the ring index. Pairs with [`store_index`](Self::store_index):
    /// a reader that observes the new index also observes the entry written
    /// before it.
    #[inline]
    pub(crate) fn load_index(&self) -> i32 {
        self.index.load(Ordering::Acquire)
    }

    /// Unfenced index load for the writer's own best-effort introspection.
    #[inline]
    pub(crate) fn load_index_relaxed(&self) -> i32 {
        self.index.load(Ordering::Relaxed)
    }

    /// Release-stores the ring index, publishing the entry written before it.
    #[inline]
    pub(crate) fn store_index(&self, index: i32) {
        self.index.store(index, Ordering::Release);
    }

    /// Reads the persisted `(global - wall)` offset.
    ///
    /// Writer-side only: the field is plain memory protected by the
    /// advisory lock (open path) or the embedded mutex (updates).
    pub(crate) fn real_offset(&self) -> Stamp {
        // SAFETY: see above; readers of the file never touch this field.
        unsafe { *self.real_offset.get() }
    }

    /// Writes the persisted `(global - wall)` offset. Writer-side only.
    pub(crate) fn set_real_offset(&self, offset: Stamp) {
        // SAFETY: single writer, excluded by the advisory lock.
        unsafe { *self.real_offset.get() = offset }
    }

    /// Copies entry `index` out of the ring.
    pub(crate) fn read_entry(&self, index: usize) -> Entry {
        debug_assert!(index < NUM_ENTRIES);
        // SAFETY: index is in bounds and the slot is plain readable memory.
        // The copy can race with the writer only on a slot the writer has
        // lapped to, which takes 61 intervening publishes; callers validate
        // the copied fields rather than trusting them.
        unsafe { ptr::read(self.entries[index].get()) }
    }

    /// Writes entry `index` into the ring. Must precede the index store
    /// that publishes it. Writer-side only.
    pub(crate) fn write_entry(&self, index: usize, entry: Entry) {
        debug_assert!(index < NUM_ENTRIES);
        // SAFETY: index is in bounds; the advisory lock plus the embedded
        // mutex make this the only concurrent writer, and no prompt reader
        // touches an unpublished slot.
        unsafe { ptr::write(self.entries[index].get(), entry) }
    }

    /// Pointer to the embedded process-shared mutex storage.
    pub(crate) fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.get()
    }
}
