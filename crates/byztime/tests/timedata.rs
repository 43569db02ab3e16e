// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios over real timedata files.

use byztime::layout::PAGE_SIZE;
use byztime::{clock, Consumer, Error, Provider, Stamp, NUM_ENTRIES};
use std::fs;
use std::path::PathBuf;
use std::sync::Once;

static INSTALL: Once = Once::new();

fn install_handler() {
    INSTALL.call_once(|| byztime::install_bus_handler(None).expect("install SIGBUS handler"));
}

fn scratch() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("timedata");
    (dir, path)
}

const HUGE_ERROR: Stamp = Stamp::new(i64::MAX >> 1, 0);

#[test]
fn test_first_open_initializes_record() {
    let (_dir, path) = scratch();
    let provider = Provider::open(&path).expect("provider open");

    let bytes = fs::read(&path).expect("read file");
    assert_eq!(bytes.len(), PAGE_SIZE);
    assert_eq!(&bytes[..12], b"BYZTIME\x00\xff\xff\xff\xff");
    assert_eq!(&bytes[12..16], &[0u8; 4]);
    assert_eq!(&bytes[32..48], &[0u8; 16]);

    // The bootstrap entry is (wall - local) with an "unknown" error bound.
    let entry = provider.offset_raw();
    assert_eq!(entry.error, HUGE_ERROR);
    assert!(entry.as_of.is_normalized());

    // A fresh reader agrees with the seed.
    let mut consumer = Consumer::open(&path).expect("consumer open");
    let bounds = consumer.offset().expect("offset");
    assert_eq!(bounds.est, entry.offset);
    assert!(bounds.min <= bounds.est && bounds.est <= bounds.max);
}

#[test]
fn test_lock_file_mode_and_writer_exclusion() {
    let (_dir, path) = scratch();
    let provider = Provider::open(&path).expect("first provider");

    let lock_path = {
        let mut p = fs::canonicalize(&path).unwrap().into_os_string();
        p.push(".lock");
        p
    };
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(&lock_path).expect("lock file").permissions().mode();
    // Requested 0600; the umask can only clear bits further.
    assert_eq!(mode & 0o077, 0);

    // A second provider is locked out while the first lives...
    assert!(matches!(Provider::open(&path), Err(Error::Io(_))));

    // ...and gets in once the lock is released.
    provider.close().expect("close");
    Provider::open(&path).expect("provider after close");
}

#[test]
fn test_era_mismatch_and_reboot_reseed() {
    let (_dir, path) = scratch();

    // A freshly seeded sibling record gives us today's (wall - local)
    // offset to compare against.
    let (_dir2, other) = scratch();
    let baseline_provider = Provider::open(&other).expect("baseline provider");
    let baseline = baseline_provider.offset_raw().offset;

    Provider::open(&path).expect("provider").close().expect("close");

    // Simulate a reboot: flip an era byte and plant a 1000 s real_offset.
    let mut bytes = fs::read(&path).unwrap();
    bytes[16] ^= 0xff;
    bytes[32..40].copy_from_slice(&1000i64.to_le_bytes());
    bytes[40..48].copy_from_slice(&0i64.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    // A reader sees a valid record from the wrong boot.
    assert!(matches!(Consumer::open(&path), Err(Error::EraMismatch)));

    // The provider reseeds entry 0 from wall + real_offset - local.
    let provider = Provider::open(&path).expect("provider reopen");
    let reseeded = provider.offset_raw();
    assert_eq!(reseeded.error, HUGE_ERROR);
    let shift = reseeded.offset.try_sub(baseline).unwrap();
    assert!(
        shift >= Stamp::new(995, 0) && shift <= Stamp::new(1005, 0),
        "reseeded offset shifted by {shift}, expected about 1000s"
    );

    // And readers work again.
    Consumer::open(&path).expect("consumer after reseed");
}

#[test]
fn test_ring_rotation_wraps_index() {
    let (_dir, path) = scratch();
    let mut provider = Provider::open(&path).expect("provider");

    for k in 0..NUM_ENTRIES as i64 {
        provider
            .set_offset(Stamp::new(k, 0), Stamp::new(0, 1_000_000), None)
            .expect("publish");
    }

    // 62 publishes after the bootstrap seed wrap the index back to 0.
    let bytes = fs::read(&path).unwrap();
    assert_eq!(&bytes[12..16], &0i32.to_le_bytes());

    // Slot 0 holds the latest datum, slot 61 the one before it.
    let last = i64::from_le_bytes(bytes[128..136].try_into().unwrap());
    assert_eq!(last, NUM_ENTRIES as i64 - 1);
    let prev_slot = 128 + (NUM_ENTRIES - 1) * 64;
    let prev = i64::from_le_bytes(bytes[prev_slot..prev_slot + 8].try_into().unwrap());
    assert_eq!(prev, NUM_ENTRIES as i64 - 2);

    // A reader observes the latest entry.
    let mut consumer = Consumer::open(&path).expect("consumer");
    assert_eq!(consumer.offset().expect("offset").est, Stamp::new(NUM_ENTRIES as i64 - 1, 0));
}

#[test]
fn test_slew_clamps_published_step() {
    let (_dir, path) = scratch();
    let mut provider = Provider::open(&path).expect("provider");
    provider
        .set_offset(Stamp::new(10, 0), Stamp::new(0, 1_000_000), None)
        .expect("publish");

    let mut consumer = Consumer::open(&path).expect("consumer");
    consumer
        .slew(1_000_000_000, 1_500_000_000, Some(Stamp::new(0, 2_000_000)))
        .expect("slew");

    let first = consumer.offset().expect("offset").est;
    assert_eq!(first, Stamp::new(10, 0));

    // The daemon steps the offset by 0.8 s; almost no local time passes
    // between our two reads, so nearly the whole step is clamped away.
    provider
        .set_offset(Stamp::new(10, 800_000_000), Stamp::new(0, 1_000_000), None)
        .expect("publish");
    let second = consumer.offset().expect("offset").est;
    assert!(second >= first, "slewed estimate moved backward");
    assert!(
        second.try_sub(first).unwrap() < Stamp::new(0, 400_000_000),
        "estimate jumped by {} despite the rate cap",
        second.try_sub(first).unwrap()
    );

    // Step mode drops the clamp.
    consumer.step();
    assert_eq!(consumer.offset().expect("offset").est, Stamp::new(10, 800_000_000));
}

#[test]
fn test_slew_refused_while_error_is_large() {
    let (_dir, path) = scratch();
    let _provider = Provider::open(&path).expect("provider");

    // The bootstrap entry's error bound is astronomically wide.
    let mut consumer = Consumer::open(&path).expect("consumer");
    let refused = consumer.slew(0, i64::MAX, Some(Stamp::new(1, 0)));
    assert!(matches!(refused, Err(Error::OutOfRange)));

    // Without a tolerance, slew mode starts regardless.
    consumer.slew(0, i64::MAX, None).expect("slew without bound");
}

#[test]
fn test_truncation_is_survivable() {
    install_handler();
    let (_dir, path) = scratch();
    let mut provider = Provider::open(&path).expect("provider");
    provider
        .set_offset(Stamp::new(1, 0), Stamp::new(0, 1_000_000), None)
        .expect("publish");

    let mut consumer = Consumer::open(&path).expect("consumer");
    consumer.offset().expect("offset before truncation");

    // A malicious or buggy writer yanks the page out from under us.
    fs::OpenOptions::new().write(true).open(&path).unwrap().set_len(0).unwrap();

    assert!(matches!(consumer.offset(), Err(Error::Protocol(_))));
    // The next call fails the same way rather than corrupting anything.
    assert!(matches!(consumer.offset(), Err(Error::Protocol(_))));
    // A fresh open fails the length check before ever mapping.
    assert!(matches!(Consumer::open(&path), Err(Error::Protocol(_))));

    drop(provider);
}

#[test]
fn test_bad_magic_is_protocol_error() {
    let (_dir, path) = scratch();
    Provider::open(&path).expect("provider").close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[0] = b'X';
    fs::write(&path, &bytes).unwrap();

    assert!(matches!(Consumer::open(&path), Err(Error::Protocol(_))));
}

#[test]
fn test_hostile_index_is_protocol_error() {
    let (_dir, path) = scratch();
    Provider::open(&path).expect("provider").close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes[12..16].copy_from_slice(&1000i32.to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let mut consumer = Consumer::open(&path).expect("consumer open");
    assert!(matches!(consumer.offset(), Err(Error::Protocol(_))));
}

#[test]
fn test_denormalized_entry_is_protocol_error() {
    let (_dir, path) = scratch();
    Provider::open(&path).expect("provider").close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    // entry[0].offset.nanoseconds
    bytes[136..144].copy_from_slice(&(-1i64).to_le_bytes());
    fs::write(&path, &bytes).unwrap();

    let mut consumer = Consumer::open(&path).expect("consumer open");
    assert!(matches!(consumer.offset(), Err(Error::Protocol(_))));
}

#[test]
fn test_overflow_surfaces_from_projection() {
    let (_dir, path) = scratch();
    let mut provider = Provider::open(&path).expect("provider");
    provider.set_offset(Stamp::ZERO, Stamp::ZERO, None).expect("publish");

    let mut consumer = Consumer::open(&path).expect("consumer");
    consumer.set_drift(i64::MAX);
    assert!(matches!(consumer.offset(), Err(Error::Overflow)));

    // Back to a sane drift rate, reads work again.
    consumer.set_drift(250_000);
    consumer.offset().expect("offset");
}

#[test]
fn test_offset_quick_and_raw_track_publishes() {
    let (_dir, path) = scratch();
    let mut provider = Provider::open(&path).expect("provider");

    let as_of = Stamp::new(123, 456);
    provider
        .set_offset(Stamp::new(7, 5), Stamp::new(0, 9), Some(as_of))
        .expect("publish");

    assert_eq!(provider.offset_quick(), Stamp::new(7, 5));
    let raw = provider.offset_raw();
    assert_eq!(raw.offset, Stamp::new(7, 5));
    assert_eq!(raw.error, Stamp::new(0, 9));
    assert_eq!(raw.as_of, as_of);
}

#[test]
fn test_update_real_offset_persists_global_minus_wall() {
    let (_dir, path) = scratch();
    let mut provider = Provider::open(&path).expect("provider");

    // Publish a confident offset pinned to a known as_of.
    let local = clock::local_time().unwrap();
    let offset = Stamp::new(500, 0);
    provider.set_offset(offset, Stamp::new(0, 1000), Some(local)).expect("publish");
    provider.update_real_offset().expect("update real offset");
    provider.close().expect("close");

    let bytes = fs::read(&path).unwrap();
    let recorded = i64::from_le_bytes(bytes[32..40].try_into().unwrap());
    let wall = clock::real_time().unwrap();
    let expected = local.try_add(offset).unwrap().try_sub(wall).unwrap();
    assert!(
        (recorded - expected.seconds).abs() <= 2,
        "recorded real_offset {recorded}, expected about {}",
        expected.seconds
    );
}

#[test]
fn test_readers_observe_only_published_tuples() {
    install_handler();
    let (_dir, path) = scratch();
    let mut provider = Provider::open(&path).expect("provider");
    // Every published tuple has error == offset, so a torn offset/error
    // pair in a reader's copy would break the symmetry asserted below.
    provider.set_offset(Stamp::ZERO, Stamp::ZERO, None).expect("publish");

    let total = 4000i64;
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let mut consumer = Consumer::open(&path).expect("consumer");
                consumer.set_drift(0);
                for _ in 0..2000 {
                    let bounds = consumer.offset().expect("offset");
                    let est = bounds.est;
                    assert_eq!(bounds.max.try_sub(est).unwrap(), est);
                    assert_eq!(est.try_sub(bounds.min).unwrap(), est);
                    assert!(est >= Stamp::ZERO && est < Stamp::new(total, 0));
                    assert_eq!(est.nanoseconds, 0);
                }
            })
        })
        .collect();

    for k in 1..total {
        provider
            .set_offset(Stamp::new(k, 0), Stamp::new(k, 0), None)
            .expect("publish");
    }
    for reader in readers {
        reader.join().expect("reader thread");
    }
}
