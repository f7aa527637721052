#![allow(missing_docs)]

//! Lease lifecycle tests: non-overlap, landlord reclamation, and the
//! deletion sweep predicate.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use poda::repos::{LocalRepository, Repository};
use poda::shortid::{self, LeaseConfig, BLOCK_SIZE};
use poda::ShortId;
use tempfile::tempdir;

fn quick_cfg() -> LeaseConfig {
    LeaseConfig {
        lease_period_secs: 1,
        landlord_sleep_min_secs: 1,
        landlord_sleep_max_secs: 1,
        landlord_worklist_size: 128,
    }
}

#[test]
fn interleaved_clients_never_hold_overlapping_blocks() {
    let dir = tempdir().expect("tmpdir");
    let repos = LocalRepository::open(dir.path(), LeaseConfig::default()).unwrap();
    let alloc = repos.allocator();

    let mut held = Vec::new();
    let mut starts = HashSet::new();
    for i in 0..24 {
        let mut block = alloc.acquire(i % 2 == 0, false).unwrap();
        assert!(
            starts.insert(block.start.0),
            "allocator reissued a held block"
        );
        if i % 3 == 0 {
            assert!(alloc.renew(&mut block).unwrap());
        }
        if i % 4 == 0 {
            alloc.release(&block, false).unwrap();
            starts.remove(&block.start.0);
        } else {
            held.push(block);
        }
    }
    // Every still-held block is disjoint from the others by start; block
    // ranges cannot overlap because starts are BLOCK_SIZE aligned.
    for block in &held {
        assert_eq!(block.start.0 % BLOCK_SIZE, 0);
    }
}

#[test]
fn landlord_reclaims_expired_blocks() {
    let dir = tempdir().expect("tmpdir");
    let repos = LocalRepository::open(dir.path(), quick_cfg()).unwrap();
    let alloc = repos.allocator();

    let expiring = alloc.acquire(true, false).unwrap();
    let local = alloc.acquire(true, true).unwrap();

    // The landlord runs on a one-second cadence; the expiring lease lasts
    // one second. Give it a few scans.
    let deadline = Instant::now() + Duration::from_secs(10);
    while alloc.holds_lease(expiring.start) {
        assert!(
            Instant::now() < deadline,
            "landlord never reclaimed the expired block"
        );
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(
        alloc.holds_lease(local.start),
        "non-expiring leases must survive the landlord"
    );
}

#[test]
fn keep_derived_deletes_exactly_the_dead_files() {
    let dir = tempdir().expect("tmpdir");
    let repos = LocalRepository::open(dir.path(), LeaseConfig::default()).unwrap();

    let (keep_a, _) = repos.create_derived().unwrap();
    let (dead, _) = repos.create_derived().unwrap();
    let (keep_b, _) = repos.create_derived().unwrap();

    // The keep file lists itself plus the two survivors.
    let (dis_sid, file) = repos.create_derived().unwrap();
    {
        use std::io::Write;
        let mut f = file;
        writeln!(f, "{dis_sid}").unwrap();
        writeln!(f, "{keep_a}").unwrap();
        writeln!(f, "{keep_b}").unwrap();
        f.sync_all().unwrap();
    }

    // Age everything past the lease horizon, then sweep.
    std::thread::sleep(Duration::from_millis(1100));
    let lease = shortid::now_secs();
    let stats = repos.keep_derived(dis_sid, lease).unwrap();
    assert_eq!(stats.deleted_count, 1);

    let exists = |sid: ShortId| shortid::short_id_path(repos.sid_dir(), sid).exists();
    assert!(exists(keep_a));
    assert!(exists(keep_b));
    assert!(exists(dis_sid));
    assert!(!exists(dead));
}

#[test]
fn sweep_is_idempotent() {
    let dir = tempdir().expect("tmpdir");
    let repos = LocalRepository::open(dir.path(), LeaseConfig::default()).unwrap();
    let (dis_sid, file) = repos.create_derived().unwrap();
    {
        use std::io::Write;
        let mut f = file;
        writeln!(f, "{dis_sid}").unwrap();
        f.sync_all().unwrap();
    }
    let (dead, _) = repos.create_derived().unwrap();
    std::thread::sleep(Duration::from_millis(1100));
    let lease = shortid::now_secs();
    let first = repos.keep_derived(dis_sid, lease).unwrap();
    assert!(first.deleted_count >= 1);
    let second = repos.keep_derived(dis_sid, lease).unwrap();
    assert_eq!(second.deleted_count, 0);
    assert!(!shortid::short_id_path(repos.sid_dir(), dead).exists());
}
