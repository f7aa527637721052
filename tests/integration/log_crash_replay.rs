#![allow(missing_docs)]

//! Crash-recovery properties of the append log: a reader sees exactly the
//! bytes of some prefix of commits, never more.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use poda::{Log, OpenOptions as LogOptions, Result};
use tempfile::tempdir;

fn open_fresh(dir: &Path) -> Result<Log> {
    let mut log = Log::open(dir, LogOptions::default())?;
    assert!(log.at_eof()?);
    assert!(!log.next_log()?);
    log.logging_begin()?;
    Ok(log)
}

fn recover_all(dir: &Path) -> Result<Vec<u8>> {
    let mut log = Log::open(dir, LogOptions::readonly())?;
    let mut out = Vec::new();
    loop {
        let mut buf = [0u8; 256];
        let n = log.read(&mut buf)?;
        out.extend_from_slice(&buf[..n]);
        if n == 0 && !log.next_log()? {
            break;
        }
    }
    Ok(out)
}

#[test]
fn reader_sees_every_commit_and_nothing_else() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut log = open_fresh(dir.path())?;
    let mut expect = Vec::new();
    for i in 0..20u32 {
        let record = format!("record-{i};");
        log.start()?;
        log.put(record.as_bytes())?;
        log.commit()?;
        expect.extend_from_slice(record.as_bytes());
    }
    log.start()?;
    log.put(b"never committed")?;
    drop(log); // crash with an append in progress

    assert_eq!(recover_all(dir.path())?, expect);
    Ok(())
}

#[test]
fn torn_tail_rolls_back_to_previous_commit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let mut log = open_fresh(dir.path())?;
        log.start()?;
        log.put(b"first|")?;
        log.commit()?;
        log.start()?;
        log.put(b"second|")?;
        log.commit()?;
    }
    // Both commits share logical block 0, alternating between its two
    // physical slots. Chop the file to one block: only the older slot
    // survives, as if the second commit's write was torn.
    let log_file = dir.path().join("0.log");
    assert!(std::fs::metadata(&log_file).unwrap().len() >= 1024);
    OpenOptions::new()
        .write(true)
        .open(&log_file)
        .unwrap()
        .set_len(512)
        .unwrap();

    assert_eq!(recover_all(dir.path())?, b"first|");
    Ok(())
}

#[test]
fn garbage_past_the_commit_point_is_ignored() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let mut log = open_fresh(dir.path())?;
        log.start()?;
        log.put(b"solid ground")?;
        log.commit()?;
    }
    // A crashed writer can leave arbitrary bytes beyond the committed
    // blocks; their sequence hashes cannot match, so recovery stops
    // cleanly.
    let mut f = OpenOptions::new()
        .append(true)
        .open(dir.path().join("0.log"))
        .unwrap();
    f.write_all(&[0xa5u8; 512 * 3]).unwrap();
    drop(f);

    assert_eq!(recover_all(dir.path())?, b"solid ground");
    Ok(())
}

#[test]
fn appends_resume_after_recovery() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    {
        let mut log = open_fresh(dir.path())?;
        log.start()?;
        log.put(&[b'x'; 1200])?; // spans multiple blocks
        log.commit()?;
    }
    {
        let mut log = Log::open(dir.path(), LogOptions::default())?;
        let mut sink = [0u8; 512];
        while log.read(&mut sink)? > 0 {}
        assert!(!log.next_log()?);
        log.logging_begin()?;
        log.start()?;
        log.put(&[b'y'; 700])?;
        log.commit()?;
    }
    let bytes = recover_all(dir.path())?;
    assert_eq!(bytes.len(), 1900);
    assert!(bytes[..1200].iter().all(|&b| b == b'x'));
    assert!(bytes[1200..].iter().all(|&b| b == b'y'));
    Ok(())
}

#[test]
fn abort_restores_alternation_state() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut log = open_fresh(dir.path())?;
    for round in 0..5u8 {
        log.start()?;
        log.put(&[round; 100])?;
        log.commit()?;
        log.start()?;
        log.put(&[0xee; 1500])?; // moves the write cursor across blocks
        log.abort()?;
    }
    drop(log);
    let bytes = recover_all(dir.path())?;
    assert_eq!(bytes.len(), 500);
    for round in 0..5u8 {
        assert!(bytes[round as usize * 100..(round as usize + 1) * 100]
            .iter()
            .all(|&b| b == round));
    }
    Ok(())
}

#[test]
fn checkpoint_generations_replay_in_order() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut log = open_fresh(dir.path())?;
    log.start()?;
    log.put(b"gen0.")?;
    log.commit()?;
    for gen in 1..=2u32 {
        let mut ckp = log.checkpoint_begin()?;
        writeln!(ckp, "checkpoint {gen}").unwrap();
        ckp.sync_all().unwrap();
        drop(ckp);
        log.checkpoint_end()?;
        log.start()?;
        log.put(format!("gen{gen}.").as_bytes())?;
        log.commit()?;
    }
    drop(log);

    // Starting from the latest committed checkpoint sees only its log.
    assert_eq!(recover_all(dir.path())?, b"gen2.");

    // Starting explicitly from generation 0 replays everything.
    let mut log = Log::open(
        dir.path(),
        LogOptions {
            version: Some(0),
            readonly: true,
            ..Default::default()
        },
    )?;
    let mut all = Vec::new();
    loop {
        let mut buf = [0u8; 64];
        let n = log.read(&mut buf)?;
        all.extend_from_slice(&buf[..n]);
        if n == 0 && !log.next_log()? {
            break;
        }
    }
    assert_eq!(all, b"gen0.gen1.gen2.");
    Ok(())
}

#[test]
fn prune_keeps_enough_to_recover() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let mut log = open_fresh(dir.path())?;
    for gen in 1..=3u32 {
        log.start()?;
        log.put(format!("g{}", gen - 1).as_bytes())?;
        log.commit()?;
        let mut ckp = log.checkpoint_begin()?;
        write!(ckp, "state-{gen}").unwrap();
        ckp.sync_all().unwrap();
        drop(ckp);
        log.checkpoint_end()?;
    }
    log.prune(1, false, true)?;
    drop(log);

    let mut log = Log::open(dir.path(), LogOptions::readonly())?;
    assert_eq!(log.log_version(), 3);
    let mut ckpt = log.open_checkpoint()?.expect("latest checkpoint kept");
    let mut state = String::new();
    std::io::Read::read_to_string(&mut ckpt, &mut state).unwrap();
    assert_eq!(state, "state-3");
    assert!(!dir.path().join("1.ckp").exists());
    assert!(!dir.path().join("0.log").exists());
    Ok(())
}
