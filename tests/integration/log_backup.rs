#![allow(missing_docs)]

//! On-line backup semantics: a block counts for recovery only when the
//! primary and backup copies agree on its header.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use poda::{Log, OpenOptions as LogOptions, Result};
use tempfile::tempdir;

fn backup_options(backup: &Path) -> LogOptions {
    LogOptions {
        backup_dir: Some(backup.to_path_buf()),
        ..Default::default()
    }
}

fn open_fresh(primary: &Path, backup: &Path) -> Result<Log> {
    let mut log = Log::open(primary, backup_options(backup))?;
    assert!(log.at_eof()?);
    assert!(!log.next_log()?);
    log.logging_begin()?;
    Ok(log)
}

fn recover(primary: &Path, backup: Option<&Path>) -> Result<Vec<u8>> {
    let opts = match backup {
        Some(b) => LogOptions {
            backup_dir: Some(b.to_path_buf()),
            ..Default::default()
        },
        None => LogOptions::default(),
    };
    let mut log = Log::open(primary, opts)?;
    let mut out = Vec::new();
    loop {
        let mut buf = [0u8; 128];
        let n = log.read(&mut buf)?;
        out.extend_from_slice(&buf[..n]);
        if n == 0 && !log.next_log()? {
            break;
        }
    }
    Ok(out)
}

#[test]
fn backup_receives_every_commit() -> Result<()> {
    let primary = tempdir().expect("tmpdir");
    let backup = tempdir().expect("tmpdir");
    {
        let mut log = open_fresh(primary.path(), backup.path())?;
        log.start()?;
        log.put(b"mirrored bytes")?;
        log.commit()?;
    }
    // The backup alone recovers the same content.
    assert_eq!(recover(backup.path(), None)?, b"mirrored bytes");
    assert_eq!(
        recover(primary.path(), Some(backup.path()))?,
        b"mirrored bytes"
    );
    Ok(())
}

#[test]
fn disagreeing_block_ends_recovery() -> Result<()> {
    let primary = tempdir().expect("tmpdir");
    let backup = tempdir().expect("tmpdir");
    {
        let mut log = open_fresh(primary.path(), backup.path())?;
        log.start()?;
        log.put(b"one|")?;
        log.commit()?;
        log.start()?;
        log.put(b"two|")?;
        log.commit()?;
    }
    // Corrupt the backup copy of the second commit's slot, as if the
    // crash hit between the two writes of that commit.
    let path = backup.path().join("0.log");
    let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(512)).unwrap();
    let mut hdr = [0u8; 6];
    f.read_exact(&mut hdr).unwrap();
    hdr[5] ^= 0xff;
    f.seek(SeekFrom::Start(512)).unwrap();
    f.write_all(&hdr).unwrap();
    f.sync_all().unwrap();
    drop(f);

    // Paired recovery rolls back to the first commit; the primary alone
    // still has both.
    assert_eq!(recover(primary.path(), Some(backup.path()))?, b"one|");
    assert_eq!(recover(primary.path(), None)?, b"one|two|");
    Ok(())
}

#[test]
fn shorter_backup_truncates_recovery() -> Result<()> {
    let primary = tempdir().expect("tmpdir");
    let backup = tempdir().expect("tmpdir");
    {
        let mut log = open_fresh(primary.path(), backup.path())?;
        log.start()?;
        log.put(&[b'a'; 600])?; // occupies two logical blocks
        log.commit()?;
    }
    // Drop the backup's copy of the last block.
    let path = backup.path().join("0.log");
    let len = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 512)
        .unwrap();

    let paired = recover(primary.path(), Some(backup.path()))?;
    assert!(paired.len() < 600, "paired recovery must stop early");
    let solo = recover(primary.path(), None)?;
    assert_eq!(solo.len(), 600);
    Ok(())
}

#[test]
fn backed_up_checkpoints_land_in_both_directories() -> Result<()> {
    let primary = tempdir().expect("tmpdir");
    let backup = tempdir().expect("tmpdir");
    let mut opts = backup_options(backup.path());
    opts.backup_checkpoints = true;
    let mut log = Log::open(primary.path(), opts)?;
    assert!(log.at_eof()?);
    assert!(!log.next_log()?);
    log.logging_begin()?;
    log.start()?;
    log.put(b"data")?;
    log.commit()?;
    let mut ckp = log.checkpoint_begin()?;
    ckp.write_all(b"SNAP").unwrap();
    ckp.sync_all().unwrap();
    drop(ckp);
    log.checkpoint_end()?;
    drop(log);

    for dir in [primary.path(), backup.path()] {
        assert_eq!(std::fs::read(dir.join("1.ckp")).unwrap(), b"SNAP");
        assert_eq!(
            std::fs::read_to_string(dir.join("version")).unwrap().trim(),
            "1"
        );
    }
    Ok(())
}
