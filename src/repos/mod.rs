//! The repository seam: derived-file creation, the derived weed, and
//! repository checkpointing.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::primitives::log::{Log, LogSeq, OpenOptions, SeqReader};
use crate::shortid::{
    delete_all_short_ids_but, short_id_path, LeaseConfig, ShortIdAllocator, ShortIdBlock,
    SweepStats,
};
use crate::types::{PodaError, Result, ShortId};

/// The repository operations the weeder consumes.
pub trait Repository {
    /// Creates a new immutable derived file, returning its ShortId and an
    /// open handle for writing.
    fn create_derived(&self) -> Result<(ShortId, File)>;

    /// Opens an existing derived file for reading.
    fn open_derived(&self, sid: ShortId) -> Result<File>;

    /// Deletes every derived file not named in the keep file `dis_sid`
    /// whose change time predates `lease`.
    fn keep_derived(&self, dis_sid: ShortId, lease: u64) -> Result<SweepStats>;

    /// Checkpoints the repository's own metadata.
    fn checkpoint(&self) -> Result<()>;
}

/// A local repository: a ShortId storage tree plus the metadata log that
/// records block leases.
pub struct LocalRepository {
    sid_dir: PathBuf,
    allocator: Arc<ShortIdAllocator>,
    log: Arc<Mutex<Log>>,
    current_block: Mutex<Option<ShortIdBlock>>,
}

impl LocalRepository {
    /// Opens a repository rooted at `root`: `root/sid` holds the storage
    /// tree, `root/log` the metadata log. Lease records from the log are
    /// replayed into the allocator, and the landlord task is started.
    pub fn open(root: impl AsRef<Path>, lease_cfg: LeaseConfig) -> Result<LocalRepository> {
        let root = root.as_ref();
        let sid_dir = root.join("sid");
        let log_dir = root.join("log");
        fs::create_dir_all(&sid_dir).map_err(|e| PodaError::sys("create sid dir", e))?;
        fs::create_dir_all(&log_dir).map_err(|e| PodaError::sys("create repos log dir", e))?;

        // Replay lease records from the checkpoint and subsequent logs.
        let mut recovered = String::new();
        let mut seq = LogSeq::new(&log_dir);
        seq.open(None, false)?;
        while let Some(mut rd) = seq.next(None)? {
            read_to_string(&mut rd, &mut recovered)?;
        }
        seq.close();

        let mut log = Log::open(
            &log_dir,
            OpenOptions {
                lock: true,
                ..Default::default()
            },
        )?;
        loop {
            let mut sink = [0u8; 4096];
            while log.read(&mut sink)? > 0 {}
            if !log.next_log()? {
                break;
            }
        }
        log.logging_begin()?;
        let log = Arc::new(Mutex::new(log));

        let allocator = ShortIdAllocator::new(&sid_dir, Arc::clone(&log), lease_cfg);
        for line in recovered.lines() {
            allocator.apply_record(line)?;
        }
        allocator.start_landlord();
        info!(root = %root.display(), leases = allocator.lease_count(), "repos.open");

        Ok(LocalRepository {
            sid_dir,
            allocator,
            log,
            current_block: Mutex::new(None),
        })
    }

    pub fn allocator(&self) -> &Arc<ShortIdAllocator> {
        &self.allocator
    }

    pub fn sid_dir(&self) -> &Path {
        &self.sid_dir
    }

    /// Reads a derived keep file: one 8-digit hex ShortId per line.
    /// Returns the ids sorted ascending with duplicates removed.
    pub fn read_keep_file(&self, sid: ShortId) -> Result<Vec<ShortId>> {
        let file = self.open_derived(sid)?;
        let mut sids = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let raw = u32::from_str_radix(line, 16).map_err(|_| {
                PodaError::Repos {
                    op: "read keep file",
                    msg: format!("bad ShortId line: {line:?}"),
                }
            })?;
            sids.push(ShortId(raw));
        }
        sids.sort_unstable();
        sids.dedup();
        Ok(sids)
    }
}

impl Repository for LocalRepository {
    fn create_derived(&self) -> Result<(ShortId, File)> {
        let mut current = self.current_block.lock();
        loop {
            if let Some(block) = current.as_mut() {
                if let Some(sid) = block.assign_next_avail() {
                    let path = short_id_path(&self.sid_dir, sid);
                    fs::create_dir_all(path.parent().expect("sid paths have parents"))
                        .map_err(|e| PodaError::sys("create sid block dir", e))?;
                    let file = File::create(&path)
                        .map_err(|e| PodaError::sys("create derived file", e))?;
                    debug!(sid = %sid, "repos.create_derived");
                    return Ok((sid, file));
                }
                // Block exhausted; hand it back before probing for another.
                self.allocator.release(block, true)?;
                *current = None;
            }
            *current = Some(self.allocator.acquire(true, true)?);
        }
    }

    fn open_derived(&self, sid: ShortId) -> Result<File> {
        File::open(short_id_path(&self.sid_dir, sid)).map_err(|e| PodaError::Repos {
            op: "open derived",
            msg: format!("{sid}: {e}"),
        })
    }

    fn keep_derived(&self, dis_sid: ShortId, lease: u64) -> Result<SweepStats> {
        let keep = self.read_keep_file(dis_sid)?;
        // The record of deletions is itself a derived file; being brand
        // new it always survives the sweep it documents.
        let (deleted_sid, deleted_file) = self.create_derived()?;
        let mut deleted_out = std::io::BufWriter::new(deleted_file);
        let stats = delete_all_short_ids_but(&self.sid_dir, &keep, lease, &mut deleted_out)?;
        let mut deleted_file = deleted_out
            .into_inner()
            .map_err(|e| PodaError::sys("flush deleted list", e.into_error()))?;
        deleted_file.flush()?;
        deleted_file.sync_all()?;
        info!(
            kept = keep.len(),
            deleted = stats.deleted_count,
            space = stats.deleted_space,
            list = %deleted_sid,
            "repos.keep_derived"
        );
        Ok(stats)
    }

    fn checkpoint(&self) -> Result<()> {
        let mut log = self.log.lock();
        let mut ckp = log.checkpoint_begin()?;
        self.allocator.checkpoint(&mut ckp)?;
        ckp.sync_all()?;
        drop(ckp);
        log.checkpoint_end()?;
        log.prune(2, false, true)?;
        debug!(version = log.log_version(), "repos.checkpoint");
        Ok(())
    }
}

fn read_to_string(rd: &mut SeqReader<'_>, out: &mut String) -> Result<()> {
    let mut bytes = Vec::new();
    match rd {
        SeqReader::Ckpt(r) => {
            std::io::Read::read_to_end(r, &mut bytes)?;
        }
        SeqReader::Log(log) => {
            let mut buf = [0u8; 1024];
            loop {
                let n = log.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                bytes.extend_from_slice(&buf[..n]);
            }
        }
    }
    out.push_str(&String::from_utf8_lossy(&bytes));
    Ok(())
}
