//! Atomic append log with block-level commit, checkpointing, and optional
//! synchronous on-line backup.
//!
//! The log is a persistent bytestream with atomic append. After `start`, a
//! client tentatively appends bytes and then either `commit`s (atomically
//! making the append permanent) or `abort`s (returning the log to its state
//! at the previous commit). A crash cleanly aborts any append in progress.
//! `start` nests: bytes are committed only when the outermost `commit`
//! runs; one `abort` cancels all pending starts.
//!
//! A log directory contains `version` (highest committed checkpoint),
//! `pruned` (highest pruned checkpoint), `lock` (advisory lock target),
//! and for each generation `N` a `N.log` file plus at most one `N.ckp`
//! checkpoint. Generation 0 has no checkpoint. A `N.ckp` with
//! `N <= version` is committed; later ones must be ignored.
//!
//! Each log file is a sequence of 512-byte blocks carrying a big-endian
//! header `(seq, len, ver)`: `seq` is a multiplicative hash of the block's
//! logical sequence number, `len` the offset just past the last committed
//! record byte in the block (0 if no record ends here) in the low 14 bits,
//! and `ver` a 2-bit rotating counter in the top bits. Every logical block
//! has two candidate physical slots; writes alternate between them so a
//! torn write can never destroy the last committed state. Recovery reads
//! blocks in order, keeping one out-of-order block in a "pocket", and
//! stops at the first gap; with a backup directory a block only counts if
//! both copies agree on the full header.
//!
//! The log performs no locking of its own state; exactly one client thread
//! may use a `Log` value at a time, which the borrow checker enforces. The
//! `lock` option takes an advisory file lock so separate processes
//! cooperate too.

pub mod seq;

pub use seq::{CkptReader, LogSeq, RecordSource, SeqReader};

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File, OpenOptions as FsOpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::primitives::io::{advisory_lock, FileIo, StdFileIo};
use crate::types::{PodaError, Result};

pub(crate) const DISK_BLOCK_SIZE: usize = 512;
const BLOCK_HDR_BYTES: usize = 6;
pub(crate) const BLOCK_PAYLOAD: usize = DISK_BLOCK_SIZE - BLOCK_HDR_BYTES;
const LEN_MASK: u16 = 0x3fff;
const UNUSED_PHY: u64 = u64::MAX;

const VERSION_FILE: &str = "version";
const NEW_VERSION_FILE: &str = "version.new";
const PRUNED_FILE: &str = "pruned";
const NEW_PRUNED_FILE: &str = "pruned.new";
const LOCK_FILE: &str = "lock";
const LOG_EXT: &str = "log";
const CKP_EXT: &str = "ckp";

#[inline]
fn hash_seq(seq: u32) -> u32 {
    seq.wrapping_add(12345).wrapping_mul(715_827_881)
}

/// One 512-byte on-disk block: 6-byte header plus payload.
struct BlockData(Box<[u8; DISK_BLOCK_SIZE]>);

impl BlockData {
    fn new() -> Self {
        BlockData(Box::new([0u8; DISK_BLOCK_SIZE]))
    }

    fn seq(&self) -> u32 {
        u32::from_be_bytes(self.0[0..4].try_into().expect("header slice"))
    }

    fn set_seq(&mut self, seq: u32) {
        self.0[0..4].copy_from_slice(&seq.to_be_bytes());
    }

    fn len_ver(&self) -> u16 {
        u16::from_be_bytes(self.0[4..6].try_into().expect("header slice"))
    }

    fn set_len_ver(&mut self, raw: u16) {
        self.0[4..6].copy_from_slice(&raw.to_be_bytes());
    }

    fn len_field(&self) -> u16 {
        self.len_ver() & LEN_MASK
    }

    fn set_len_field(&mut self, len: u16) {
        self.set_len_ver((len & LEN_MASK) | (self.ver() << 14));
    }

    fn ver(&self) -> u16 {
        self.len_ver() >> 14
    }

    fn set_ver(&mut self, ver: u16) {
        self.set_len_ver(self.len_field() | ((ver & 0x3) << 14));
    }

    fn payload(&self) -> &[u8] {
        &self.0[BLOCK_HDR_BYTES..]
    }

    fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.0[BLOCK_HDR_BYTES..]
    }

    fn raw(&self) -> &[u8] {
        &self.0[..]
    }

    fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }

    /// Overwrites the header with the sentinel no valid block can carry.
    fn invalidate(&mut self) {
        self.set_seq(hash_seq(0xffff_ffff));
        self.set_len_ver(0xffff);
    }
}

/// A block together with its two candidate physical addresses.
struct Block {
    /// "Physical" block number (address in file).
    phy: u64,
    /// Reading: phy of the block left in pocket after this one sequenced.
    /// Writing: phy of the unused slot in the two-slot pair.
    pocket_phy: u64,
    /// Reading: the bytes beyond `len` are known committed.
    tail_committed: bool,
    data: BlockData,
}

impl Block {
    fn fresh(phy: u64) -> Self {
        Block {
            phy,
            pocket_phy: UNUSED_PHY,
            tail_committed: false,
            data: BlockData::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Recovering,
    Recovered,
    Ready,
    Logging,
    Bad,
}

/// Options accepted by [`Log::open`].
#[derive(Clone, Debug, Default)]
pub struct OpenOptions {
    /// Checkpoint version to start recovery at; `None` means the highest
    /// committed checkpoint (or 0 if there is none).
    pub version: Option<u32>,
    /// Open for read-only access.
    pub readonly: bool,
    /// Take an advisory lock on the `lock` file (read lock if readonly).
    pub lock: bool,
    /// Write a synchronous backup of the log into this directory.
    pub backup_dir: Option<PathBuf>,
    /// Also copy committed checkpoints into the backup directory.
    pub backup_checkpoints: bool,
}

impl OpenOptions {
    pub fn readonly() -> Self {
        OpenOptions {
            readonly: true,
            ..Default::default()
        }
    }
}

/// Crash-safe append log over one or two directories.
pub struct Log {
    dir: PathBuf,
    backup_dir: Option<PathBuf>,
    backup_checkpoints: bool,
    readonly: bool,
    state: State,
    checkpointing: bool,
    hit_eof: bool,
    use_pocket: bool,
    comm_use_pocket: bool,
    nesting: u32,
    version: u32,
    cc_version: u32,
    cc_version2: u32,
    file: StdFileIo,
    file2: Option<StdFileIo>,
    _lock_file: Option<File>,
    _lock_file2: Option<File>,
    cur_seq: u32,
    cur_len: usize,
    next_seq: u32,
    next_phy: u64,
    comm_seq: u32,
    comm_phy: u64,
    comm_pocket_phy: u64,
    cur: VecDeque<Block>,
    pocket: Option<Block>,
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log")
            .field("dir", &self.dir)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("checkpointing", &self.checkpointing)
            .finish()
    }
}

fn gen_path(dir: &Path, ver: u32, ext: &str) -> PathBuf {
    dir.join(format!("{ver}.{ext}"))
}

fn read_version_file(dir: &Path) -> Result<u32> {
    match fs::read_to_string(dir.join(VERSION_FILE)) {
        Ok(text) => text
            .trim()
            .parse::<u32>()
            .map_err(|_| PodaError::Corruption(format!("unparsable version file in {}", dir.display()))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(PodaError::sys("read version file", err)),
    }
}

fn write_version_file(dir: &Path, ver: u32) -> Result<()> {
    let tmp = dir.join(NEW_VERSION_FILE);
    let mut f = File::create(&tmp).map_err(|e| PodaError::sys("create version.new", e))?;
    writeln!(f, "{ver}").map_err(|e| PodaError::sys("write version.new", e))?;
    f.sync_all().map_err(|e| PodaError::sys("fsync version.new", e))?;
    drop(f);
    fs::rename(&tmp, dir.join(VERSION_FILE)).map_err(|e| PodaError::sys("rename version.new", e))?;
    Ok(())
}

fn take_lock(dir: &Path, readonly: bool) -> Result<File> {
    let path = dir.join(LOCK_FILE);
    let file = FsOpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| PodaError::sys("open lock file", e))?;
    advisory_lock(&file, !readonly).map_err(|_| {
        PodaError::InvalidOwned(format!("lock conflict on {}", path.display()))
    })?;
    Ok(file)
}

impl Log {
    /// Opens a log directory and positions for recovery.
    pub fn open(dir: impl AsRef<Path>, opts: OpenOptions) -> Result<Log> {
        let dir = dir.as_ref().to_path_buf();
        if opts.backup_checkpoints && opts.backup_dir.is_none() {
            return Err(PodaError::Invalid(
                "backup_checkpoints requires a backup directory",
            ));
        }

        let lock_file = if opts.lock {
            Some(take_lock(&dir, opts.readonly)?)
        } else {
            None
        };
        let lock_file2 = match (&opts.backup_dir, opts.lock) {
            (Some(bdir), true) => Some(take_lock(bdir, opts.readonly)?),
            _ => None,
        };

        let cc_version = read_version_file(&dir)?;
        let cc_version2 = match &opts.backup_dir {
            Some(bdir) => read_version_file(bdir)?,
            None => 0,
        };
        let version = opts.version.unwrap_or(cc_version);
        if version > cc_version {
            return Err(PodaError::Invalid(
                "requested version beyond last committed checkpoint",
            ));
        }

        let log_path = gen_path(&dir, version, LOG_EXT);
        let file = if opts.readonly {
            StdFileIo::open_readonly(&log_path)
                .or_else(|e| {
                    // The 0th log may legitimately not exist yet.
                    if version == 0 {
                        StdFileIo::open(&log_path)
                    } else {
                        Err(e)
                    }
                })
                .map_err(|e| annotate_open(e, &log_path))?
        } else if version == 0 {
            StdFileIo::open(&log_path).map_err(|e| annotate_open(e, &log_path))?
        } else {
            open_rw_existing(&log_path)?
        };

        let file2 = match &opts.backup_dir {
            Some(bdir) => {
                let primary_empty = file.len()? == 0;
                let bpath = gen_path(bdir, version, LOG_EXT);
                Some(if primary_empty {
                    open_rw_truncate(&bpath)?
                } else {
                    open_rw_existing(&bpath)?
                })
            }
            None => None,
        };

        debug!(dir = %dir.display(), version, cc_version, readonly = opts.readonly, "log.open");

        Ok(Log {
            dir,
            backup_dir: opts.backup_dir,
            backup_checkpoints: opts.backup_checkpoints,
            readonly: opts.readonly,
            state: State::Recovering,
            checkpointing: false,
            hit_eof: false,
            use_pocket: false,
            comm_use_pocket: false,
            nesting: 0,
            version,
            cc_version,
            cc_version2,
            file,
            file2,
            _lock_file: lock_file,
            _lock_file2: lock_file2,
            cur_seq: 0,
            cur_len: 0,
            next_seq: 0,
            next_phy: 0,
            comm_seq: 0,
            comm_phy: 0,
            comm_pocket_phy: 0,
            cur: VecDeque::new(),
            pocket: None,
        })
    }

    /// The version of the log file currently open (and, while
    /// checkpointing, of the checkpoint being written).
    pub fn log_version(&self) -> u32 {
        debug_assert!(self.state != State::Bad);
        self.version
    }

    /// Opens for reading the checkpoint this log generation starts from;
    /// `None` when generation 0 is current.
    pub fn open_checkpoint(&mut self) -> Result<Option<File>> {
        self.expect_state(State::Recovering)?;
        if self.version == 0 {
            return Ok(None);
        }
        let path = gen_path(&self.dir, self.version, CKP_EXT);
        match File::open(&path) {
            Ok(f) => Ok(Some(f)),
            Err(e) => {
                self.state = State::Bad;
                Err(annotate_open(PodaError::from(e), &path))
            }
        }
    }

    fn expect_state(&mut self, want: State) -> Result<()> {
        if self.state != want {
            let found = self.state;
            self.state = State::Bad;
            return Err(PodaError::InvalidOwned(format!(
                "log operation requires {want:?} state, found {found:?}"
            )));
        }
        Ok(())
    }

    fn bad<T>(&mut self, err: PodaError) -> Result<T> {
        self.state = State::Bad;
        Err(err)
    }

    /// Reads the next 512-byte block pair, returning `None` at end of
    /// recoverable data. With a backup, a block counts only when both
    /// copies agree on the full header; a disagreement reads as the
    /// invalid sentinel so recovery ends at that logical block.
    fn read_block(&mut self) -> Result<Option<BlockData>> {
        let off = self.next_phy * DISK_BLOCK_SIZE as u64;
        let mut data = BlockData::new();
        let n = match self.file.read_at_len(off, data.raw_mut()) {
            Ok(n) => n,
            Err(e) => return self.bad(e),
        };
        let mut primary = if n < DISK_BLOCK_SIZE { None } else { Some(data) };

        let Some(file2) = &self.file2 else {
            if primary.is_none() {
                self.hit_eof = true;
            }
            return Ok(primary);
        };

        let mut data2 = BlockData::new();
        let n2 = match file2.read_at_len(off, data2.raw_mut()) {
            Ok(n2) => n2,
            Err(e) => return self.bad(e),
        };
        let backup = if n2 < DISK_BLOCK_SIZE { None } else { Some(data2) };

        let invalidate;
        match (&mut primary, backup) {
            (None, None) => {
                self.hit_eof = true;
                return Ok(None);
            }
            (None, Some(b)) => {
                primary = Some(b);
                invalidate = true;
            }
            (Some(_), None) => invalidate = true,
            (Some(a), Some(b)) => {
                invalidate = a.seq() != b.seq() || a.len_ver() != b.len_ver();
            }
        }
        let mut block = primary.expect("primary set above");
        if invalidate {
            block.invalidate();
        }
        Ok(Some(block))
    }

    /// Extends the chain of sequenced blocks by one, consulting the
    /// pocket. Returns false at end of log.
    fn extend_cur(&mut self) -> Result<bool> {
        let mut incoming: Option<Block> = None;
        if !self.hit_eof {
            if let Some(data) = self.read_block()? {
                let mut b = Block::fresh(self.next_phy);
                b.data = data;
                self.next_phy += 1;
                incoming = Some(b);
            } else {
                self.hit_eof = true;
            }
        }
        let want = hash_seq(self.next_seq);

        let chosen = match (incoming, self.pocket.take()) {
            (None, None) => return Ok(false),
            (None, Some(p)) => {
                if p.data.seq() != want {
                    self.pocket = Some(p);
                    return Ok(false);
                }
                let mut b = p;
                b.pocket_phy = self.next_phy;
                b
            }
            (Some(mut b), None) => {
                if b.data.seq() != want {
                    // Forget we read this block.
                    self.next_phy -= 1;
                    self.hit_eof = true;
                    return Ok(false);
                }
                b.pocket_phy = self.next_phy;
                b
            }
            (Some(mut b), Some(mut p)) => {
                if b.data.seq() == want {
                    if p.data.seq() == want && p.data.ver() == (b.data.ver() + 1) % 4 {
                        // Pocket copy is the newer version; swap.
                        std::mem::swap(&mut b, &mut p);
                    }
                } else if p.data.seq() == want {
                    std::mem::swap(&mut b, &mut p);
                } else {
                    // Neither is the block we need.
                    self.pocket = Some(p);
                    self.next_phy -= 1;
                    self.hit_eof = true;
                    return Ok(false);
                }
                b.pocket_phy = p.phy;
                self.pocket = Some(p);
                b
            }
        };
        self.cur.push_back(chosen);
        self.next_seq += 1;
        Ok(true)
    }

    /// Makes committed bytes available at the read cursor. Returns false
    /// at end of log.
    fn make_bytes_avail(&mut self) -> Result<bool> {
        if self.pocket.is_none() && !self.hit_eof {
            if let Some(data) = self.read_block()? {
                let mut b = Block::fresh(self.next_phy);
                b.data = data;
                self.next_phy += 1;
                self.pocket = Some(b);
            } else {
                self.hit_eof = true;
            }
        }

        if self.cur.front().is_some() && self.cur_len >= BLOCK_PAYLOAD {
            let done = self.cur.pop_front().expect("nonempty");
            if done.tail_committed {
                if let Some(next) = self.cur.front_mut() {
                    if next.data.len_field() == 0 {
                        next.tail_committed = true;
                    }
                }
            }
            self.cur_seq += 1;
            self.cur_len = 0;
        }

        if self.cur.is_empty() && !self.extend_cur()? {
            return Ok(false);
        }

        let (tail_committed, len_field) = {
            let front = self.cur.front().expect("nonempty");
            (front.tail_committed, front.data.len_field() as usize)
        };
        if !tail_committed && self.cur_len >= len_field {
            // Look ahead until a block with a record end proves these
            // bytes committed.
            let mut i = 0;
            loop {
                i += 1;
                if i >= self.cur.len() && !self.extend_cur()? {
                    return Ok(false);
                }
                if self.cur[i].data.len_field() != 0 {
                    break;
                }
            }
            self.cur.front_mut().expect("nonempty").tail_committed = true;
        }
        Ok(true)
    }

    /// Reads up to `buf.len()` committed bytes; a short count means the
    /// current log file ended.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.expect_state(State::Recovering)?;
        let mut count = 0;
        while count < buf.len() {
            if !self.make_bytes_avail()? {
                break;
            }
            let cur_len = self.cur_len;
            let front = self.cur.front().expect("nonempty");
            let limit = if front.tail_committed {
                BLOCK_PAYLOAD
            } else {
                (front.data.len_field() as usize).min(BLOCK_PAYLOAD)
            };
            if cur_len >= limit {
                // No committed bytes in this block right now.
                break;
            }
            let n = (limit - cur_len).min(buf.len() - count);
            buf[count..count + n].copy_from_slice(&front.data.payload()[cur_len..cur_len + n]);
            self.cur_len += n;
            count += n;
        }
        Ok(count)
    }

    /// Reads exactly `buf.len()` bytes; running off the end of the log is
    /// corruption.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.read(buf)?;
        if n < buf.len() {
            return self.bad(PodaError::Corruption(
                "log ended in the middle of a record".into(),
            ));
        }
        Ok(())
    }

    /// True when the current log file has no more committed bytes.
    pub fn at_eof(&mut self) -> Result<bool> {
        self.expect_state(State::Recovering)?;
        Ok(!self.make_bytes_avail()?)
    }

    /// Begins reading from the next log generation, if one exists. On
    /// false the log enters the recovered state.
    pub fn next_log(&mut self) -> Result<bool> {
        self.expect_state(State::Recovering)?;
        debug_assert!(self.hit_eof);

        let path = gen_path(&self.dir, self.version + 1, LOG_EXT);
        let file = if self.readonly {
            StdFileIo::open_readonly(&path)
        } else {
            open_rw_existing(&path)
        };
        let file = match file {
            Ok(f) => f,
            Err(PodaError::Io(e)) | Err(PodaError::Sys { source: e, .. })
                if e.kind() == io::ErrorKind::NotFound =>
            {
                self.state = State::Recovered;
                return Ok(false);
            }
            Err(e) => return self.bad(e),
        };

        let file2 = match &self.backup_dir {
            Some(bdir) => {
                let primary_empty = file.len()? == 0;
                let bpath = gen_path(bdir, self.version + 1, LOG_EXT);
                Some(if primary_empty {
                    open_rw_truncate(&bpath)?
                } else {
                    open_rw_existing(&bpath)?
                })
            }
            None => None,
        };

        self.file = file;
        self.file2 = file2;
        self.version += 1;
        self.reset_read_state();
        Ok(true)
    }

    fn reset_read_state(&mut self) {
        self.cur_seq = 0;
        self.cur_len = 0;
        self.next_seq = 0;
        self.next_phy = 0;
        self.hit_eof = false;
        self.use_pocket = false;
        self.comm_use_pocket = false;
        self.comm_seq = 0;
        self.comm_phy = 0;
        self.comm_pocket_phy = 0;
        self.cur.clear();
        self.pocket = None;
        self.nesting = 0;
    }

    /// Transitions from recovered to ready for appending. Establishes the
    /// two-slot invariant for the current logical block and erases any
    /// stale uncommitted blocks beyond it.
    pub fn logging_begin(&mut self) -> Result<()> {
        self.expect_state(State::Recovered)?;
        debug_assert!(self.hit_eof);
        if self.readonly {
            return self.bad(PodaError::Invalid("logging_begin on read-only log"));
        }

        if self.cur_len > 0 {
            // The current logical block is partially on disk and the head
            // of the chain is a copy of its latest version.
            let front = self.cur.front_mut().expect("partial block present");
            debug_assert!(front.pocket_phy != UNUSED_PHY);
            if front.pocket_phy >= front.phy {
                std::mem::swap(&mut front.phy, &mut front.pocket_phy);
                self.use_pocket = false; // pocket_phy is now where the block came from
            } else {
                self.use_pocket = true; // phy is still where the block came from
            }
        } else {
            // The current logical block is empty; any head block holds
            // uncommitted data.
            if self.cur.is_empty() {
                let mut b = Block::fresh(0);
                if let Some(p) = &self.pocket {
                    b.pocket_phy = p.phy;
                    b.phy = self.next_phy;
                } else {
                    b.pocket_phy = self.next_phy;
                    b.phy = self.next_phy + 1;
                }
                self.cur.push_front(b);
            } else {
                let front = self.cur.front_mut().expect("nonempty");
                debug_assert!(front.pocket_phy != UNUSED_PHY);
                if front.pocket_phy >= front.phy {
                    std::mem::swap(&mut front.phy, &mut front.pocket_phy);
                }
            }
            self.use_pocket = true; // always use the lower slot first
            let seq = hash_seq(self.cur_seq);
            let front = self.cur.front_mut().expect("nonempty");
            front.data.set_seq(seq);
            front.data.set_len_field(0);
        }
        {
            let front = self.cur.front().expect("nonempty");
            debug_assert!(front.pocket_phy < front.phy);
        }

        self.erase_uncommitted(true)?;
        if self.file2.is_some() {
            self.erase_uncommitted(false)?;
        }

        self.cur.truncate(1);
        self.pocket = None;

        let front = self.cur.front().expect("nonempty");
        self.comm_seq = self.cur_seq;
        self.comm_phy = front.phy;
        self.comm_pocket_phy = front.pocket_phy;
        self.comm_use_pocket = self.use_pocket;
        self.state = State::Ready;
        debug!(version = self.version, "log.logging_begin");
        Ok(())
    }

    /// Overwrites every physical block past the current commit point with
    /// the invalid sentinel, so stale data from a write in progress at
    /// crash time can never look committed after the log advances.
    fn erase_uncommitted(&mut self, primary: bool) -> Result<()> {
        let mut inval = BlockData::new();
        inval.invalidate();
        let file = if primary {
            self.file.clone()
        } else {
            self.file2.clone().expect("backup file present")
        };
        let size = match file.len() {
            Ok(s) => s,
            Err(e) => return self.bad(e),
        };
        let front = self.cur.front().expect("current block present");
        let clear_start =
            (front.phy + if self.use_pocket { 1 } else { 0 }) * DISK_BLOCK_SIZE as u64;
        let pocket_off = front.pocket_phy * DISK_BLOCK_SIZE as u64;
        if self.use_pocket && pocket_off < clear_start {
            if let Err(e) = file.write_at(pocket_off, inval.raw()) {
                return self.bad(e);
            }
        }
        let mut off = clear_start;
        while off < size {
            if let Err(e) = file.write_at(off, inval.raw()) {
                return self.bad(e);
            }
            off += DISK_BLOCK_SIZE as u64;
        }
        if let Err(e) = file.sync_all() {
            return self.bad(e);
        }
        Ok(())
    }

    /// Starts a record, or increments the nesting level of starts.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            State::Ready => {
                self.nesting = 1;
                self.state = State::Logging;
                Ok(())
            }
            State::Logging => {
                self.nesting += 1;
                Ok(())
            }
            _ => self.bad(PodaError::Invalid("start outside ready/logging state")),
        }
    }

    /// The nesting level of starts.
    pub fn nesting(&self) -> u32 {
        self.nesting
    }

    fn write_cur(&mut self) -> Result<()> {
        let (addr, ver) = {
            let front = self.cur.front().expect("current block present");
            let slot = if self.use_pocket {
                front.pocket_phy
            } else {
                front.phy
            };
            (slot * DISK_BLOCK_SIZE as u64, (front.data.ver() + 1) & 3)
        };
        self.cur.front_mut().expect("nonempty").data.set_ver(ver);
        let front = self.cur.front().expect("nonempty");
        if let Err(e) = self.file.write_at(addr, front.data.raw()) {
            return self.bad(e);
        }
        if let Some(file2) = &self.file2 {
            if let Err(e) = file2.write_at(addr, front.data.raw()) {
                return self.bad(e);
            }
        }
        Ok(())
    }

    fn make_space_avail(&mut self) -> Result<()> {
        debug_assert!(self.cur_len >= BLOCK_PAYLOAD);
        self.write_cur()?;

        self.cur_seq += 1;
        self.cur_len = 0;
        let comm_slot = if self.comm_use_pocket {
            self.comm_phy
        } else {
            self.comm_pocket_phy
        };
        let seq = hash_seq(self.cur_seq);
        let front = self.cur.front_mut().expect("current block present");
        if self.use_pocket {
            // write_cur used pocket_phy; phy is still free.
            front.pocket_phy = front.phy;
            front.phy += 1;
        } else {
            // write_cur used phy; pocket_phy is still free.
            front.phy += 1;
        }
        // Never overwrite the slot holding the previous stable commit.
        self.use_pocket = front.pocket_phy != comm_slot;
        front.data.set_seq(seq);
        front.data.set_len_field(0);
        front.data.set_ver(0);
        Ok(())
    }

    /// Appends bytes to the record in progress.
    pub fn put(&mut self, mut src: &[u8]) -> Result<()> {
        self.expect_state(State::Logging)?;
        while !src.is_empty() {
            if self.cur_len >= BLOCK_PAYLOAD {
                self.make_space_avail()?;
            }
            let cur_len = self.cur_len;
            let n = (BLOCK_PAYLOAD - cur_len).min(src.len());
            let front = self.cur.front_mut().expect("current block present");
            front.data.payload_mut()[cur_len..cur_len + n].copy_from_slice(&src[..n]);
            self.cur_len += n;
            src = &src[n..];
        }
        Ok(())
    }

    /// Commits the current record once the outermost start is matched.
    /// Only the outermost commit writes and syncs.
    pub fn commit(&mut self) -> Result<()> {
        self.expect_state(State::Logging)?;
        self.nesting -= 1;
        if self.nesting > 0 {
            return Ok(());
        }

        let len = self.cur_len as u16;
        self.cur
            .front_mut()
            .expect("current block present")
            .data
            .set_len_field(len);
        self.write_cur()?;
        self.use_pocket = !self.use_pocket;
        if let Err(e) = self.file.sync_all() {
            return self.bad(e);
        }
        if let Some(file2) = &self.file2 {
            if let Err(e) = file2.sync_all() {
                return self.bad(e);
            }
        }

        let front = self.cur.front().expect("nonempty");
        self.comm_seq = self.cur_seq;
        self.comm_phy = front.phy;
        self.comm_pocket_phy = front.pocket_phy;
        self.comm_use_pocket = self.use_pocket;
        self.state = State::Ready;
        Ok(())
    }

    /// Aborts the record in progress, restoring exactly the state saved at
    /// the previous commit, and satisfies all pending starts.
    pub fn abort(&mut self) -> Result<()> {
        self.expect_state(State::Logging)?;

        if self.cur_seq != self.comm_seq {
            // The buffer has moved past the committed block; read it back.
            let slot = if self.comm_use_pocket {
                self.comm_phy
            } else {
                self.comm_pocket_phy
            };
            let addr = slot * DISK_BLOCK_SIZE as u64;
            let comm_seq = self.comm_seq;
            let comm_phy = self.comm_phy;
            let comm_pocket_phy = self.comm_pocket_phy;
            let file = self.file.clone();
            let on_disk = match file.len() {
                Ok(len) => addr + DISK_BLOCK_SIZE as u64 <= len,
                Err(e) => return self.bad(e),
            };
            let front = self.cur.front_mut().expect("current block present");
            if on_disk {
                if let Err(e) = file.read_at(addr, front.data.raw_mut()) {
                    return self.bad(e);
                }
            } else {
                // Nothing was committed in this generation yet; the
                // current logical block is empty.
                front.data = BlockData::new();
                front.data.set_seq(hash_seq(comm_seq));
                front.data.set_len_field(0);
            }
            front.phy = comm_phy;
            front.pocket_phy = comm_pocket_phy;
            self.cur_seq = comm_seq;
            self.use_pocket = self.comm_use_pocket;
        }
        self.cur_len = self.cur.front().expect("nonempty").data.len_field() as usize;

        self.erase_uncommitted(true)?;
        if self.file2.is_some() {
            self.erase_uncommitted(false)?;
        }

        self.nesting = 0;
        self.state = State::Ready;
        Ok(())
    }

    /// Opens a file to receive a new checkpoint and switches logging into
    /// a fresh log generation. The caller writes the checkpoint, syncs and
    /// closes it, then calls [`Log::checkpoint_end`] to commit.
    pub fn checkpoint_begin(&mut self) -> Result<File> {
        self.expect_state(State::Ready)?;
        if self.checkpointing {
            return self.bad(PodaError::Invalid("checkpoint already in progress"));
        }

        // Clean up any uncommitted checkpoints.
        for ver in self.cc_version + 1..=self.version + 1 {
            let _ = fs::remove_file(gen_path(&self.dir, ver, CKP_EXT));
        }
        if self.backup_checkpoints {
            let bdir = self.backup_dir.clone().expect("backup dir present");
            for ver in self.cc_version2 + 1..=self.version + 1 {
                let _ = fs::remove_file(gen_path(&bdir, ver, CKP_EXT));
            }
        }

        let ckp_path = gen_path(&self.dir, self.version + 1, CKP_EXT);
        let ckp = match File::create(&ckp_path) {
            Ok(f) => f,
            Err(e) => return self.bad(annotate_open(PodaError::from(e), &ckp_path)),
        };

        // Start a new log generation, preserving the old one.
        let log_path = gen_path(&self.dir, self.version + 1, LOG_EXT);
        self.file = open_rw_truncate(&log_path)?;
        if let Some(bdir) = &self.backup_dir {
            let bpath = gen_path(bdir, self.version + 1, LOG_EXT);
            self.file2 = Some(open_rw_truncate(&bpath)?);
        }
        self.version += 1;

        // Initialize the write buffer for the new generation.
        if self.cur.is_empty() {
            self.cur.push_front(Block::fresh(0));
        }
        self.cur.truncate(1);
        self.cur_seq = 0;
        self.cur_len = 0;
        let front = self.cur.front_mut().expect("nonempty");
        front.pocket_phy = 0;
        front.phy = 1;
        front.data.set_seq(hash_seq(0));
        front.data.set_len_field(0);
        self.use_pocket = true;

        let front = self.cur.front().expect("nonempty");
        self.comm_seq = self.cur_seq;
        self.comm_phy = front.phy;
        self.comm_pocket_phy = front.pocket_phy;
        self.comm_use_pocket = self.use_pocket;

        self.checkpointing = true;
        debug!(version = self.version, "log.checkpoint_begin");
        Ok(ckp)
    }

    /// Atomically commits the checkpoint opened by
    /// [`Log::checkpoint_begin`] (or adopted by `commit_external_checkpoint`).
    pub fn checkpoint_end(&mut self) -> Result<()> {
        self.expect_state(State::Ready)?;
        if !self.checkpointing {
            return self.bad(PodaError::Invalid("no checkpoint in progress"));
        }

        write_version_file(&self.dir, self.version)?;
        self.cc_version = self.version;

        if self.backup_checkpoints {
            let bdir = self.backup_dir.clone().expect("backup dir present");
            let src = gen_path(&self.dir, self.version, CKP_EXT);
            let dst = gen_path(&bdir, self.version, CKP_EXT);
            if let Err(e) = copy_synced(&src, &dst) {
                return self.bad(e);
            }
            write_version_file(&bdir, self.version)?;
            self.cc_version2 = self.version;
        }

        self.checkpointing = false;
        debug!(version = self.version, "log.checkpoint_end");
        Ok(())
    }

    /// Abandons the checkpoint in progress, removing its file so a later
    /// `checkpoint_resume` cannot find it.
    pub fn checkpoint_abort(&mut self) -> Result<()> {
        self.expect_state(State::Ready)?;
        if !self.checkpointing {
            return self.bad(PodaError::Invalid("no checkpoint in progress"));
        }
        debug_assert!(self.version > self.cc_version);
        let _ = fs::remove_file(gen_path(&self.dir, self.version, CKP_EXT));
        self.checkpointing = false;
        Ok(())
    }

    /// Reopens an uncommitted checkpoint left by a crash, or returns
    /// `None` if none was in progress.
    pub fn checkpoint_resume(&mut self) -> Result<Option<File>> {
        self.expect_state(State::Recovered)?;
        if self.checkpointing {
            return self.bad(PodaError::Invalid("checkpoint already in progress"));
        }
        if self.readonly {
            return self.bad(PodaError::Invalid("checkpoint_resume on read-only log"));
        }
        if self.version <= self.cc_version {
            return Ok(None);
        }
        let path = gen_path(&self.dir, self.version, CKP_EXT);
        if !path.exists() {
            return Ok(None);
        }
        let f = match FsOpenOptions::new().write(true).truncate(true).open(&path) {
            Ok(f) => f,
            Err(e) => return self.bad(annotate_open(PodaError::from(e), &path)),
        };
        self.checkpointing = true;
        Ok(Some(f))
    }

    /// Adopts an externally written checkpoint file for the current
    /// generation, entering the checkpointing state so `checkpoint_end`
    /// can commit it. `rel_name` is resolved inside the log directory and
    /// renamed over `{version}.ckp`.
    pub fn commit_external_checkpoint(&mut self, rel_name: &str) -> Result<()> {
        self.expect_state(State::Ready)?;
        let src = self.dir.join(rel_name);
        let dst = gen_path(&self.dir, self.version, CKP_EXT);
        if let Err(e) = fs::rename(&src, &dst) {
            return self.bad(PodaError::sys("rename checkpoint", e));
        }
        self.checkpointing = true;
        self.checkpoint_end()
    }

    /// Deletes old committed checkpoints and logs, keeping the newest
    /// `ckpkeep` committed checkpoints (the conceptual empty 0th
    /// checkpoint counts). With `logkeep` all log files are retained,
    /// which permits recovery entirely from logs. `prunebak` extends the
    /// pruning to the backup directory.
    pub fn prune(&mut self, ckpkeep: u32, logkeep: bool, prunebak: bool) -> Result<()> {
        if self.state == State::Bad {
            return Err(PodaError::Invalid("prune on bad log"));
        }
        if self.readonly {
            return Err(PodaError::Invalid("prune on read-only log"));
        }
        let res = (|| {
            do_prune(&self.dir, self.cc_version, ckpkeep, logkeep)?;
            if prunebak {
                if let Some(bdir) = &self.backup_dir {
                    do_prune(bdir, self.cc_version2, ckpkeep, logkeep)?;
                }
            }
            Ok(())
        })();
        if res.is_err() {
            self.state = State::Bad;
        }
        res
    }

    /// The directory this log lives in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn annotate_open(err: PodaError, path: &Path) -> PodaError {
    match err {
        PodaError::Io(e) => PodaError::InvalidOwned(format!("opening {}: {e}", path.display())),
        other => other,
    }
}

fn open_rw_existing(path: &Path) -> Result<StdFileIo> {
    let file = FsOpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(PodaError::from)?;
    Ok(StdFileIo::new(file))
}

fn open_rw_truncate(path: &Path) -> Result<StdFileIo> {
    let file = FsOpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(PodaError::from)?;
    Ok(StdFileIo::new(file))
}

fn copy_synced(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(|e| PodaError::sys("copy checkpoint", e))?;
    let f = File::open(dst).map_err(|e| PodaError::sys("open checkpoint copy", e))?;
    f.sync_all().map_err(|e| PodaError::sys("fsync checkpoint copy", e))?;
    Ok(())
}

fn read_pruned_file(dir: &Path) -> i64 {
    fs::read_to_string(dir.join(PRUNED_FILE))
        .ok()
        .and_then(|t| t.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}

fn do_prune(dir: &Path, cc_version: u32, ckpkeep: u32, logkeep: bool) -> Result<()> {
    let pruned_ver = read_pruned_file(dir);

    // Count down from the highest committed version, probing for
    // checkpoints to keep.
    let mut delver = i64::from(cc_version);
    let mut nkept = 0;
    while nkept < ckpkeep && delver > pruned_ver {
        delver -= 1;
        nkept += 1;
        while nkept < ckpkeep && delver > pruned_ver && delver > 0 {
            let probe = gen_path(dir, delver as u32, CKP_EXT);
            match fs::metadata(&probe) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::NotFound => delver -= 1,
                Err(e) => return Err(PodaError::sys("stat checkpoint", e)),
            }
        }
    }
    if delver < 0 {
        return Ok(());
    }

    for entry in fs::read_dir(dir).map_err(|e| PodaError::sys("read log directory", e))? {
        let entry = entry.map_err(|e| PodaError::sys("read log directory", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((num, ext)) = name.split_once('.') else {
            continue;
        };
        let Ok(num) = num.parse::<i64>() else { continue };
        let kill = num <= delver && (ext == CKP_EXT || (!logkeep && ext == LOG_EXT));
        if kill {
            debug!(file = name, "log.prune.unlink");
            fs::remove_file(entry.path()).map_err(|e| PodaError::sys("unlink pruned file", e))?;
        }
    }

    // Record how far we pruned; failures here only cost future probe time.
    let tmp = dir.join(NEW_PRUNED_FILE);
    let write_hint = || -> io::Result<()> {
        let mut f = File::create(&tmp)?;
        writeln!(f, "{delver}")?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, dir.join(PRUNED_FILE))?;
        Ok(())
    };
    if let Err(e) = write_hint() {
        warn!(error = %e, "log.prune.hint_write_failed");
    }
    Ok(())
}

/// `io::Write` adapter appending into a log record in progress.
pub struct LogWriter<'a>(pub &'a mut Log);

impl Write for LogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .put(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
