//! Short-identifier allocation and leasing.
//!
//! ShortIds are 32-bit handles naming immutable files in content-addressed
//! storage. Clients receive blocks of 256 consecutive ids whose placement
//! is effectively random across the namespace; blocks are leased for a
//! bounded period so ids held by a crashed client are eventually
//! reclaimed. A background "landlord" task scans for expired leases on an
//! adaptive interval.
//!
//! Lease transitions are logged as text records through the metadata
//! [`Log`]: `(asidb start expiry)` on acquire and renew, `(rsidb start)`
//! on release. They are replayed at recovery. Non-expiring in-process leases
//! are neither logged nor checkpointed: if the server dies, so does the
//! holder.

pub mod sweep;

pub use sweep::{delete_all_short_ids_but, SweepStats};

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::primitives::bitvec::BitVector;
use crate::primitives::log::Log;
use crate::types::{PodaError, Result, ShortId};

/// Number of ShortIds in one allocation block; the low 8 bits vary within
/// a block.
pub const BLOCK_SIZE: u32 = 256;
/// High bit distinguishing leaf (file) ids from directory ids.
pub const LEAF_FLAG: u32 = 0x8000_0000;
/// Bit reserved for directory ShortIds assigned by fingerprint hashing.
pub const DIR_FLAG: u32 = 0x4000_0000;

/// The expiry an old server version wrote for non-expiring leases; it must
/// be tolerated and skipped on recovery.
const LEGACY_NONEXPIRING: u64 = 0x7fff_ffff;

/// When a lease stops protecting its block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseExpiry {
    /// Expires at this many seconds past the epoch.
    At(u64),
    /// Never expires: the holder shares the server's fate.
    Never,
}

impl LeaseExpiry {
    pub fn expired(self, now: u64) -> bool {
        match self {
            LeaseExpiry::At(t) => t < now,
            LeaseExpiry::Never => false,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The pathname of a ShortId inside the storage tree: eight lowercase hex
/// digits split into arcs of 3, 3, and 2.
pub fn short_id_path(sid_dir: &Path, sid: ShortId) -> PathBuf {
    let hex = format!("{:08x}", sid.0);
    sid_dir.join(&hex[0..3]).join(&hex[3..6]).join(&hex[6..8])
}

/// The directory holding all 256 files of the block containing `sid`.
pub fn block_dir(sid_dir: &Path, sid: ShortId) -> PathBuf {
    let hex = format!("{:08x}", sid.0);
    sid_dir.join(&hex[0..3]).join(&hex[3..6])
}

/// A leased block of 256 consecutive ShortIds handed to a client.
#[derive(Clone, Debug)]
pub struct ShortIdBlock {
    pub start: ShortId,
    /// Offsets within the block already used on disk or assigned.
    pub in_use: BitVector,
    pub lease_expires: LeaseExpiry,
}

impl ShortIdBlock {
    fn new(start: ShortId) -> ShortIdBlock {
        ShortIdBlock {
            start,
            in_use: BitVector::with_capacity(BLOCK_SIZE),
            lease_expires: LeaseExpiry::Never,
        }
    }

    /// Marks `sid` (which must lie in this block) as in use.
    pub fn set(&mut self, sid: ShortId) {
        debug_assert_eq!(sid.0 & !(BLOCK_SIZE - 1), self.start.0);
        self.in_use.set(sid.0 & (BLOCK_SIZE - 1));
    }

    /// Assigns the next free ShortId from this block, or None when every
    /// id is taken.
    pub fn assign_next_avail(&mut self) -> Option<ShortId> {
        if self.in_use.cardinality() >= BLOCK_SIZE {
            return None;
        }
        let off = self.in_use.next_avail(true);
        if off >= BLOCK_SIZE {
            return None;
        }
        Some(ShortId(self.start.0 | off))
    }
}

/// Tuning knobs for leases and the landlord task.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub lease_period_secs: u64,
    pub landlord_sleep_min_secs: u64,
    pub landlord_sleep_max_secs: u64,
    pub landlord_worklist_size: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            lease_period_secs: 60 * 60 * 2,
            landlord_sleep_min_secs: 60,
            landlord_sleep_max_secs: 60 * 60,
            landlord_worklist_size: 128,
        }
    }
}

struct AllocState {
    table: FxHashMap<u32, LeaseExpiry>,
    /// Directory ShortIds currently registered; assignment is
    /// deterministic so log replay reassigns the same ids.
    dir_table: FxHashSet<u32>,
    rng: StdRng,
}

#[derive(Default)]
struct LandlordFlags {
    shutdown: bool,
}

/// Process-wide allocator of ShortId blocks.
pub struct ShortIdAllocator {
    sid_dir: PathBuf,
    log: Arc<Mutex<Log>>,
    cfg: LeaseConfig,
    inner: Mutex<AllocState>,
    landlord_flags: Mutex<LandlordFlags>,
    landlord_cv: Condvar,
    landlord_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ShortIdAllocator {
    /// Creates an allocator over `sid_dir`, logging lease transitions to
    /// `log` (which must already be open for appending).
    pub fn new(sid_dir: impl AsRef<Path>, log: Arc<Mutex<Log>>, cfg: LeaseConfig) -> Arc<Self> {
        Arc::new(ShortIdAllocator {
            sid_dir: sid_dir.as_ref().to_path_buf(),
            log,
            cfg,
            inner: Mutex::new(AllocState {
                table: FxHashMap::default(),
                dir_table: FxHashSet::default(),
                rng: StdRng::from_entropy(),
            }),
            landlord_flags: Mutex::new(LandlordFlags::default()),
            landlord_cv: Condvar::new(),
            landlord_thread: Mutex::new(None),
        })
    }

    pub fn sid_dir(&self) -> &Path {
        &self.sid_dir
    }

    /// Acquires a fresh block of 256 ShortIds with the requested leaf
    /// flag. The block never conflicts with another outstanding block or
    /// with a fully populated region of the storage tree; a block more
    /// than half full is used only if a second probe is fuller still.
    /// With `local`, the lease never expires and is not logged.
    pub fn acquire(&self, leaf: bool, local: bool) -> Result<ShortIdBlock> {
        let mut state = self.inner.lock();
        let mut fallback: Option<(ShortIdBlock, u32)> = None;
        let block = loop {
            let randint: u32 = state.rng.gen();
            let start = (randint & !(BLOCK_SIZE - 1) & !LEAF_FLAG & !DIR_FLAG)
                | if leaf { LEAF_FLAG } else { 0 };
            let start = ShortId(start);
            if start.is_null() || state.table.contains_key(&start.0) {
                continue;
            }

            let mut block = ShortIdBlock::new(start);
            let used = self.count_populated(&mut block)?;
            if used >= BLOCK_SIZE {
                continue;
            }
            if fallback.is_none() && used > BLOCK_SIZE / 2 {
                // More than half full; remember it and probe once more.
                fallback = Some((block, used));
                continue;
            }
            match fallback.take() {
                Some((fb, fb_used)) if fb_used < used => break fb,
                _ => break block,
            }
        };

        let mut block = block;
        block.lease_expires = if local {
            LeaseExpiry::Never
        } else {
            LeaseExpiry::At(now_secs() + self.cfg.lease_period_secs)
        };
        state.table.insert(block.start.0, block.lease_expires);
        debug!(block = %block.start, expires = ?block.lease_expires, "shortid.acquire");
        if !local {
            self.log_asidb(block.start, block.lease_expires)?;
        }
        Ok(block)
    }

    /// Renews the lease on `block`. Returns false when the lease had
    /// already expired or was unknown; letting that happen is a fatal
    /// client error.
    pub fn renew(&self, block: &mut ShortIdBlock) -> Result<bool> {
        let mut state = self.inner.lock();
        let now = now_secs();
        match state.table.get(&block.start.0) {
            Some(exp) if !exp.expired(now) => {}
            Some(_) => {
                state.table.remove(&block.start.0);
                debug!(block = %block.start, "shortid.renew.expired");
                return Ok(false);
            }
            None => {
                debug!(block = %block.start, "shortid.renew.invalid");
                return Ok(false);
            }
        }
        let expires = LeaseExpiry::At(now + self.cfg.lease_period_secs);
        state.table.insert(block.start.0, expires);
        block.lease_expires = expires;
        debug!(block = %block.start, expires = ?expires, "shortid.renew");
        self.log_asidb(block.start, expires)?;
        Ok(true)
    }

    /// Returns a block to the allocator; the caller promises to assign no
    /// more ids from it.
    pub fn release(&self, block: &ShortIdBlock, local: bool) -> Result<()> {
        let mut state = self.inner.lock();
        self.release_locked(&mut state, block.start, local)
    }

    fn release_locked(&self, state: &mut AllocState, start: ShortId, local: bool) -> Result<()> {
        let known = state.table.remove(&start.0).is_some();
        debug!(block = %start, known, "shortid.release");
        if !local {
            let mut log = self.log.lock();
            log.start()?;
            log.put(format!("(rsidb 0x{:x})\n", start.0).as_bytes())?;
            log.commit()?;
        }
        Ok(())
    }

    fn log_asidb(&self, start: ShortId, expires: LeaseExpiry) -> Result<()> {
        let LeaseExpiry::At(t) = expires else {
            return Ok(());
        };
        let mut log = self.log.lock();
        log.start()?;
        log.put(format!("(asidb 0x{:x} {t})\n", start.0).as_bytes())?;
        log.commit()?;
        Ok(())
    }

    /// Counts the ids of `block` already populated on disk, marking each
    /// in the block's in-use set.
    fn count_populated(&self, block: &mut ShortIdBlock) -> Result<u32> {
        let dir = block_dir(&self.sid_dir, block.start);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // Directory absent: the whole block is free.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PodaError::sys("list shortid block directory", e)),
        };
        let mut used = 0;
        for entry in entries {
            let entry = entry.map_err(|e| PodaError::sys("list shortid block directory", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(offset) = parse_hex_arc(name, 2) else {
                continue;
            };
            block.set(ShortId(block.start.0 + offset));
            used += 1;
        }
        Ok(used)
    }

    /// Replays `(asidb ...)`/`(rsidb ...)` records from recovered log
    /// text. Records carrying the legacy non-expiring magic are skipped.
    pub fn apply_record(&self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        let body = line
            .strip_prefix('(')
            .and_then(|l| l.strip_suffix(')'))
            .ok_or_else(|| PodaError::Corruption(format!("malformed lease record: {line}")))?;
        let mut fields = body.split_whitespace();
        let ident = fields.next().unwrap_or("");
        let parse_start = |fields: &mut dyn Iterator<Item = &str>| -> Result<u32> {
            let raw = fields
                .next()
                .and_then(|s| s.strip_prefix("0x"))
                .ok_or_else(|| PodaError::Corruption(format!("malformed lease record: {line}")))?;
            u32::from_str_radix(raw, 16)
                .map_err(|_| PodaError::Corruption(format!("malformed lease record: {line}")))
        };
        match ident {
            "asidb" => {
                let start = parse_start(&mut fields)?;
                let expires: u64 = fields
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        PodaError::Corruption(format!("malformed lease record: {line}"))
                    })?;
                if expires == LEGACY_NONEXPIRING {
                    debug!(block = %ShortId(start), "shortid.recover.skip_nonexpiring");
                    return Ok(());
                }
                self.inner.lock().table.insert(start, LeaseExpiry::At(expires));
            }
            "rsidb" => {
                let start = parse_start(&mut fields)?;
                self.inner.lock().table.remove(&start);
            }
            other => {
                return Err(PodaError::Corruption(format!(
                    "unknown lease record kind: {other}"
                )))
            }
        }
        Ok(())
    }

    /// Writes an `asidb` record for every outstanding expiring lease.
    /// Non-expiring leases are process-local and meaningless across a
    /// restart, so they are skipped.
    pub fn checkpoint(&self, w: &mut impl std::io::Write) -> Result<()> {
        let state = self.inner.lock();
        for (&start, &expires) in &state.table {
            let LeaseExpiry::At(t) = expires else { continue };
            writeln!(w, "(asidb 0x{start:x} {t})")?;
        }
        Ok(())
    }

    /// Assigns a directory ShortId for the directory with fingerprint
    /// `fp`: the fingerprint hash with the directory flag set, probed
    /// upward until a free slot is found. Assignment must stay
    /// deterministic so replaying the log reassigns identical ids.
    pub fn new_dir_short_id(&self, fp: &crate::types::Fingerprint) -> ShortId {
        let mut state = self.inner.lock();
        let mut hash = u64::from_le_bytes(fp.as_bytes()[..8].try_into().expect("16-byte tag"));
        let sid = loop {
            let candidate = (hash as u32 & !LEAF_FLAG) | DIR_FLAG;
            if !state.dir_table.contains(&candidate) {
                break candidate;
            }
            hash = hash.wrapping_add(1);
        };
        state.dir_table.insert(sid);
        debug!(sid = %ShortId(sid), "shortid.new_dir");
        ShortId(sid)
    }

    /// Registers an existing directory ShortId, e.g. during recovery.
    pub fn register_dir_short_id(&self, sid: ShortId) {
        self.inner.lock().dir_table.insert(sid.0);
    }

    /// Drops one directory ShortId registration, making it reusable.
    pub fn delete_dir_short_id(&self, sid: ShortId) {
        self.inner.lock().dir_table.remove(&sid.0);
    }

    /// The number of outstanding leases (expiring or not).
    pub fn lease_count(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn holds_lease(&self, start: ShortId) -> bool {
        self.inner.lock().table.contains_key(&start.0)
    }

    /// One landlord scan: reclaims up to a worklist of expired leases,
    /// grouping all releases into a single log commit. Returns the number
    /// reclaimed and whether the worklist filled.
    pub fn reap_expired(&self) -> Result<(usize, bool)> {
        let mut state = self.inner.lock();
        let now = now_secs();
        let mut worklist = Vec::with_capacity(self.cfg.landlord_worklist_size);
        for (&start, &expires) in &state.table {
            if expires.expired(now) {
                worklist.push(ShortId(start));
                if worklist.len() >= self.cfg.landlord_worklist_size {
                    break;
                }
            }
        }
        let saturated = worklist.len() >= self.cfg.landlord_worklist_size;
        if !worklist.is_empty() {
            let mut log = self.log.lock();
            log.start()?;
            for &start in &worklist {
                state.table.remove(&start.0);
                log.put(format!("(rsidb 0x{:x})\n", start.0).as_bytes())?;
                debug!(block = %start, "shortid.landlord.reclaim");
            }
            log.commit()?;
        }
        Ok((worklist.len(), saturated))
    }

    /// Spawns the landlord task if it is not already running. The task
    /// keeps only a weak reference between scans, so it winds down when
    /// the allocator is dropped.
    pub fn start_landlord(self: &Arc<Self>) {
        let mut guard = self.landlord_thread.lock();
        if guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *guard = Some(thread::spawn(move || landlord_loop(weak)));
    }
}

fn landlord_loop(weak: std::sync::Weak<ShortIdAllocator>) {
    let mut sleep_secs = match weak.upgrade() {
        Some(alloc) => alloc.cfg.landlord_sleep_max_secs,
        None => return,
    };
    loop {
        let Some(alloc) = weak.upgrade() else { return };
        {
            let mut flags = alloc.landlord_flags.lock();
            if flags.shutdown {
                return;
            }
            alloc
                .landlord_cv
                .wait_for(&mut flags, Duration::from_secs(sleep_secs));
            if flags.shutdown {
                return;
            }
        }
        let (reclaimed, saturated) = match alloc.reap_expired() {
            Ok(res) => res,
            Err(err) => {
                warn!(error = %err, "shortid.landlord.error");
                continue;
            }
        };
        if reclaimed > 0 {
            debug!(reclaimed, sleep_secs, "shortid.landlord.scan");
        }
        if saturated {
            if sleep_secs / 2 >= alloc.cfg.landlord_sleep_min_secs {
                sleep_secs /= 2;
            } else {
                warn!(
                    sleep_secs,
                    worklist = alloc.cfg.landlord_worklist_size,
                    "landlord is very busy; consider raising the worklist size, \
                     lowering the minimum sleep, or lowering the lease period"
                );
            }
        } else if sleep_secs * 2 <= alloc.cfg.landlord_sleep_max_secs {
            sleep_secs *= 2;
        }
    }
}

impl Drop for ShortIdAllocator {
    fn drop(&mut self) {
        {
            let mut flags = self.landlord_flags.lock();
            flags.shutdown = true;
        }
        self.landlord_cv.notify_all();
        if let Some(handle) = self.landlord_thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for ShortIdAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShortIdAllocator")
            .field("sid_dir", &self.sid_dir)
            .field("leases", &self.lease_count())
            .finish()
    }
}

/// Parses a directory arc of exactly `len` lowercase hex digits.
pub(crate) fn parse_hex_arc(name: &str, len: usize) -> Option<u32> {
    if name.len() != len
        || !name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    u32::from_str_radix(name, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::log::OpenOptions;
    use tempfile::tempdir;

    fn open_log(dir: &Path) -> Arc<Mutex<Log>> {
        let mut log = Log::open(dir, OpenOptions::default()).unwrap();
        assert!(log.at_eof().unwrap());
        assert!(!log.next_log().unwrap());
        log.logging_begin().unwrap();
        Arc::new(Mutex::new(log))
    }

    fn allocator(root: &Path, cfg: LeaseConfig) -> Arc<ShortIdAllocator> {
        let log_dir = root.join("log");
        let sid_dir = root.join("sid");
        fs::create_dir_all(&log_dir).unwrap();
        fs::create_dir_all(&sid_dir).unwrap();
        ShortIdAllocator::new(sid_dir, open_log(&log_dir), cfg)
    }

    #[test]
    fn block_math() {
        let dir = tempdir().unwrap();
        let alloc = allocator(dir.path(), LeaseConfig::default());
        let mut block = alloc.acquire(true, true).unwrap();
        assert_eq!(block.start.0 & (BLOCK_SIZE - 1), 0);
        assert_ne!(block.start.0 & LEAF_FLAG, 0);
        assert_eq!(block.start.0 & DIR_FLAG, 0);
        let a = block.assign_next_avail().unwrap();
        let b = block.assign_next_avail().unwrap();
        assert_eq!(a.0 + 1, b.0);
        assert_eq!(a.0 & !(BLOCK_SIZE - 1), block.start.0);
    }

    #[test]
    fn acquired_blocks_never_overlap() {
        let dir = tempdir().unwrap();
        let alloc = allocator(dir.path(), LeaseConfig::default());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let block = alloc.acquire(true, false).unwrap();
            assert!(seen.insert(block.start.0), "block handed out twice");
        }
        assert_eq!(alloc.lease_count(), 32);
    }

    #[test]
    fn expired_lease_cannot_renew() {
        let dir = tempdir().unwrap();
        let cfg = LeaseConfig {
            lease_period_secs: 0,
            ..Default::default()
        };
        let alloc = allocator(dir.path(), cfg);
        let mut block = alloc.acquire(true, false).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(!alloc.renew(&mut block).unwrap());
        assert!(!alloc.holds_lease(block.start));
    }

    #[test]
    fn reap_reclaims_expired_only() {
        let dir = tempdir().unwrap();
        let cfg = LeaseConfig {
            lease_period_secs: 0,
            ..Default::default()
        };
        let alloc = allocator(dir.path(), cfg);
        let expiring = alloc.acquire(true, false).unwrap();
        let local = alloc.acquire(true, true).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let (reclaimed, saturated) = alloc.reap_expired().unwrap();
        assert_eq!(reclaimed, 1);
        assert!(!saturated);
        assert!(!alloc.holds_lease(expiring.start));
        assert!(alloc.holds_lease(local.start));
    }

    #[test]
    fn record_replay_rebuilds_table() {
        let dir = tempdir().unwrap();
        let alloc = allocator(dir.path(), LeaseConfig::default());
        alloc.apply_record("(asidb 0x80001100 9999999999)").unwrap();
        alloc.apply_record("(asidb 0x80002200 9999999999)").unwrap();
        alloc.apply_record("(rsidb 0x80001100)").unwrap();
        // Legacy magic for non-expiring leases is skipped.
        alloc
            .apply_record(&format!("(asidb 0x80003300 {LEGACY_NONEXPIRING})"))
            .unwrap();
        assert!(!alloc.holds_lease(ShortId(0x8000_1100)));
        assert!(alloc.holds_lease(ShortId(0x8000_2200)));
        assert!(!alloc.holds_lease(ShortId(0x8000_3300)));
        assert!(alloc.apply_record("(bogus 0x1 2)").is_err());
    }

    #[test]
    fn dir_short_ids_are_deterministic_and_collision_free() {
        let dir = tempdir().unwrap();
        let alloc = allocator(dir.path(), LeaseConfig::default());
        let fp = crate::types::Fingerprint([0x31; 16]);
        let a = alloc.new_dir_short_id(&fp);
        assert_ne!(a.0 & DIR_FLAG, 0);
        assert_eq!(a.0 & LEAF_FLAG, 0);
        // Same fingerprint probes past the taken slot.
        let b = alloc.new_dir_short_id(&fp);
        assert_ne!(a, b);
        // Releasing makes the original slot reassignable.
        alloc.delete_dir_short_id(a);
        alloc.delete_dir_short_id(b);
        assert_eq!(alloc.new_dir_short_id(&fp), a);
    }

    #[test]
    fn checkpoint_skips_nonexpiring() {
        let dir = tempdir().unwrap();
        let alloc = allocator(dir.path(), LeaseConfig::default());
        let _local = alloc.acquire(true, true).unwrap();
        let leased = alloc.acquire(true, false).unwrap();
        let mut out = Vec::new();
        alloc.checkpoint(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains(&format!("0x{:x}", leased.start.0)));
    }

    #[test]
    fn population_probe_sees_existing_files() {
        let dir = tempdir().unwrap();
        let alloc = allocator(dir.path(), LeaseConfig::default());
        let block = alloc.acquire(true, true).unwrap();
        // Populate one id on disk, then force a fresh probe of the block.
        let sid = ShortId(block.start.0 | 0x17);
        let path = short_id_path(alloc.sid_dir(), sid);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"derived").unwrap();

        let mut reprobe = ShortIdBlock::new(block.start);
        assert_eq!(alloc.count_populated(&mut reprobe).unwrap(), 1);
        assert!(reprobe.in_use.read(0x17));
    }
}
