//! The cache-server seam consumed by the weeder.
//!
//! The weeder talks to the cache through the [`CacheServer`] trait: seven
//! operations covering the mark handshake, lease queries, the hit filter,
//! and graph-log checkpoint commit. [`LocalCache`] implements the trait
//! in-process for embedded deployments, owning the graph-log directory
//! and the bookkeeping an embedding build system needs to record entries.
//!
//! Exactly one weed runs at a time per cache; the cache refuses a second
//! `weeder_recovering` while one is in progress.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::graphlog::{Entry, Node, Root};
use crate::primitives::bitvec::BitVector;
use crate::primitives::log::{Log, LogSeq, LogWriter, OpenOptions, RecordSource};
use crate::types::{Ci, Fingerprint, PodaError, Result};

/// Bytes of the primary-key fingerprint used to group entries into
/// physical key files.
pub const PK_PREFIX_BYTES: usize = 4;

/// The prefix of a primary-key fingerprint; the deletion phase reports
/// the prefixes of weeded entries so the cache knows which key files to
/// rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkPrefix([u8; PK_PREFIX_BYTES]);

impl PkPrefix {
    pub fn of(fp: &Fingerprint) -> PkPrefix {
        let mut b = [0u8; PK_PREFIX_BYTES];
        b.copy_from_slice(&fp.as_bytes()[..PK_PREFIX_BYTES]);
        PkPrefix(b)
    }
}

/// The weeder-facing interface of the cache server.
pub trait CacheServer {
    /// Announces a recovered weeder; `resumable` reports whether a
    /// previous weed's deletion phase is pending. Returns true when
    /// another weed is already in progress, in which case the caller must
    /// not proceed.
    fn weeder_recovering(&self, resumable: bool) -> Result<bool>;

    /// Begins the mark phase: disables lease expiration, rolls the graph
    /// log, and returns the set of in-use cache indices together with the
    /// exclusive upper generation bound for graph-log replay.
    fn start_mark(&self) -> Result<(BitVector, u32)>;

    /// The set of currently leased cache indices.
    fn get_leases(&self) -> Result<BitVector>;

    /// Re-enables lease expiration after the mark phase (or on a failed
    /// weed).
    fn resume_lease_exp(&self) -> Result<()>;

    /// Installs the set of doomed entries so the cache stops returning
    /// hits on them immediately.
    fn set_hit_filter(&self, to_delete: &BitVector) -> Result<()>;

    /// Deletes the weeded entries, rewriting the key files named by
    /// `prefixes`; returns the new graph-log version whose checkpoint the
    /// weeder will supply.
    fn end_mark(&self, weeded: &BitVector, prefixes: &FxHashSet<PkPrefix>) -> Result<u32>;

    /// Commits the pruned graph-log checkpoint previously written under
    /// `rel_name` in the graph-log directory. False means the cache
    /// rejected the checkpoint.
    fn commit_chkpt(&self, rel_name: &str) -> Result<bool>;
}

struct CacheState {
    log: Log,
    used_cis: BitVector,
    next_ci: u32,
    leased: BitVector,
    hit_filter: BitVector,
    lease_exp_suspended: bool,
    chkpt_pending: bool,
}

/// An in-process cache good enough to be weeded: it owns the graph-log
/// directory, records entries for an embedding build system, and
/// implements the full [`CacheServer`] contract.
pub struct LocalCache {
    graph_log_dir: PathBuf,
    state: Mutex<CacheState>,
    /// Committed checkpoints to retain when pruning after a weed.
    ckp_keep: u32,
}

impl LocalCache {
    /// Opens (or creates) a cache over `graph_log_dir`, replaying the
    /// graph log to rebuild the set of in-use cache indices.
    pub fn open(graph_log_dir: impl AsRef<Path>) -> Result<LocalCache> {
        let dir = graph_log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| PodaError::sys("create graph log dir", e))?;

        // Replay pass: every node entry names a live CI.
        let mut used_cis = BitVector::new();
        let mut seq = LogSeq::new(&dir);
        seq.open(None, false)?;
        while let Some(mut rd) = seq.next(None)? {
            while !rd.at_eof()? {
                if let Entry::Node(node) = Entry::read(&mut rd)? {
                    used_cis.set(node.ci.0);
                }
            }
        }
        seq.close();

        // Write pass: reopen locked for appending.
        let mut log = Log::open(
            &dir,
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

        let next_ci = used_cis.msb().map_or(0, |b| b + 1);
        info!(dir = %dir.display(), cis = used_cis.cardinality(), "cache.open");
        Ok(LocalCache {
            graph_log_dir: dir,
            state: Mutex::new(CacheState {
                log,
                used_cis,
                next_ci,
                leased: BitVector::new(),
                hit_filter: BitVector::new(),
                lease_exp_suspended: false,
                chkpt_pending: false,
            }),
            ckp_keep: 2,
        })
    }

    pub fn graph_log_dir(&self) -> &Path {
        &self.graph_log_dir
    }

    /// Allocates a fresh cache index for a new entry.
    pub fn new_ci(&self) -> Ci {
        let mut state = self.state.lock();
        let ci = Ci(state.next_ci);
        state.next_ci += 1;
        state.used_cis.set(ci.0);
        ci
    }

    /// Appends a node entry to the graph log.
    pub fn record_node(&self, node: &Node) -> Result<()> {
        let mut state = self.state.lock();
        state.used_cis.set(node.ci.0);
        Self::append(&mut state.log, &Entry::Node(node.clone()))
    }

    /// Appends a root entry to the graph log.
    pub fn record_root(&self, root: &Root) -> Result<()> {
        let mut state = self.state.lock();
        Self::append(&mut state.log, &Entry::Root(root.clone()))
    }

    fn append(log: &mut Log, entry: &Entry) -> Result<()> {
        log.start()?;
        let res = entry.write_to(&mut LogWriter(log));
        match res {
            Ok(()) => log.commit(),
            Err(e) => {
                log.abort()?;
                Err(e)
            }
        }
    }

    /// Marks `ci` as leased by a running evaluator.
    pub fn set_lease(&self, ci: Ci, held: bool) {
        let mut state = self.state.lock();
        state.leased.write(ci.0, held);
    }

    /// Whether the hit filter currently suppresses `ci`.
    pub fn is_hit_filtered(&self, ci: Ci) -> bool {
        self.state.lock().hit_filter.read(ci.0)
    }

    /// Whether the cache still knows `ci`.
    pub fn contains(&self, ci: Ci) -> bool {
        self.state.lock().used_cis.read(ci.0)
    }

    pub fn lease_expiration_suspended(&self) -> bool {
        self.state.lock().lease_exp_suspended
    }

    /// Rolls the graph log into a fresh generation without committing a
    /// checkpoint for it.
    fn roll_log(state: &mut CacheState) -> Result<u32> {
        let ckp = state.log.checkpoint_begin()?;
        drop(ckp);
        state.log.checkpoint_abort()?;
        Ok(state.log.log_version())
    }
}

impl CacheServer for LocalCache {
    fn weeder_recovering(&self, resumable: bool) -> Result<bool> {
        let state = self.state.lock();
        let in_progress = state.lease_exp_suspended || state.chkpt_pending;
        debug!(resumable, in_progress, "cache.weeder_recovering");
        Ok(in_progress)
    }

    fn start_mark(&self) -> Result<(BitVector, u32)> {
        let mut state = self.state.lock();
        state.lease_exp_suspended = true;
        let new_log_ver = Self::roll_log(&mut state)?;
        debug!(new_log_ver, cis = state.used_cis.cardinality(), "cache.start_mark");
        Ok((state.used_cis.clone(), new_log_ver))
    }

    fn get_leases(&self) -> Result<BitVector> {
        Ok(self.state.lock().leased.clone())
    }

    fn resume_lease_exp(&self) -> Result<()> {
        self.state.lock().lease_exp_suspended = false;
        Ok(())
    }

    fn set_hit_filter(&self, to_delete: &BitVector) -> Result<()> {
        let mut state = self.state.lock();
        state.hit_filter = to_delete.clone();
        debug!(doomed = to_delete.cardinality(), "cache.set_hit_filter");
        Ok(())
    }

    fn end_mark(&self, weeded: &BitVector, prefixes: &FxHashSet<PkPrefix>) -> Result<u32> {
        let mut state = self.state.lock();
        state.used_cis.subtract(weeded);
        state.hit_filter.reset_all(true);
        // The pending {ver}.ckp stays open for the weeder's pruned
        // checkpoint; commit happens at commit_chkpt.
        let ckp = state.log.checkpoint_begin()?;
        drop(ckp);
        state.chkpt_pending = true;
        let new_log_ver = state.log.log_version();
        info!(
            weeded = weeded.cardinality(),
            prefixes = prefixes.len(),
            new_log_ver,
            "cache.end_mark"
        );
        Ok(new_log_ver)
    }

    fn commit_chkpt(&self, rel_name: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.chkpt_pending {
            debug!(rel_name, "cache.commit_chkpt.rejected");
            return Ok(false);
        }
        state.log.commit_external_checkpoint(rel_name)?;
        state.chkpt_pending = false;
        state.log.prune(self.ckp_keep, false, true)?;
        info!(rel_name, "cache.commit_chkpt");
        Ok(true)
    }
}
