//! The mark phase: computing the set of cache entries to keep.
//!
//! The engine copies the graph log into a pending file of reduced nodes,
//! marking the entries reachable from kept roots, then rescans the
//! pending file to a fixed point. Nodes whose CIs are not yet marked pass
//! through a bounded in-memory buffer; when a CI gets marked later and
//! its node is still buffered it is processed immediately, otherwise the
//! node comes back on a subsequent scan. Leased entries are marked after
//! the hit filter is installed, since they may be reached by running
//! evaluations the instructions know nothing about.

use std::fs::{self, File};
use std::io::BufWriter;

use rustc_hash::FxHashSet;
use tracing::{debug, error, info, warn};

use crate::cache::CacheServer;
use crate::graphlog::{Entry, GlNode, NodeBuffer};
use crate::primitives::bitvec::BitVector;
use crate::primitives::log::{CkptReader, LogSeq, RecordSource};
use crate::repos::Repository;
use crate::shortid::now_secs;
use crate::types::{Ci, PodaError, Result, ShortId};
use crate::weeder::dis::DisFile;
use crate::weeder::roots::{PkgBuild, RootTbl};
use crate::weeder::stable::StablePaths;
use crate::weeder::WeederConfig;

/// Everything the deletion phase (and the stable files) need from a
/// completed mark phase.
#[derive(Debug)]
pub struct MarkOutcome {
    pub weeded: BitVector,
    pub start_time: i64,
    pub keep_time: i64,
    pub dis_short_id: ShortId,
    pub marked_roots: RootTbl,
    pub new_log_ver: u32,
    pub marked_total: u64,
}

/// Re-enables lease expiration on every exit path until disarmed; the
/// cache must never be left with leases frozen by a failed weed.
struct LeaseExpGuard<'a, C: CacheServer + ?Sized> {
    cache: &'a C,
    armed: bool,
}

impl<'a, C: CacheServer + ?Sized> LeaseExpGuard<'a, C> {
    fn new(cache: &'a C) -> Self {
        LeaseExpGuard { cache, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: CacheServer + ?Sized> Drop for LeaseExpGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.cache.resume_lease_exp() {
                warn!(error = %err, "failed to resume lease expiration");
            }
        }
    }
}

/// Runs the mark phase. `instr_roots` is the table of package builds the
/// instructions keep; `keep_secs` additionally keeps every root younger
/// than that many seconds.
pub fn run_mark<C: CacheServer + ?Sized>(
    cache: &C,
    repos: &dyn Repository,
    cfg: &WeederConfig,
    paths: &StablePaths,
    instr_roots: &RootTbl,
    keep_secs: u64,
    print_roots: bool,
) -> Result<MarkOutcome> {
    // Recorded before the cache flushes its log so nothing the mark phase
    // can see predates it; the grace period covers clock skew.
    let start_time = now_secs() as i64 - cfg.grace_period_secs as i64;

    let (init_cis, new_log_ver) = cache.start_mark()?;
    let mut guard = LeaseExpGuard::new(cache);

    // Anything at least this fresh is kept regardless of instructions.
    let keep_time = now_secs() as i64 - keep_secs as i64;

    info!(
        cis = init_cis.cardinality(),
        new_log_ver,
        keep_time,
        "weeder.mark.start"
    );

    let mut engine = MarkEngine {
        cfg,
        paths,
        init_cis: &init_cis,
        marked: BitVector::with_capacity(init_cis.size()),
        gl_cis: BitVector::with_capacity(init_cis.size()),
        node_buff: NodeBuffer::new(cfg.node_buffer_size),
        dis: DisFile::create(repos, cfg.di_buffer_size)?,
        pending: None,
        marked_cnt: 0,
        marked_total: 0,
    };

    let mut marked_roots = RootTbl::new();
    engine.copy_gl_to_pending(instr_roots, &mut marked_roots, keep_time, new_log_ver, print_roots)?;

    // Mark to a fixed point from the instructed and fresh roots.
    while engine.marked_cnt > 0 {
        engine.marked_total += engine.marked_cnt;
        engine.scan_log_once()?;
    }
    info!(marked = engine.marked_total, "weeder.mark.roots_done");

    // Doomed entries stop hitting immediately, then running evaluations
    // get their say.
    let to_delete = engine.init_cis.minus(&engine.marked);
    cache.set_hit_filter(&to_delete)?;
    let leased_cis = cache.get_leases()?;
    cache.resume_lease_exp()?;
    guard.disarm();

    engine.marked_cnt = 0;
    for ci in leased_cis.iter() {
        engine.mark_node(Ci(ci))?;
    }
    while engine.marked_cnt > 0 {
        engine.marked_total += engine.marked_cnt;
        engine.scan_log_once()?;
    }
    info!(
        leased = leased_cis.cardinality(),
        marked = engine.marked_total,
        "weeder.mark.leases_done"
    );

    // Every non-leased marked entry must have had a graph-log node, or we
    // could not have protected its children and deriveds.
    let missing_gl = engine.marked.minus(&leased_cis).minus(&engine.gl_cis);
    if !missing_gl.is_empty() {
        error!(cis = ?missing_gl, "non-leased marked entries with no graph log node");
        return Err(PodaError::Inconsistent(format!(
            "{} non-leased marked cache entries have no graph log node",
            missing_gl.cardinality()
        )));
    }

    let weeded = engine.init_cis.minus(&engine.marked);
    let dis_short_id = engine.dis.close()?;
    paths.unlink_transient();

    info!(
        marked = engine.marked_total,
        weeded = weeded.cardinality(),
        "weeder.mark.complete"
    );
    Ok(MarkOutcome {
        weeded,
        start_time,
        keep_time,
        dis_short_id,
        marked_roots,
        new_log_ver,
        marked_total: engine.marked_total,
    })
}

struct MarkEngine<'a> {
    cfg: &'a WeederConfig,
    paths: &'a StablePaths,
    init_cis: &'a BitVector,
    marked: BitVector,
    gl_cis: BitVector,
    node_buff: NodeBuffer,
    dis: DisFile,
    pending: Option<BufWriter<File>>,
    marked_cnt: u64,
    marked_total: u64,
}

impl MarkEngine<'_> {
    fn open_pending(&mut self) -> Result<()> {
        let f = File::create(self.paths.pending_gl())
            .map_err(|e| PodaError::sys("create pending graph log", e))?;
        self.pending = Some(BufWriter::new(f));
        Ok(())
    }

    fn close_pending(&mut self) -> Result<()> {
        if let Some(w) = self.pending.take() {
            w.into_inner()
                .map_err(|e| PodaError::sys("flush pending graph log", e.into_error()))?;
        }
        Ok(())
    }

    /// Copies the graph log (up to but excluding `new_log_ver`) into the
    /// pending file, marking the CIs of kept roots along the way, and
    /// cross-checks every CI mentioned against the cache's in-use set.
    fn copy_gl_to_pending(
        &mut self,
        instr_roots: &RootTbl,
        marked_roots: &mut RootTbl,
        keep_time: i64,
        new_log_ver: u32,
        print_roots: bool,
    ) -> Result<()> {
        self.marked_cnt = 0;
        self.open_pending()?;
        let mut root_cnt = 0u64;
        let mut node_cnt = 0u64;
        let mut unused_cis = false;
        let mut last_log_ver: i64 = -1;
        let mut kept_printed: FxHashSet<PkgBuild> = FxHashSet::default();
        let mut unkept_printed: FxHashSet<PkgBuild> = FxHashSet::default();

        let mut seq = LogSeq::new(&self.cfg.graph_log_dir);
        seq.open(None, true)?;
        let res = (|| -> Result<()> {
            while let Some(mut rd) = seq.next(Some(new_log_ver))? {
                while !rd.at_eof()? {
                    match Entry::read(&mut rd)? {
                        Entry::Root(root) => {
                            root_cnt += 1;
                            let pkg = PkgBuild::new(root.pkg_fp, root.model);
                            let in_tbl = instr_roots.contains(&pkg);
                            let fresh = root.ts >= keep_time;
                            let kept = in_tbl || fresh;
                            if print_roots {
                                let printed = if kept {
                                    &mut kept_printed
                                } else {
                                    &mut unkept_printed
                                };
                                if printed.insert(pkg) {
                                    let tag = if in_tbl {
                                        '+'
                                    } else if fresh {
                                        '>'
                                    } else {
                                        '-'
                                    };
                                    println!("  {tag} {pkg}");
                                }
                            }
                            if kept {
                                for &ci in &root.cis {
                                    self.mark_node(ci)?;
                                }
                                marked_roots.put(pkg, in_tbl);
                            }
                            for &ci in &root.cis {
                                if !self.init_cis.read(ci.0) {
                                    error!(
                                        %pkg,
                                        ci = %ci,
                                        "graph log root references an unused cache index"
                                    );
                                    unused_cis = true;
                                    break;
                                }
                            }
                        }
                        Entry::Node(node) => {
                            node_cnt += 1;
                            let reduced = GlNode::of(&node);
                            let pending = self.pending.as_mut().expect("pending file open");
                            reduced.write_to(pending)?;
                            self.gl_cis.set(node.ci.0);

                            let self_unused = !self.init_cis.read(node.ci.0);
                            let kids_unused =
                                node.kids.iter().any(|kid| !self.init_cis.read(kid.0));
                            if self_unused || kids_unused {
                                error!(
                                    ci = %node.ci,
                                    loc = %node.loc,
                                    self_unused,
                                    kids_unused,
                                    "graph log node references an unused cache index"
                                );
                                unused_cis = true;
                            }
                        }
                    }
                }
                if let Some(ver) = rd.log_version() {
                    last_log_ver = i64::from(ver);
                }
            }
            Ok(())
        })();
        seq.close();
        res?;
        self.close_pending()?;

        // The last generation read must sit just below the version the
        // cache told us it rolled to; otherwise this weeder is reading a
        // different cache's log than it is talking to.
        if last_log_ver != i64::from(new_log_ver) - 1 {
            return Err(PodaError::Inconsistent(format!(
                "graph log does not match the cache server: last log read {last_log_ver}, \
                 expected {} (maybe the filesystem does not match the cache server?)",
                i64::from(new_log_ver) - 1
            )));
        }
        if unused_cis {
            return Err(PodaError::Inconsistent(
                "graph log references cache indices the cache does not know".into(),
            ));
        }

        debug!(
            roots = root_cnt,
            nodes = node_cnt,
            marked = self.marked_cnt,
            "weeder.mark.copy_done"
        );
        Ok(())
    }

    /// One scan of the pending file: processes nodes whose CIs are now
    /// marked, buffers the rest, spilling overflow to a fresh pending
    /// file.
    fn scan_log_once(&mut self) -> Result<()> {
        fs::rename(self.paths.pending_gl(), self.paths.working_gl())
            .map_err(|e| PodaError::sys("rename pending graph log", e))?;
        let working = File::open(self.paths.working_gl())
            .map_err(|e| PodaError::sys("open working graph log", e))?;
        let mut working = CkptReader::new(working);
        self.open_pending()?;

        self.marked_cnt = 0;
        self.node_buff.flushed_cnt = 0;
        let mut nodes_read = 0u64;
        while !working.at_eof()? {
            let node = GlNode::read(&mut working)?;
            nodes_read += 1;
            if self.marked.read(node.ci.0) {
                self.process_node(node)?;
            } else {
                let pending = self.pending.as_mut().expect("pending file open");
                self.node_buff.put(node, pending)?;
            }
        }
        self.close_pending()?;

        debug!(
            nodes_read,
            marked = self.marked_cnt,
            spilled = self.node_buff.flushed_cnt,
            "weeder.mark.scan"
        );
        Ok(())
    }

    /// Marks `ci`; if its node is buffered, processes it right away.
    fn mark_node(&mut self, ci: Ci) -> Result<()> {
        if !self.marked.set(ci.0) {
            self.marked_cnt += 1;
            if let Some(node) = self.node_buff.delete(ci) {
                self.process_node(node)?;
            }
        }
        Ok(())
    }

    /// Marks the node's children and records its reachable deriveds.
    fn process_node(&mut self, node: GlNode) -> Result<()> {
        for &kid in &node.kids {
            self.mark_node(kid)?;
        }
        for &di in &node.refs {
            self.dis.write(di)?;
        }
        Ok(())
    }
}
