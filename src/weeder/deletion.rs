//! The deletion phase: purging weeded entries and dead derived files.
//!
//! Runs only after the mark phase has been committed to stable storage,
//! so a crash anywhere in here leaves a state from which recovery simply
//! reruns the deletion. The phase tells the cache which entries to purge,
//! sweeps the repository's derived files, rewrites the graph log into a
//! pruned checkpoint, and finally resets the stable weeded set.

use std::fs::{self, File};
use std::io::{BufWriter, Write};

use rustc_hash::FxHashSet;
use tracing::{debug, error, info};

use crate::cache::{CacheServer, PkPrefix};
use crate::graphlog::Entry;
use crate::primitives::bitvec::BitVector;
use crate::primitives::log::{LogSeq, RecordSource};
use crate::repos::Repository;
use crate::shortid::now_secs;
use crate::types::{PodaError, Result};
use crate::weeder::roots::{PkgBuild, RootTbl};
use crate::weeder::stable::{self, MiscVars, StablePaths};
use crate::weeder::WeederConfig;

/// Runs the deletion phase for the mark results in `vars`/`weeded`.
/// `new_log_ver` bounds graph-log replay when the mark phase ran in this
/// process; on a resumed weed it is unknown and replay is unbounded.
pub fn run_deletion<C: CacheServer + ?Sized>(
    cache: &C,
    repos: &dyn Repository,
    cfg: &WeederConfig,
    paths: &StablePaths,
    weeded: &mut BitVector,
    vars: &MiscVars,
    new_log_ver: Option<u32>,
) -> Result<()> {
    let mut chkpt_ver = None;
    if !weeded.is_empty() {
        let prefixes = weeded_prefixes(cfg, weeded, new_log_ver)?;
        chkpt_ver = Some(cache.end_mark(weeded, &prefixes)?);
    }

    // The repository sweep runs even when no cache entries die: derived
    // files can be dead while every entry survives.
    info!("weeder.deletion.derived_sweep_start");
    let sweep = repos.keep_derived(vars.dis_short_id, vars.start_time as u64);
    match &sweep {
        Ok(stats) => info!(
            deleted = stats.deleted_count,
            space = stats.deleted_space,
            "weeder.deletion.derived_sweep_done"
        ),
        Err(err) => error!(error = %err, "derived-file sweep failed"),
    }

    if let Some(chkpt_ver) = chkpt_ver {
        let rel_name = prune_graph_log(cfg, weeded, vars, chkpt_ver)?;
        let commit = (|| -> Result<()> {
            if !cache.commit_chkpt(&rel_name)? {
                return Err(PodaError::Inconsistent(
                    "graph log checkpoint rejected by cache server".into(),
                ));
            }
            Ok(())
        })();
        if let Err(err) = commit {
            // Never leave a half-committed checkpoint for a later weeder
            // to stumble on.
            let _ = fs::remove_file(cfg.graph_log_dir.join(&rel_name));
            return Err(err);
        }

        weeded.reset_all(true);
        stable::write_weeded(paths, weeded)?;
    }

    let sweep = sweep?;
    repos.checkpoint()?;
    info!(
        derived_deleted = sweep.deleted_count,
        "weeder.deletion.complete"
    );
    Ok(())
}

/// Collects the primary-key prefixes of every weeded node, so the cache
/// knows which key files need rewriting.
fn weeded_prefixes(
    cfg: &WeederConfig,
    weeded: &BitVector,
    end_ver: Option<u32>,
) -> Result<FxHashSet<PkPrefix>> {
    let mut prefixes = FxHashSet::default();
    let mut seq = LogSeq::new(&cfg.graph_log_dir);
    seq.open(None, true)?;
    let res = (|| -> Result<()> {
        while let Some(mut rd) = seq.next(end_ver)? {
            while !rd.at_eof()? {
                if let Entry::Node(node) = Entry::read(&mut rd)? {
                    if weeded.read(node.ci.0) {
                        prefixes.insert(PkPrefix::of(&node.loc));
                    }
                }
            }
        }
        Ok(())
    })();
    seq.close();
    res?;
    debug!(prefixes = prefixes.len(), "weeder.deletion.prefixes");
    Ok(prefixes)
}

/// Writes the pruned graph-log checkpoint and returns its relative
/// filename. Roots are kept only while still covered by the mark phase's
/// decisions, with a `done=true` root superseding earlier partial roots
/// for the same build; nodes are kept unless weeded.
fn prune_graph_log(
    cfg: &WeederConfig,
    weeded: &BitVector,
    vars: &MiscVars,
    chkpt_ver: u32,
) -> Result<String> {
    // Suffix the checkpoint name with the clock so two weeders probing at
    // once can never collide on a filename.
    let mut stamp = now_secs();
    let rel_name = loop {
        let candidate = format!("{chkpt_ver}.ckp_{stamp:x}");
        if !cfg.graph_log_dir.join(&candidate).exists() {
            break candidate;
        }
        stamp += 1;
    };
    let chkpt_path = cfg.graph_log_dir.join(&rel_name);

    let res = write_pruned_checkpoint(cfg, weeded, vars, &chkpt_path, chkpt_ver);
    match res {
        Ok((root_cnt, node_cnt)) => {
            info!(
                roots = root_cnt,
                nodes = node_cnt,
                file = rel_name,
                "weeder.deletion.pruned_checkpoint"
            );
            Ok(rel_name)
        }
        Err(err) => {
            let _ = fs::remove_file(&chkpt_path);
            Err(err)
        }
    }
}

fn write_pruned_checkpoint(
    cfg: &WeederConfig,
    weeded: &BitVector,
    vars: &MiscVars,
    chkpt_path: &std::path::Path,
    chkpt_ver: u32,
) -> Result<(u64, u64)> {
    let mut root_cnt = 0u64;
    let mut node_cnt = 0u64;
    // Status per written build: whether its done=true root went out.
    let mut written_roots = RootTbl::new();

    let file =
        File::create(chkpt_path).map_err(|e| PodaError::sys("create pruned checkpoint", e))?;
    let mut out = BufWriter::new(file);

    let mut seq = LogSeq::new(&cfg.graph_log_dir);
    seq.open(None, true)?;
    let res = (|| -> Result<()> {
        while let Some(mut rd) = seq.next(Some(chkpt_ver))? {
            while !rd.at_eof()? {
                match Entry::read(&mut rd)? {
                    Entry::Root(root) => {
                        let pkg = PkgBuild::new(root.pkg_fp, root.model);
                        let explicitly_kept = vars.marked_roots.get(&pkg);
                        let done_written = written_roots.get(&pkg);
                        let keep = match explicitly_kept {
                            Some(explicit) => explicit || root.ts >= vars.keep_time,
                            None => false,
                        } && done_written != Some(true);
                        if keep {
                            for &ci in &root.cis {
                                if weeded.read(ci.0) {
                                    return Err(PodaError::Inconsistent(format!(
                                        "kept root {pkg} references weeded entry {ci}"
                                    )));
                                }
                            }
                            root.write_to(&mut out)?;
                            root_cnt += 1;
                            if root.done {
                                written_roots.put(pkg, true);
                            } else if done_written.is_none() {
                                written_roots.put(pkg, false);
                            }
                        }
                    }
                    Entry::Node(node) => {
                        if !weeded.read(node.ci.0) {
                            node.write_to(&mut out)?;
                            node_cnt += 1;
                        }
                    }
                }
            }
        }
        Ok(())
    })();
    seq.close();
    res?;

    let mut file = out
        .into_inner()
        .map_err(|e| PodaError::sys("flush pruned checkpoint", e.into_error()))?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    // If a marked root never appeared while pruning, the cache's metadata
    // and the weeder's disagree; committing would finish destroying the
    // graph log.
    for (pkg, _) in vars.marked_roots.iter() {
        if written_roots.get(pkg).is_none() {
            error!(%pkg, "marked root never seen while checkpointing the graph log");
            return Err(PodaError::Inconsistent(format!(
                "marked root {pkg} never seen while checkpointing the graph log; \
                 the cache metadata may have been erased while the weeder metadata \
                 was not (a previously failed weed resumed against a different \
                 cache?). If this was not a resumed weed there is a bug; otherwise \
                 erase the weeder metadata directory and rerun"
            )));
        }
    }
    Ok((root_cnt, node_cnt))
}
