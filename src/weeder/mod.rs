//! The weeder: mark and deletion phases under one crash-safe controller.
//!
//! A weed runs in two phases. The mark phase computes the set of cache
//! entries to delete and the file of derived indices to keep, then
//! commits both to stable storage; the deletion phase carries the
//! decisions out. The stable `weeded` set is the commit point: while it
//! is non-empty, a deletion phase is owed, and a recovering weeder skips
//! straight to it.

pub mod config;
pub mod deletion;
pub mod dis;
pub mod mark;
pub mod roots;
pub mod stable;

pub use config::{ConfigError, WeederConfig};
pub use mark::MarkOutcome;
pub use roots::{PkgBuild, RootTbl};

use std::io::BufRead;

use tracing::{info, warn};

use crate::cache::CacheServer;
use crate::primitives::bitvec::BitVector;
use crate::repos::Repository;
use crate::types::{PodaError, Result};
use crate::weeder::stable::{MiscVars, StablePaths};

/// Whether the deletion phase runs, after optional confirmation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionStatus {
    /// Mark only; report what would be deleted.
    NoDeletions,
    /// Ask on stdin before deleting.
    QueryDeletions,
    /// Delete without asking.
    DoDeletions,
}

/// One weed's arguments.
#[derive(Clone, Debug)]
pub struct WeedArgs {
    /// Roots the instructions keep; `None` means finish any pending weed
    /// and do not start a new one.
    pub instr_roots: Option<RootTbl>,
    pub del_status: DeletionStatus,
    /// Additionally keep every root younger than this many seconds.
    pub keep_secs: u64,
    /// Print the disposition of each graph-log root.
    pub print_roots: bool,
}

/// The weeder controller. Construction recovers the stable state and
/// announces the weeder to the cache, which refuses to host two weeds at
/// once.
pub struct Weeder<'a, C: CacheServer + ?Sized> {
    cache: &'a C,
    repos: &'a dyn Repository,
    cfg: &'a WeederConfig,
    paths: StablePaths,
    weeded: BitVector,
    misc: Option<MiscVars>,
}

impl<'a, C: CacheServer + ?Sized> Weeder<'a, C> {
    pub fn new(cache: &'a C, repos: &'a dyn Repository, cfg: &'a WeederConfig) -> Result<Self> {
        let paths = StablePaths::new(&cfg.weeder_md_dir)?;
        let weeded = stable::read_weeded(&paths)?;
        let misc = if weeded.is_empty() {
            None
        } else {
            let misc = stable::read_misc_vars(&paths)?;
            if misc.is_none() {
                return Err(PodaError::Inconsistent(
                    "stable weeded set present without misc vars".into(),
                ));
            }
            misc
        };

        let resumable = !weeded.is_empty();
        if cache.weeder_recovering(resumable)? {
            return Err(PodaError::Inconsistent(
                "another weed is already in progress".into(),
            ));
        }
        info!(resumable, "weeder.recovered");
        Ok(Weeder {
            cache,
            repos,
            cfg,
            paths,
            weeded,
            misc,
        })
    }

    /// Whether a previous weed's deletion phase is pending.
    pub fn resumable(&self) -> bool {
        !self.weeded.is_empty()
    }

    /// Performs a weed. Completes a previous incomplete weed first if one
    /// exists and returns true in that case; otherwise marks and deletes
    /// per the instructions and returns false.
    pub fn weed(&mut self, args: &WeedArgs) -> Result<bool> {
        let mut del_status = args.del_status;
        let mut resumed = false;
        let mut new_log_ver = None;

        if self.weeded.is_empty() {
            let Some(instr_roots) = &args.instr_roots else {
                info!("no new weed instructions given; nothing to do");
                return Ok(false);
            };

            info!("weeder.mark.phase_start");
            let outcome = mark::run_mark(
                self.cache,
                self.repos,
                self.cfg,
                &self.paths,
                instr_roots,
                args.keep_secs,
                args.print_roots,
            )?;
            info!(
                marked = outcome.marked_total,
                weeded = outcome.weeded.cardinality(),
                "weeder.mark.phase_done"
            );

            new_log_ver = Some(outcome.new_log_ver);
            self.weeded = outcome.weeded;
            self.misc = Some(MiscVars {
                start_time: outcome.start_time,
                keep_time: outcome.keep_time,
                dis_short_id: outcome.dis_short_id,
                marked_roots: outcome.marked_roots,
            });
            // Misc vars first, so the weeded write below is the single
            // commit point for the whole mark phase.
            stable::write_misc_vars(&self.paths, self.misc.as_ref().expect("just set"))?;

            query_del_status(&mut del_status);
            if del_status == DeletionStatus::DoDeletions {
                stable::write_weeded(&self.paths, &self.weeded)?;
            }
        } else {
            warn!("resuming a previous incomplete weed");
            resumed = true;
            query_del_status(&mut del_status);
        }

        if del_status == DeletionStatus::DoDeletions {
            info!("weeder.deletion.phase_start");
            let vars = self.misc.as_ref().expect("misc vars present when deleting");
            deletion::run_deletion(
                self.cache,
                self.repos,
                self.cfg,
                &self.paths,
                &mut self.weeded,
                vars,
                new_log_ver,
            )?;
            info!("weeder.deletion.phase_done");
        } else {
            // Without deletions an incomplete weed stays incomplete.
            resumed = false;
        }
        Ok(resumed)
    }
}

/// Resolves `QueryDeletions` by asking on stdin.
fn query_del_status(status: &mut DeletionStatus) {
    let stdin = std::io::stdin();
    while *status == DeletionStatus::QueryDeletions {
        eprint!("Proceed to weeder deletion phase (yes/no)? ");
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            *status = DeletionStatus::NoDeletions;
            break;
        }
        match line.trim() {
            "yes" => *status = DeletionStatus::DoDeletions,
            "no" => *status = DeletionStatus::NoDeletions,
            _ => eprintln!("Please answer \"yes\" or \"no\"."),
        }
    }
}
