//! Deletion sweep over the ShortId storage tree.
//!
//! Given the sorted list of ShortIds to keep and a lease timestamp, the
//! sweep walks the storage tree depth-first in hex order. At the leaf
//! level it deletes every file whose ShortId is not on the keep list and
//! whose change time predates the lease, recording each deletion and its
//! size; directories emptied by the sweep are removed.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, warn};

use crate::shortid::{parse_hex_arc, DIR_FLAG};
use crate::types::{PodaError, Result, ShortId};

/// Hex digits per pathname arc at each level of the storage tree.
const CHARS_PER_ARC: [usize; 3] = [3, 3, 2];

/// Outcome of one deletion sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deleted_count: u32,
    pub deleted_space: u64,
}

/// Cursor over the sorted keep list, skipping null entries.
struct KeepStream<'a> {
    sids: &'a [ShortId],
    pos: usize,
    cur: Option<ShortId>,
}

impl<'a> KeepStream<'a> {
    fn new(sids: &'a [ShortId]) -> KeepStream<'a> {
        let mut stream = KeepStream {
            sids,
            pos: 0,
            cur: None,
        };
        stream.advance();
        stream
    }

    fn advance(&mut self) {
        self.cur = loop {
            match self.sids.get(self.pos) {
                Some(sid) => {
                    self.pos += 1;
                    if sid.is_null() {
                        warn!("null ShortId on keep list");
                        continue;
                    }
                    break Some(*sid);
                }
                None => break None,
            }
        };
    }
}

/// Deletes every leaf file in `sid_dir` whose ShortId is absent from
/// `keep` (sorted ascending) and whose change time is older than `lease`.
/// Each deleted ShortId is written to `deleted_out`, one per line.
pub fn delete_all_short_ids_but(
    sid_dir: &Path,
    keep: &[ShortId],
    lease: u64,
    deleted_out: &mut impl Write,
) -> Result<SweepStats> {
    debug_assert!(keep.windows(2).all(|w| w[0] <= w[1]), "keep list unsorted");
    let mut stream = KeepStream::new(keep);
    let mut stats = SweepStats::default();
    scan_dir(0, sid_dir, 0, &mut stream, lease, deleted_out, &mut stats)?;
    Ok(stats)
}

/// Scans one directory level. Returns the number of entries remaining
/// beneath it after deletions.
#[allow(clippy::too_many_arguments)]
fn scan_dir(
    level: usize,
    dir: &Path,
    dirnum: u32,
    keep: &mut KeepStream<'_>,
    lease: u64,
    deleted_out: &mut impl Write,
    stats: &mut SweepStats,
) -> Result<usize> {
    let arc_len = CHARS_PER_ARC[level];
    let mut arcs: Vec<u32> = Vec::new();
    let entries =
        fs::read_dir(dir).map_err(|e| PodaError::sys("open shortid storage directory", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PodaError::sys("scan shortid storage directory", e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(val) = parse_hex_arc(name, arc_len) {
            arcs.push(val);
        }
    }
    arcs.sort_unstable();

    let mut kept = arcs.len();
    if level + 1 == CHARS_PER_ARC.len() {
        // Bottom level: file deletions happen here.
        for val in arcs {
            let cursid = ShortId((dirnum << (arc_len * 4)) | val);
            while let Some(next) = keep.cur {
                if cursid <= next {
                    break;
                }
                if next.0 & DIR_FLAG != 0 {
                    debug!(sid = %next, "sweep.directory");
                } else {
                    warn!(sid = %next, "keep-listed ShortId missing from storage");
                }
                keep.advance();
            }
            if keep.cur == Some(cursid) {
                debug!(sid = %cursid, "sweep.listed");
                keep.advance();
                continue;
            }
            let path = dir.join(format!("{val:02x}"));
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Raced with an eager deletion of this sid.
                    kept -= 1;
                    continue;
                }
                Err(e) => return Err(PodaError::sys("stat shortid file", e)),
            };
            if change_time(&meta) < lease as i64 {
                debug!(sid = %cursid, "sweep.garbage");
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(PodaError::sys("unlink shortid file", e)),
                }
                writeln!(deleted_out, "{cursid}")?;
                stats.deleted_count += 1;
                stats.deleted_space += file_space(&meta);
                kept -= 1;
            } else {
                debug!(sid = %cursid, "sweep.leased");
            }
        }
    } else {
        for val in arcs {
            let subdir = dir.join(format!("{val:0width$x}", width = arc_len));
            let subdirnum = (dirnum << (arc_len * 4)) | val;
            let remaining = scan_dir(
                level + 1,
                &subdir,
                subdirnum,
                keep,
                lease,
                deleted_out,
                stats,
            )?;
            if remaining == 0 {
                debug!(dir = %subdir.display(), "sweep.rmdir");
                fs::remove_dir(&subdir).map_err(|e| PodaError::sys("rmdir shortid directory", e))?;
                kept -= 1;
            }
        }
    }
    Ok(kept)
}

#[cfg(unix)]
fn change_time(meta: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime()
}

#[cfg(not(unix))]
fn change_time(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Bytes of storage occupied, in 512-byte block units where available.
#[cfg(unix)]
fn file_space(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.blocks() * 512
}

#[cfg(not(unix))]
fn file_space(meta: &fs::Metadata) -> u64 {
    meta.len()
}
