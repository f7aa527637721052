//! Stable-variable I/O.
//!
//! The weeder keeps three stable files in its metadata directory: the
//! `weeded` bit vector, the miscellaneous variables written at the end of
//! the mark phase, and the transient pending/working graph-log files.
//! Every write goes through a temporary file, fsync, and rename, so a
//! reader never observes partial content.

use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::primitives::bitvec::BitVector;
use crate::types::{PodaError, Result, ShortId};
use crate::weeder::roots::RootTbl;

const WEEDED_FILE: &str = "weeded";
const MISC_VARS_FILE: &str = "misc_vars";
const PENDING_GL_FILE: &str = "pending.gl";
const WORKING_GL_FILE: &str = "working.gl";

/// The weeder's stable file locations inside one metadata directory.
#[derive(Clone, Debug)]
pub struct StablePaths {
    md_dir: PathBuf,
}

impl StablePaths {
    pub fn new(md_dir: impl AsRef<Path>) -> Result<StablePaths> {
        let md_dir = md_dir.as_ref().to_path_buf();
        fs::create_dir_all(&md_dir).map_err(|e| PodaError::sys("create weeder md dir", e))?;
        Ok(StablePaths { md_dir })
    }

    pub fn weeded(&self) -> PathBuf {
        self.md_dir.join(WEEDED_FILE)
    }

    pub fn misc_vars(&self) -> PathBuf {
        self.md_dir.join(MISC_VARS_FILE)
    }

    pub fn pending_gl(&self) -> PathBuf {
        self.md_dir.join(PENDING_GL_FILE)
    }

    pub fn working_gl(&self) -> PathBuf {
        self.md_dir.join(WORKING_GL_FILE)
    }

    pub fn md_dir(&self) -> &Path {
        &self.md_dir
    }

    /// Removes the transient pending/working files; absence is fine.
    pub fn unlink_transient(&self) {
        let _ = fs::remove_file(self.pending_gl());
        let _ = fs::remove_file(self.working_gl());
    }

    fn write_atomic(&self, path: &Path, body: impl FnOnce(&mut File) -> Result<()>) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.md_dir)
            .map_err(|e| PodaError::sys("create stable temp file", e))?;
        body(tmp.as_file_mut())?;
        tmp.as_file().sync_all().map_err(|e| PodaError::sys("fsync stable file", e))?;
        tmp.persist(path)
            .map_err(|e| PodaError::sys("rename stable file", e.error))?;
        Ok(())
    }
}

/// Reads the stable weeded set; an absent file is an empty set.
pub fn read_weeded(paths: &StablePaths) -> Result<BitVector> {
    match File::open(paths.weeded()) {
        Ok(f) => BitVector::read_from(&mut BufReader::new(f)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BitVector::new()),
        Err(e) => Err(PodaError::sys("open weeded file", e)),
    }
}

/// Atomically replaces the stable weeded set.
pub fn write_weeded(paths: &StablePaths, weeded: &BitVector) -> Result<()> {
    debug!(weeded = weeded.cardinality(), "weeder.stable.write_weeded");
    paths.write_atomic(&paths.weeded(), |f| weeded.write_to(f))
}

/// The variables recorded at the end of the mark phase, needed by a
/// (possibly resumed) deletion phase.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiscVars {
    pub start_time: i64,
    pub keep_time: i64,
    pub dis_short_id: ShortId,
    pub marked_roots: RootTbl,
}

/// Reads the stable miscellaneous variables; absent means no mark phase
/// has committed.
pub fn read_misc_vars(paths: &StablePaths) -> Result<Option<MiscVars>> {
    let f = match File::open(paths.misc_vars()) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PodaError::sys("open misc vars file", e)),
    };
    let mut r = BufReader::new(f);
    let start_time = i64::from(read_i32(&mut r)?);
    let keep_time = i64::from(read_i32(&mut r)?);
    let mut dis = [0u8; 4];
    r.read_exact(&mut dis)?;
    let marked_roots = RootTbl::read_from(&mut r)?;
    Ok(Some(MiscVars {
        start_time,
        keep_time,
        dis_short_id: ShortId(u32::from_le_bytes(dis)),
        marked_roots,
    }))
}

/// Atomically replaces the stable miscellaneous variables. Must happen
/// before the weeded set is committed, so a resumed deletion phase always
/// finds them.
pub fn write_misc_vars(paths: &StablePaths, vars: &MiscVars) -> Result<()> {
    debug!(
        start_time = vars.start_time,
        dis = %vars.dis_short_id,
        roots = vars.marked_roots.len(),
        "weeder.stable.write_misc_vars"
    );
    paths.write_atomic(&paths.misc_vars(), |f| {
        f.write_all(&(vars.start_time as i32).to_le_bytes())?;
        f.write_all(&(vars.keep_time as i32).to_le_bytes())?;
        f.write_all(&vars.dis_short_id.0.to_le_bytes())?;
        vars.marked_roots.write_to(f)
    })
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}
