//! The derived-indices keep file.
//!
//! The mark phase appends one hex ShortId per line for every derived file
//! that must survive the weed. The file is itself a derived file, and its
//! own ShortId is its first line so the sweep keeps it too. A small
//! bounded LRU of recently written ids suppresses most duplicates; exact
//! dedup is not required for correctness, only for file size.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::repos::Repository;
use crate::types::{Di, Result, ShortId};

pub struct DisFile {
    sid: ShortId,
    out: BufWriter<File>,
    recent: LruCache<u32, ()>,
    written: u64,
}

impl DisFile {
    /// Creates a fresh keep file in the repository; its first line is the
    /// file's own ShortId.
    pub fn create(repos: &dyn Repository, dedup_size: usize) -> Result<DisFile> {
        let (sid, file) = repos.create_derived()?;
        let cap = NonZeroUsize::new(dedup_size.max(1)).expect("max(1) is nonzero");
        let mut dis = DisFile {
            sid,
            out: BufWriter::new(file),
            recent: LruCache::new(cap),
            written: 0,
        };
        dis.write(sid)?;
        Ok(dis)
    }

    pub fn sid(&self) -> ShortId {
        self.sid
    }

    /// Appends `di` unless it was written recently.
    pub fn write(&mut self, di: Di) -> Result<()> {
        if self.recent.contains(&di.0) {
            return Ok(());
        }
        self.recent.put(di.0, ());
        writeln!(self.out, "{di}")?;
        self.written += 1;
        Ok(())
    }

    /// Flushes and fsyncs the keep file, returning its ShortId.
    pub fn close(self) -> Result<ShortId> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| crate::types::PodaError::sys("flush DIs file", e.into_error()))?;
        file.sync_all()?;
        debug!(sid = %self.sid, written = self.written, "weeder.dis.close");
        Ok(self.sid)
    }
}
