//! Replay cursor over a checkpoint file followed by successive log
//! generations.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::primitives::log::{Log, OpenOptions};
use crate::types::{PodaError, Result};

/// A source of pickled records: exact reads plus a clean end-of-data test.
/// Implemented by the [`Log`] itself and by checkpoint-file readers, so
/// replay code is agnostic about which one it is consuming.
pub trait RecordSource {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn at_eof(&mut self) -> Result<bool>;
}

impl RecordSource for Log {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Log::read_exact(self, buf)
    }

    fn at_eof(&mut self) -> Result<bool> {
        Log::at_eof(self)
    }
}

/// Buffered reader over a checkpoint file.
pub struct CkptReader {
    inner: BufReader<File>,
}

impl CkptReader {
    pub fn new(file: File) -> Self {
        CkptReader {
            inner: BufReader::new(file),
        }
    }
}

impl RecordSource for CkptReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Read::read_exact(&mut self.inner, buf).map_err(PodaError::from)
    }

    fn at_eof(&mut self) -> Result<bool> {
        Ok(self.inner.fill_buf().map_err(PodaError::from)?.is_empty())
    }
}

impl Read for CkptReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

/// A reader yielded by [`LogSeq::next`]: either the checkpoint file the
/// sequence starts from, or one log generation.
pub enum SeqReader<'a> {
    Ckpt(CkptReader),
    Log(&'a mut Log),
}

impl SeqReader<'_> {
    /// The generation number when this reader covers a log file; `None`
    /// for the checkpoint reader.
    pub fn log_version(&self) -> Option<u32> {
        match self {
            SeqReader::Ckpt(_) => None,
            SeqReader::Log(l) => Some(l.log_version()),
        }
    }
}

impl RecordSource for SeqReader<'_> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            SeqReader::Ckpt(r) => RecordSource::read_exact(r, buf),
            SeqReader::Log(l) => Log::read_exact(l, buf),
        }
    }

    fn at_eof(&mut self) -> Result<bool> {
        match self {
            SeqReader::Ckpt(r) => r.at_eof(),
            SeqReader::Log(l) => Log::at_eof(l),
        }
    }
}

/// Cursor yielding the checkpoint file (if any) and then each subsequent
/// log generation, stopping before an exclusive upper version bound.
pub struct LogSeq {
    dir: PathBuf,
    log: Option<Log>,
    read_ckpt: bool,
    yielded_log: bool,
}

impl LogSeq {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        LogSeq {
            dir: dir.as_ref().to_path_buf(),
            log: None,
            read_ckpt: false,
            yielded_log: false,
        }
    }

    /// Opens the underlying log at checkpoint version `ver` (`None` means
    /// the highest committed checkpoint).
    pub fn open(&mut self, ver: Option<u32>, readonly: bool) -> Result<()> {
        if self.log.is_some() {
            return Err(PodaError::Invalid("log sequence already open"));
        }
        let opts = OpenOptions {
            version: ver,
            readonly,
            ..Default::default()
        };
        self.log = Some(Log::open(&self.dir, opts)?);
        self.read_ckpt = false;
        self.yielded_log = false;
        Ok(())
    }

    /// Returns the next reader in the sequence: first the checkpoint file
    /// (skipped when starting from generation 0), then one reader per log
    /// generation while the generation number stays below `end_ver`.
    /// Returns `None` when the sequence is exhausted.
    pub fn next(&mut self, end_ver: Option<u32>) -> Result<Option<SeqReader<'_>>> {
        let log = self
            .log
            .as_mut()
            .ok_or(PodaError::Invalid("log sequence not open"))?;

        if !self.read_ckpt {
            self.read_ckpt = true;
            if let Some(f) = log.open_checkpoint()? {
                return Ok(Some(SeqReader::Ckpt(CkptReader::new(f))));
            }
        }

        let below_end = |log: &Log| end_ver.map_or(true, |e| log.log_version() < e);
        if !self.yielded_log {
            if below_end(log) {
                self.yielded_log = true;
                return Ok(Some(SeqReader::Log(log)));
            }
        } else if log.next_log()? && below_end(log) {
            return Ok(Some(SeqReader::Log(log)));
        }
        Ok(None)
    }

    /// The version of the log generation currently yielded.
    pub fn cur_log_version(&self) -> Result<u32> {
        match &self.log {
            Some(log) => Ok(log.log_version()),
            None => Err(PodaError::Invalid("log sequence not open")),
        }
    }

    /// Releases the underlying log handle and checkpoint stream.
    pub fn close(&mut self) {
        self.log = None;
        self.read_ckpt = false;
        self.yielded_log = false;
    }

    pub fn is_open(&self) -> bool {
        self.log.is_some()
    }
}
