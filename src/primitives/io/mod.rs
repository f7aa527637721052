use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};

use crate::types::{PodaError, Result};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes from the file at the specified offset.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Reads up to `dst.len()` bytes at the specified offset and returns the
    /// number of bytes read. A short count means end of file.
    fn read_at_len(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
/// Unix-specific file I/O operations using POSIX APIs.
mod stdio_unix {
    use std::{fs::File, io, os::unix::fs::FileExt, os::unix::io::AsRawFd};

    pub fn read_some(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<usize> {
        let mut total = 0usize;
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                break;
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
            total += read;
        }
        Ok(total)
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    /// Takes an advisory lock on `file`, shared unless `exclusive`.
    /// Fails immediately with `WouldBlock` on conflict.
    pub fn advisory_lock(file: &File, exclusive: bool) -> io::Result<()> {
        let op = if exclusive {
            libc::LOCK_EX | libc::LOCK_NB
        } else {
            libc::LOCK_SH | libc::LOCK_NB
        };
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Windows-specific file I/O operations.
mod stdio_win {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_some(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<usize> {
        let mut total = 0usize;
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                break;
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
            total += read;
        }
        Ok(total)
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Creates a new StdFileIo from an existing File handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(PodaError::from)?;
        Ok(Self::new(file))
    }

    /// Opens a file for read-only access; fails if it does not exist.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).map_err(PodaError::from)?;
        Ok(Self::new(file))
    }

    pub fn file(&self) -> &File {
        &self.inner
    }

    #[cfg(unix)]
    fn read_some(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_unix::read_some(self.file(), off, dst)
    }

    #[cfg(windows)]
    fn read_some(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_win::read_some(self.file(), off, dst)
    }

    #[cfg(unix)]
    fn write_all_at(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(self.file(), off, src)
    }

    #[cfg(windows)]
    fn write_all_at(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(self.file(), off, src)
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let n = self.read_some(off, dst).map_err(PodaError::from)?;
        if n < dst.len() {
            return Err(PodaError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at reached EOF",
            )));
        }
        Ok(())
    }

    fn read_at_len(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        self.read_some(off, dst).map_err(PodaError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.write_all_at(off, src).map_err(PodaError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(PodaError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file().metadata().map_err(PodaError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file().set_len(len).map_err(PodaError::from)
    }
}

/// Takes an advisory lock on `file` (shared unless `exclusive`), failing
/// immediately on conflict. On platforms without flock the lock degrades to
/// a no-op; the cache server still refuses concurrent weeds.
pub fn advisory_lock(file: &File, exclusive: bool) -> Result<()> {
    #[cfg(unix)]
    {
        return stdio_unix::advisory_lock(file, exclusive).map_err(PodaError::from);
    }
    #[allow(unreachable_code)]
    {
        let _ = (file, exclusive);
        Ok(())
    }
}
