//! Core identifier types and the crate-wide error enum.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PodaError>;

/// Errors surfaced by the log, allocator, and weeder subsystems.
///
/// `Inconsistent` marks a checked invariant violation between the weeder's
/// stable state and the cache's graph log; the CLI maps it to exit status 1
/// together with a remediation hint.
#[derive(Debug, Error)]
pub enum PodaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{op} got \"{source}\"")]
    Sys {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("{0}")]
    InvalidOwned(String),
    #[error("repository error in {op}: {msg}")]
    Repos { op: &'static str, msg: String },
    #[error("cache/weeder metadata inconsistency: {0}")]
    Inconsistent(String),
}

impl PodaError {
    pub(crate) fn sys(op: &'static str, source: io::Error) -> Self {
        PodaError::Sys { op, source }
    }
}

/// Cache index: names one memoized function call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ci(pub u32);

impl fmt::Display for Ci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Short identifier: a 32-bit handle naming an immutable file or directory
/// in content-addressed storage. The null id (0) never names anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShortId(pub u32);

impl ShortId {
    pub const NULL: ShortId = ShortId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Derived index: the ShortId of a derived file.
pub type Di = ShortId;

/// Model identifier: the ShortId of the model a cache entry was built from.
pub type Model = u32;

/// Fixed-width opaque content tag.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub const BYTES: usize = 16;

    pub fn from_bytes(b: [u8; 16]) -> Self {
        Fingerprint(b)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(self.0))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
