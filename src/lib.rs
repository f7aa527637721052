//! # Poda - Build-Cache Weeder
//!
//! Poda is the liveness-analysis and reclamation engine for an embedded,
//! content-addressed build cache. Given a set of "keep" instructions it
//! marks the cache entries and derived files still reachable from kept
//! build roots, then atomically prunes everything else from the cache's
//! graph log while staying recoverable across a crash at any point.
//!
//! ## Architecture
//!
//! Poda is built from a few layered subsystems:
//! - **Primitives**: a crash-safe block-structured append [`Log`] with
//!   checkpointing and optional synchronous backup, the [`BitVector`]
//!   used for every set of cache indices, and a compact pathname
//!   [`PrefixTbl`].
//! - **Graph log**: typed [`Root`]/`Node` records describing cache-entry
//!   provenance, plus the bounded [`NodeBuffer`] used while marking.
//! - **ShortId allocator**: leased blocks of 256 identifiers naming
//!   immutable files, reclaimed by a background landlord task.
//! - **Weeder**: the mark and deletion engines driven by the outer
//!   [`Weeder`] controller, with all intermediate state written through
//!   stable files so an interrupted weed resumes instead of corrupting.

pub mod cache;
pub mod graphlog;
pub mod primitives;
pub mod repos;
pub mod shortid;
pub mod types;
pub mod weeder;

// Re-export the main public API
pub use crate::cache::{CacheServer, LocalCache, PkPrefix};
pub use crate::graphlog::{Entry, NodeBuffer, Root};
pub use crate::primitives::bitvec::BitVector;
pub use crate::primitives::log::{Log, LogSeq, OpenOptions};
pub use crate::primitives::prefix::PrefixTbl;
pub use crate::repos::{LocalRepository, Repository};
pub use crate::shortid::{LeaseExpiry, ShortIdAllocator, ShortIdBlock};
pub use crate::types::{Ci, Di, Fingerprint, Model, PodaError, Result, ShortId};
pub use crate::weeder::{PkgBuild, RootTbl, WeedArgs, Weeder, WeederConfig};
