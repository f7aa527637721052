//! Graph-log entries describing cache-entry provenance.
//!
//! The graph log is an append-only stream of two record kinds. A `Node`
//! describes one cache entry: its cache index, primary-key fingerprint,
//! model, child entries, and the derived files it reaches directly. A
//! `Root` names the set of entries constituting one top-level build
//! result. A later `done=true` root supersedes earlier `done=false` roots
//! for the same package build.
//!
//! Records are pickled identically to the log, to checkpoint files, and to
//! the weeder's pending files, so one reader serves all three.

pub mod buffer;

pub use buffer::NodeBuffer;

use std::io::Write;

use crate::primitives::log::RecordSource;
use crate::types::{Ci, Di, Fingerprint, Model, PodaError, Result};

const ROOT_KIND: u32 = 0;
const NODE_KIND: u32 = 1;

/// One graph-log record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    Root(Root),
    Node(Node),
}

/// A top-level build result: the package-directory fingerprint and model
/// identify the build, `cis` are its exposed cache entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Root {
    pub pkg_fp: Fingerprint,
    pub model: Model,
    /// Creation time, pickled as 32 bits independent of the host time
    /// representation.
    pub ts: i64,
    pub cis: Vec<Ci>,
    pub done: bool,
}

/// One cache entry: `loc` is the primary-key fingerprint, `kids` the child
/// entries, `refs` the derived indices reachable directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub ci: Ci,
    pub loc: Fingerprint,
    pub model: Model,
    pub kids: Vec<Ci>,
    pub refs: Vec<Di>,
}

impl Entry {
    /// Reads one entry, dispatching on the leading kind tag. A tag that is
    /// valid only after byte swapping points at a log written by a machine
    /// of the other byte order, and says so.
    pub fn read(src: &mut impl RecordSource) -> Result<Entry> {
        let kind = read_u32(src)?;
        match kind {
            ROOT_KIND => Ok(Entry::Root(Root::read_body(src)?)),
            NODE_KIND => Ok(Entry::Node(Node::read_body(src)?)),
            other => {
                let mut msg = String::from("invalid graph log entry kind");
                if matches!(other.swap_bytes(), ROOT_KIND | NODE_KIND) {
                    msg.push_str(
                        " (maybe the graph log was written by a machine of a different byte order?)",
                    );
                }
                Err(PodaError::Corruption(msg))
            }
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        match self {
            Entry::Root(root) => root.write_to(w),
            Entry::Node(node) => node.write_to(w),
        }
    }
}

impl Root {
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&ROOT_KIND.to_le_bytes())?;
        w.write_all(self.pkg_fp.as_bytes())?;
        w.write_all(&self.model.to_le_bytes())?;
        w.write_all(&(self.ts as i32).to_le_bytes())?;
        write_list(w, &self.cis)?;
        w.write_all(&[u8::from(self.done)])?;
        Ok(())
    }

    fn read_body(src: &mut impl RecordSource) -> Result<Root> {
        let pkg_fp = read_fp(src)?;
        let model = read_u32(src)?;
        let ts = i64::from(read_u32(src)? as i32);
        let cis = read_ci_list(src)?;
        let mut done = [0u8; 1];
        src.read_exact(&mut done)?;
        Ok(Root {
            pkg_fp,
            model,
            ts,
            cis,
            done: done[0] != 0,
        })
    }
}

impl Node {
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&NODE_KIND.to_le_bytes())?;
        w.write_all(&self.ci.0.to_le_bytes())?;
        w.write_all(self.loc.as_bytes())?;
        w.write_all(&self.model.to_le_bytes())?;
        write_list(w, &self.kids)?;
        write_list(w, &self.refs)?;
        Ok(())
    }

    fn read_body(src: &mut impl RecordSource) -> Result<Node> {
        let ci = Ci(read_u32(src)?);
        let loc = read_fp(src)?;
        let model = read_u32(src)?;
        let kids = read_ci_list(src)?;
        let refs = read_di_list(src)?;
        Ok(Node {
            ci,
            loc,
            model,
            kids,
            refs,
        })
    }
}

/// The reduced node form written to the weeder's pending overflow file:
/// only the fields the mark phase needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlNode {
    pub ci: Ci,
    pub kids: Vec<Ci>,
    pub refs: Vec<Di>,
}

impl GlNode {
    pub fn of(node: &Node) -> GlNode {
        GlNode {
            ci: node.ci,
            kids: node.kids.clone(),
            refs: node.refs.clone(),
        }
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&self.ci.0.to_le_bytes())?;
        write_list(w, &self.kids)?;
        write_list(w, &self.refs)?;
        Ok(())
    }

    pub fn read(src: &mut impl RecordSource) -> Result<GlNode> {
        let ci = Ci(read_u32(src)?);
        let kids = read_ci_list(src)?;
        let refs = read_di_list(src)?;
        Ok(GlNode { ci, kids, refs })
    }
}

fn read_u32(src: &mut impl RecordSource) -> Result<u32> {
    let mut buf = [0u8; 4];
    src.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_fp(src: &mut impl RecordSource) -> Result<Fingerprint> {
    let mut buf = [0u8; Fingerprint::BYTES];
    src.read_exact(&mut buf)?;
    Ok(Fingerprint::from_bytes(buf))
}

fn write_list<T: ListItem>(w: &mut impl Write, items: &[T]) -> Result<()> {
    w.write_all(&(items.len() as i32).to_le_bytes())?;
    for item in items {
        w.write_all(&item.raw().to_le_bytes())?;
    }
    Ok(())
}

fn read_list<T: ListItem>(src: &mut impl RecordSource) -> Result<Vec<T>> {
    let len = read_u32(src)? as i32;
    if len < 0 {
        return Err(PodaError::Corruption("negative list length".into()));
    }
    let mut out = Vec::with_capacity(len as usize);
    for _ in 0..len {
        out.push(T::from_raw(read_u32(src)?));
    }
    Ok(out)
}

fn read_ci_list(src: &mut impl RecordSource) -> Result<Vec<Ci>> {
    read_list(src)
}

fn read_di_list(src: &mut impl RecordSource) -> Result<Vec<Di>> {
    read_list(src)
}

trait ListItem {
    fn raw(&self) -> u32;
    fn from_raw(raw: u32) -> Self;
}

impl ListItem for Ci {
    fn raw(&self) -> u32 {
        self.0
    }

    fn from_raw(raw: u32) -> Self {
        Ci(raw)
    }
}

impl ListItem for Di {
    fn raw(&self) -> u32 {
        self.0
    }

    fn from_raw(raw: u32) -> Self {
        crate::types::ShortId(raw)
    }
}
