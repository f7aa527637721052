//! PrefixTbl -- a compact table of pathnames sharing common prefixes.
//!
//! Each pathname in the table is identified by a nonnegative integer. A
//! pathname is stored as its last arc plus the index of its prefix, so a
//! set of names under a few directories costs little more than the arcs
//! themselves. Two pickled formats exist: the current one with 32-bit
//! prefix indices, and a legacy one with 16-bit indices that can only
//! represent tables of at most 65535 arcs.

use std::io::{Read, Write};

use rustc_hash::FxHashMap;

use crate::types::{PodaError, Result};

/// Index value marking the end of a prefix chain.
pub const END_MARKER: u32 = u32::MAX;
const END_MARKER_SM: u16 = u16::MAX;
/// Largest arc count the legacy 16-bit format can hold.
pub const SMALL_MAX: u32 = 0xffff;

/// Client-side helper table used while building a `PrefixTbl`; pass the
/// same (initially empty) table to every `put` on one `PrefixTbl`.
pub type PutTbl = FxHashMap<String, u32>;

/// A compact set of pathnames keyed by integer identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrefixTbl {
    prefix: Vec<u32>,
    arcs: Vec<String>,
}

impl PrefixTbl {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of arcs (== assigned identifiers) in the table.
    pub fn num_arcs(&self) -> u32 {
        self.arcs.len() as u32
    }

    /// The index of the prefix of the name `idx`, or [`END_MARKER`] for a
    /// single-arc name.
    pub fn prefix_index(&self, idx: u32) -> u32 {
        self.prefix
            .get(idx as usize)
            .copied()
            .unwrap_or(END_MARKER)
    }

    /// The last arc of the name `idx`.
    pub fn arc(&self, idx: u32) -> &str {
        &self.arcs[idx as usize]
    }

    /// Inserts `path` (arcs separated by `/`) and returns its identifier.
    /// `tbl` must be the helper table dedicated to this `PrefixTbl`.
    pub fn put(&mut self, path: &str, tbl: &mut PutTbl) -> Result<u32> {
        let mut prefix_idx = END_MARKER;
        let mut so_far = String::new();
        for arc in path.split('/') {
            if !so_far.is_empty() {
                so_far.push('/');
            }
            so_far.push_str(arc);
            prefix_idx = match tbl.get(&so_far) {
                Some(&idx) => idx,
                None => {
                    let idx = self.add_arc(arc, prefix_idx)?;
                    tbl.insert(so_far.clone(), idx);
                    idx
                }
            };
        }
        Ok(prefix_idx)
    }

    /// Reconstructs the pathname with identifier `idx`.
    pub fn get(&self, idx: u32) -> Result<String> {
        if idx as usize >= self.arcs.len() {
            return Err(PodaError::Invalid("prefix table index out of range"));
        }
        let mut parts: Vec<&str> = Vec::new();
        let mut cur = idx;
        loop {
            parts.push(&self.arcs[cur as usize]);
            cur = self.prefix[cur as usize];
            if cur == END_MARKER {
                break;
            }
            if cur as usize >= self.arcs.len() {
                return Err(PodaError::Corruption("prefix chain out of range".into()));
            }
        }
        parts.reverse();
        Ok(parts.join("/"))
    }

    fn add_arc(&mut self, arc: &str, prefix_idx: u32) -> Result<u32> {
        let idx = self.arcs.len() as u32;
        if idx == END_MARKER {
            return Err(PodaError::Invalid("prefix table full"));
        }
        self.arcs.push(arc.to_string());
        self.prefix.push(prefix_idx);
        Ok(idx)
    }

    /// True when the legacy 16-bit format can represent this table.
    pub fn can_write_old(&self) -> bool {
        self.num_arcs() <= SMALL_MAX
    }

    /// Pickles the table. With `old_format`, prefix indices are written as
    /// 16 bits; tables beyond [`SMALL_MAX`] arcs are refused.
    pub fn write_to(&self, w: &mut impl Write, old_format: bool) -> Result<()> {
        if old_format {
            if !self.can_write_old() {
                return Err(PodaError::InvalidOwned(format!(
                    "prefix table with {} arcs exceeds the 16-bit format",
                    self.num_arcs()
                )));
            }
            w.write_all(&(self.num_arcs() as u16).to_be_bytes())?;
        } else {
            w.write_all(&self.num_arcs().to_be_bytes())?;
        }
        for i in 0..self.arcs.len() {
            if old_format {
                let idx = match self.prefix[i] {
                    END_MARKER => END_MARKER_SM,
                    idx => idx as u16,
                };
                w.write_all(&idx.to_be_bytes())?;
            } else {
                w.write_all(&self.prefix[i].to_be_bytes())?;
            }
            let arc = self.arcs[i].as_bytes();
            if arc.len() > u16::MAX as usize {
                return Err(PodaError::Invalid("pathname arc too long"));
            }
            w.write_all(&(arc.len() as u16).to_be_bytes())?;
            w.write_all(arc)?;
        }
        Ok(())
    }

    /// Reads a table previously written with [`PrefixTbl::write_to`] in
    /// the matching format.
    pub fn read_from(r: &mut impl Read, old_format: bool) -> Result<Self> {
        let num_arcs = if old_format {
            u32::from(read_u16(r)?)
        } else {
            read_u32(r)?
        };
        let mut tbl = PrefixTbl::new();
        for _ in 0..num_arcs {
            let prefix = if old_format {
                match read_u16(r)? {
                    END_MARKER_SM => END_MARKER,
                    idx => u32::from(idx),
                }
            } else {
                read_u32(r)?
            };
            let arc_len = read_u16(r)? as usize;
            let mut arc = vec![0u8; arc_len];
            r.read_exact(&mut arc)?;
            let arc = String::from_utf8(arc)
                .map_err(|_| PodaError::Corruption("non-UTF-8 arc in prefix table".into()))?;
            if prefix != END_MARKER && prefix as usize >= tbl.arcs.len() {
                return Err(PodaError::Corruption(
                    "forward prefix reference in prefix table".into(),
                ));
            }
            tbl.arcs.push(arc);
            tbl.prefix.push(prefix);
        }
        Ok(tbl)
    }
}

fn read_u16(r: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
