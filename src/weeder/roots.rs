//! Package-build identities and the tables of roots keyed by them.

use std::io::{Read, Write};

use rustc_hash::FxHashMap;

use crate::types::{Fingerprint, Model, PodaError, Result};

/// Identifies one build of one package version: the fingerprint of the
/// versioned package directory plus the ShortId of the model built.
/// Equality is field-wise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PkgBuild {
    pub pkg_fp: Fingerprint,
    pub model: Model,
}

impl PkgBuild {
    pub fn new(pkg_fp: Fingerprint, model: Model) -> PkgBuild {
        PkgBuild { pkg_fp, model }
    }
}

impl std::fmt::Display for PkgBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pkg {} model {:08x}", self.pkg_fp, self.model)
    }
}

/// A table of package builds with a boolean status per entry. The weeder
/// keeps two: the roots named by the instructions, and the roots actually
/// marked (status = explicitly instructed, as opposed to kept by age).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RootTbl {
    tbl: FxHashMap<PkgBuild, bool>,
}

impl RootTbl {
    pub fn new() -> RootTbl {
        RootTbl::default()
    }

    pub fn len(&self) -> usize {
        self.tbl.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tbl.is_empty()
    }

    pub fn contains(&self, pkg: &PkgBuild) -> bool {
        self.tbl.contains_key(pkg)
    }

    pub fn get(&self, pkg: &PkgBuild) -> Option<bool> {
        self.tbl.get(pkg).copied()
    }

    /// Inserts or replaces; returns the previous status if present.
    pub fn put(&mut self, pkg: PkgBuild, status: bool) -> Option<bool> {
        self.tbl.insert(pkg, status)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PkgBuild, bool)> {
        self.tbl.iter().map(|(pkg, &status)| (pkg, status))
    }

    /// Pickles the table: entry count, then per entry the package
    /// fingerprint, model, and a one-byte status.
    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&(self.tbl.len() as i32).to_le_bytes())?;
        for (pkg, &status) in &self.tbl {
            w.write_all(pkg.pkg_fp.as_bytes())?;
            w.write_all(&pkg.model.to_le_bytes())?;
            w.write_all(&[u8::from(status)])?;
        }
        Ok(())
    }

    pub fn read_from(r: &mut impl Read) -> Result<RootTbl> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let len = i32::from_le_bytes(len_buf);
        if len < 0 {
            return Err(PodaError::Corruption("negative root table length".into()));
        }
        let mut tbl = RootTbl::new();
        for _ in 0..len {
            let mut fp = [0u8; Fingerprint::BYTES];
            r.read_exact(&mut fp)?;
            let mut model = [0u8; 4];
            r.read_exact(&mut model)?;
            let mut status = [0u8; 1];
            r.read_exact(&mut status)?;
            let pkg = PkgBuild::new(Fingerprint::from_bytes(fp), u32::from_le_bytes(model));
            if tbl.put(pkg, status[0] != 0).is_some() {
                return Err(PodaError::Corruption("duplicate root table entry".into()));
            }
        }
        Ok(tbl)
    }
}
