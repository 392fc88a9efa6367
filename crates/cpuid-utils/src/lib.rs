// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utility functions and types for working with CPUID values.
//!
//! A guest probe sees CPUID through whatever its host chooses to report, so
//! this crate deliberately stays small: a way to name a leaf, a way to hold
//! the four output registers, a map that can stand in for a host's CPUID
//! table, and symbolic names for the bits the probe cares about.

use std::collections::BTreeMap;

use thiserror::Error;

pub mod bits;
pub mod host;

/// A CPUID leaf/subleaf pair.
///
/// Leaves without subleaves are identified with a `subleaf` of `None`. Lookups
/// in a [`CpuidSet`] fall back from an exact subleaf match to the leaf-only
/// entry, which mirrors how hardware ignores ecx for such leaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuidIdent {
    pub leaf: u32,
    pub subleaf: Option<u32>,
}

impl CpuidIdent {
    pub const fn leaf(leaf: u32) -> Self {
        Self { leaf, subleaf: None }
    }

    pub const fn subleaf(leaf: u32, subleaf: u32) -> Self {
        Self { leaf, subleaf: Some(subleaf) }
    }
}

impl std::fmt::Display for CpuidIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.subleaf {
            Some(sub) => write!(f, "{:#x}.{:#x}", self.leaf, sub),
            None => write!(f, "{:#x}", self.leaf),
        }
    }
}

/// The output registers of a single CPUID query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidValues {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl From<[u32; 4]> for CpuidValues {
    fn from(value: [u32; 4]) -> Self {
        Self { eax: value[0], ebx: value[1], ecx: value[2], edx: value[3] }
    }
}

impl From<CpuidValues> for [u32; 4] {
    fn from(value: CpuidValues) -> Self {
        [value.eax, value.ebx, value.ecx, value.edx]
    }
}

#[cfg(target_arch = "x86_64")]
impl From<core::arch::x86_64::CpuidResult> for CpuidValues {
    fn from(value: core::arch::x86_64::CpuidResult) -> Self {
        Self { eax: value.eax, ebx: value.ebx, ecx: value.ecx, edx: value.edx }
    }
}

#[derive(Debug, Error)]
pub enum CpuidMapInsertError {
    #[error("leaf {0} already has a leaf-only entry")]
    LeafOnlyConflict(CpuidIdent),

    #[error("leaf {0} already has subleaf entries")]
    SubleafConflict(CpuidIdent),
}

/// A table of CPUID values keyed by leaf and subleaf.
///
/// A leaf may carry either a single leaf-only entry or any number of subleaf
/// entries, never both.
#[derive(Clone, Debug, Default)]
pub struct CpuidSet {
    map: BTreeMap<CpuidIdent, CpuidValues>,
}

impl CpuidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `values` at `ident`, returning the entry it replaced, if any.
    pub fn insert(
        &mut self,
        ident: CpuidIdent,
        values: CpuidValues,
    ) -> Result<Option<CpuidValues>, CpuidMapInsertError> {
        let has_leaf_only =
            self.map.contains_key(&CpuidIdent::leaf(ident.leaf));
        let has_subleaves = self
            .map
            .range(
                CpuidIdent::subleaf(ident.leaf, 0)
                    ..=CpuidIdent::subleaf(ident.leaf, u32::MAX),
            )
            .next()
            .is_some();

        match ident.subleaf {
            None if has_subleaves => {
                Err(CpuidMapInsertError::SubleafConflict(ident))
            }
            Some(_) if has_leaf_only => {
                Err(CpuidMapInsertError::LeafOnlyConflict(ident))
            }
            _ => Ok(self.map.insert(ident, values)),
        }
    }

    /// Looks up the values reported for `ident`. A leaf-only entry answers
    /// queries for every subleaf of its leaf.
    pub fn get(&self, ident: CpuidIdent) -> Option<&CpuidValues> {
        self.map
            .get(&ident)
            .or_else(|| self.map.get(&CpuidIdent::leaf(ident.leaf)))
    }

    /// Looks up `ident`, answering all zeroes for leaves that are not in the
    /// set. This is what a guest observes when it queries an unimplemented
    /// leaf on a host that does not clamp out-of-range requests.
    pub fn query(&self, ident: CpuidIdent) -> CpuidValues {
        self.get(ident).copied().unwrap_or_default()
    }

    pub fn remove_leaf(&mut self, leaf: u32) {
        self.map.retain(|id, _| id.leaf != leaf);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CpuidIdent, &CpuidValues)> {
        self.map.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn leaf_only_entry_answers_every_subleaf() {
        let mut set = CpuidSet::new();
        let vals = CpuidValues { eax: 1, ebx: 2, ecx: 3, edx: 4 };
        set.insert(CpuidIdent::leaf(0x15), vals).unwrap();

        assert_eq!(set.query(CpuidIdent::subleaf(0x15, 0)), vals);
        assert_eq!(set.query(CpuidIdent::subleaf(0x15, 7)), vals);
        let missing = set.query(CpuidIdent::leaf(0x16));
        assert_eq!(missing, CpuidValues::default());
    }

    #[test]
    fn leaf_and_subleaf_entries_conflict() {
        let mut set = CpuidSet::new();
        set.insert(CpuidIdent::leaf(7), CpuidValues::default()).unwrap();
        assert!(matches!(
            set.insert(CpuidIdent::subleaf(7, 0), CpuidValues::default()),
            Err(CpuidMapInsertError::LeafOnlyConflict(_))
        ));

        let mut set = CpuidSet::new();
        set.insert(CpuidIdent::subleaf(7, 1), CpuidValues::default())
            .unwrap();
        assert!(matches!(
            set.insert(CpuidIdent::leaf(7), CpuidValues::default()),
            Err(CpuidMapInsertError::SubleafConflict(_))
        ));
    }

    #[test]
    fn remove_leaf_drops_all_subleaves() {
        let mut set = CpuidSet::new();
        for sub in 0..4 {
            set.insert(CpuidIdent::subleaf(0xb, sub), CpuidValues::default())
                .unwrap();
        }
        set.insert(CpuidIdent::leaf(1), CpuidValues::default()).unwrap();

        set.remove_leaf(0xb);
        assert_eq!(set.len(), 1);
    }

    proptest! {
        #[test]
        fn replacing_an_entry_returns_the_old_one(
            leaf in any::<u32>(),
            a in any::<[u32; 4]>(),
            b in any::<[u32; 4]>(),
        ) {
            let mut set = CpuidSet::new();
            let id = CpuidIdent::leaf(leaf);
            prop_assert_eq!(set.insert(id, a.into()).unwrap(), None);
            prop_assert_eq!(
                set.insert(id, b.into()).unwrap(),
                Some(CpuidValues::from(a))
            );
            prop_assert_eq!(set.query(id), CpuidValues::from(b));
        }
    }
}
