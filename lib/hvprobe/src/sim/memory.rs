// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated guest memory. Only pages the probe has allocated are backed;
//! guest physical and probe virtual addresses are identical.

use std::collections::BTreeMap;

use crate::common::{GuestAddr, PAGE_SHIFT, PAGE_SIZE};

/// The first PFN handed out. Page 0 is never allocated, so a zero GPA always
/// means "no page".
const FIRST_PFN: u64 = 0x100;

pub(super) struct Memory {
    pages: BTreeMap<u64, Box<[u8; PAGE_SIZE]>>,
    limit: u64,
}

impl Memory {
    pub(super) fn new(limit: u32) -> Self {
        Self { pages: BTreeMap::new(), limit: limit as u64 }
    }

    /// Backs the lowest free PFN and returns its address.
    pub(super) fn allocate(&mut self) -> Option<GuestAddr> {
        let pfn = (FIRST_PFN..FIRST_PFN + self.limit)
            .find(|pfn| !self.pages.contains_key(pfn))?;
        self.pages.insert(pfn, Box::new([0u8; PAGE_SIZE]));
        Some(GuestAddr(pfn << PAGE_SHIFT))
    }

    /// Returns `true` if `gpa` was backed.
    pub(super) fn free(&mut self, gpa: GuestAddr) -> bool {
        self.pages.remove(&gpa.pfn()).is_some()
    }

    pub(super) fn page(&self, gpa: GuestAddr) -> Option<&[u8; PAGE_SIZE]> {
        self.pages.get(&gpa.pfn()).map(|p| &**p)
    }

    pub(super) fn page_mut(
        &mut self,
        gpa: GuestAddr,
    ) -> Option<&mut [u8; PAGE_SIZE]> {
        self.pages.get_mut(&gpa.pfn()).map(|p| &mut **p)
    }

    pub(super) fn in_use(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocation_reuses_freed_frames() {
        let mut mem = Memory::new(2);
        let a = mem.allocate().unwrap();
        let b = mem.allocate().unwrap();
        assert_ne!(a, b);
        assert!(a.is_page_aligned() && b.is_page_aligned());
        assert!(mem.allocate().is_none());

        assert!(mem.free(a));
        assert!(!mem.free(a));
        assert_eq!(mem.allocate(), Some(a));
        assert_eq!(mem.in_use(), 2);
    }

    #[test]
    fn unbacked_addresses_have_no_page() {
        let mut mem = Memory::new(1);
        assert!(mem.page(GuestAddr(0)).is_none());
        let gpa = mem.allocate().unwrap();
        mem.page_mut(gpa).unwrap()[7] = 0xc3;
        assert_eq!(mem.page(gpa).unwrap()[7], 0xc3);
    }
}
