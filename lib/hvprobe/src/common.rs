// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_OFFSET: usize = 0xfff;
pub const PAGE_MASK: usize = usize::MAX - PAGE_OFFSET;
pub const PAGE_SHIFT: usize = 12;

pub const NS_PER_SEC: u64 = 1_000_000_000;

/// Reference time is measured in 100 ns units.
pub const HUNDRED_NS_PER_SEC: u64 = 10_000_000;

/// A guest physical address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GuestAddr(pub u64);

impl GuestAddr {
    /// Returns the page frame number containing this address.
    pub const fn pfn(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 & PAGE_OFFSET as u64 == 0
    }
}

impl std::fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Converts `ns` nanoseconds into ticks of a counter running at `hz`, rounding
/// down, and saturating at `u64::MAX`.
pub(crate) fn ns_to_ticks(ns: u64, hz: u64) -> u64 {
    let ticks = ns as u128 * hz as u128 / NS_PER_SEC as u128;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}
