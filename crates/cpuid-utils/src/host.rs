// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queries against the CPU the caller is running on.

use crate::{bits::HYPERVISOR_BASE_LEAF, CpuidIdent, CpuidSet, CpuidValues};

/// Queries the supplied CPUID leaf on the caller's machine.
#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)] // the intrinsic is safe on newer toolchains
pub fn query(leaf: CpuidIdent) -> CpuidValues {
    // SAFETY: CPUID is available on every x86-64 processor.
    unsafe {
        core::arch::x86_64::__cpuid_count(leaf.leaf, leaf.subleaf.unwrap_or(0))
    }
    .into()
}

#[cfg(not(target_arch = "x86_64"))]
pub fn query(_leaf: CpuidIdent) -> CpuidValues {
    panic!("host CPUID queries only work on x86-64 hosts")
}

/// Collects the hypervisor leaf range (0x4000_0000 up to the maximum leaf
/// reported in 0x4000_0000 eax) using the supplied query function.
///
/// The reported maximum is clamped to 0x4000_00FF, the top of the range
/// reserved for hypervisor use, so a garbage leaf-0 value cannot make this
/// enumerate the entire 32-bit space.
pub fn collect_hypervisor_leaves(
    query: impl Fn(CpuidIdent) -> CpuidValues,
) -> CpuidSet {
    let mut set = CpuidSet::new();
    let base = query(CpuidIdent::leaf(HYPERVISOR_BASE_LEAF));
    let max = base.eax.clamp(HYPERVISOR_BASE_LEAF, HYPERVISOR_BASE_LEAF + 0xff);

    set.insert(CpuidIdent::leaf(HYPERVISOR_BASE_LEAF), base)
        .expect("set starts empty");
    for leaf in (HYPERVISOR_BASE_LEAF + 1)..=max {
        set.insert(CpuidIdent::leaf(leaf), query(CpuidIdent::leaf(leaf)))
            .expect("each leaf is inserted once");
    }

    set
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hypervisor_range_follows_leaf_zero() {
        let set = collect_hypervisor_leaves(|id| match id.leaf {
            0x4000_0000 => {
                CpuidValues { eax: 0x4000_0005, ..Default::default() }
            }
            leaf => CpuidValues { eax: leaf, ..Default::default() },
        });

        assert_eq!(set.len(), 6);
        assert_eq!(set.query(CpuidIdent::leaf(0x4000_0003)).eax, 0x4000_0003);
    }

    #[test]
    fn garbage_max_leaf_is_clamped() {
        let set = collect_hypervisor_leaves(|_| CpuidValues {
            eax: u32::MAX,
            ..Default::default()
        });
        assert_eq!(set.len(), 0x100);

        let set = collect_hypervisor_leaves(|_| CpuidValues::default());
        assert_eq!(set.len(), 1);
    }
}
