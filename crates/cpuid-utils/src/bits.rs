// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bitflags and constants that provide symbolic names for the various bits in
//! various CPUID leaves.
//!
//! Definitions here are taken from the Intel SDM volume 2A (CPUID instruction
//! reference) and the AMD Architecture Programmer's Manual, volume 3,
//! appendix E. Only the leaves a time-source probe consults are described.

pub const STANDARD_BASE_LEAF: u32 = 0;
pub const HYPERVISOR_BASE_LEAF: u32 = 0x4000_0000;
pub const EXTENDED_BASE_LEAF: u32 = 0x8000_0000;

/// Leaf 1: feature information.
pub const FEATURE_LEAF: u32 = 0x1;

/// Leaf 0x15: time stamp counter and nominal core crystal clock information.
///
/// eax receives the denominator of the TSC/crystal ratio, ebx the numerator,
/// and ecx the nominal crystal frequency in Hz. Any of these may be zero if
/// the processor (or hypervisor) does not enumerate them.
pub const TSC_CRYSTAL_LEAF: u32 = 0x15;

/// Leaf 0x16: processor frequency information.
///
/// eax receives the base frequency, ebx the maximum frequency, and ecx the
/// bus (reference) frequency, all in MHz.
pub const FREQUENCY_LEAF: u32 = 0x16;

/// Leaf 0x8000_0007: advanced power management information.
pub const EXT_POWER_MGMT_LEAF: u32 = 0x8000_0007;

bitflags::bitflags! {
    /// Leaf 1 ecx: feature identifiers. Only the bits the probe consults are
    /// named; use `from_bits_retain` to keep the rest.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Leaf1Ecx: u32 {
        /// The local APIC timer supports one-shot operation against an
        /// absolute TSC deadline.
        const TSC_DEADLINE = 1 << 24;

        /// Set by hypervisors to announce their presence. Conforming Hyper-V
        /// implementations are required to set this bit.
        const HV_GUEST = 1 << 31;
    }

    /// Leaf 1 edx: Instruction feature identifiers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Leaf1Edx: u32 {
        const FPU = 1 << 0;
        const TSC = 1 << 4;
        const MSR = 1 << 5;
        const APIC = 1 << 9;
    }

    /// Leaf 0x8000_0007 edx: advanced power management features.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ExtLeaf7Edx: u32 {
        /// The TSC runs at a constant rate in all ACPI P-, C- and T-states.
        /// The Hyper-V reference time enlightenment is only meaningful on
        /// hosts that advertise this.
        const INVARIANT_TSC = 1 << 8;
    }
}

/// Decoded contents of leaf 0x15.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TscCrystalLeaf {
    pub denominator: u32,
    pub numerator: u32,
    pub crystal_hz: u32,
}

impl From<crate::CpuidValues> for TscCrystalLeaf {
    fn from(value: crate::CpuidValues) -> Self {
        Self {
            denominator: value.eax,
            numerator: value.ebx,
            crystal_hz: value.ecx,
        }
    }
}

impl From<TscCrystalLeaf> for crate::CpuidValues {
    fn from(value: TscCrystalLeaf) -> Self {
        Self {
            eax: value.denominator,
            ebx: value.numerator,
            ecx: value.crystal_hz,
            edx: 0,
        }
    }
}

/// Decoded contents of leaf 0x16.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrequencyLeaf {
    pub base_mhz: u32,
    pub max_mhz: u32,
    pub bus_mhz: u32,
}

impl From<crate::CpuidValues> for FrequencyLeaf {
    fn from(value: crate::CpuidValues) -> Self {
        // Only bits 15:0 of each register are defined.
        Self {
            base_mhz: value.eax & 0xffff,
            max_mhz: value.ebx & 0xffff,
            bus_mhz: value.ecx & 0xffff,
        }
    }
}

impl From<FrequencyLeaf> for crate::CpuidValues {
    fn from(value: FrequencyLeaf) -> Self {
        Self {
            eax: value.base_mhz,
            ebx: value.max_mhz,
            ecx: value.bus_mhz,
            edx: 0,
        }
    }
}
