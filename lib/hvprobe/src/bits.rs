// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Constant definitions and flags for the Hyper-V interface. These are drawn
//! from the Hyper-V TLFS version 6.0b (referred to as "TLFS" below) and the
//! Microsoft "Requirements for Implementing the Microsoft Hypervisor
//! Interface" document.
//!
//! Where possible, constants in this module (such as MSR identifiers) are given
//! names that match those used in the TLFS.

use cpuid_utils::CpuidValues;

use crate::msr::MsrId;

/// Hyper-V-compatible hypervisors are required to support hypervisor CPUID
/// leaves up to 0x4000_0005.
pub const HYPERV_MIN_REQUIRED_CPUID_LEAF: u32 = 0x4000_0005;

/// The vendor-neutral interface signature reported in leaf 0x4000_0001 eax
/// by hypervisors conforming to the Hyper-V interface ("Hv#1").
pub const HYPERV_INTERFACE_SIGNATURE: u32 = 0x3123_7648;

/// The vendor ID ("Microsoft Hv") reported in leaf 0x4000_0000 ebx/ecx/edx.
pub const HYPERV_VENDOR_ID: [u32; 3] = [0x7263_694D, 0x666F_736F, 0x7648_2074];

/// Leaf 0x4000_0000 with `max_leaf` in eax and the Hyper-V vendor ID.
pub const fn hyperv_leaf_0_values(max_leaf: u32) -> CpuidValues {
    CpuidValues {
        eax: max_leaf,
        ebx: HYPERV_VENDOR_ID[0],
        ecx: HYPERV_VENDOR_ID[1],
        edx: HYPERV_VENDOR_ID[2],
    }
}

bitflags::bitflags! {
    /// Hyper-V leaf 0x4000_0003 eax returns synthetic MSR access rights.
    /// Only the bits this probe exercises are enumerated here.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HyperVLeaf3Eax: u32 {
        const PARTITION_REFERENCE_COUNTER = 1 << 1;
        const HYPERCALL = 1 << 5;
        const VP_INDEX = 1 << 6;
        const PARTITION_REFERENCE_TSC = 1 << 9;

        // Bits 14-31 of this register are reserved.
    }
}

impl Default for HyperVLeaf3Eax {
    /// Grants access to the VP index and hypercall MSRs. This is the minimum
    /// set of access rights that all Hyper-V-compatible hypervisors must grant.
    fn default() -> Self {
        HyperVLeaf3Eax::VP_INDEX | HyperVLeaf3Eax::HYPERCALL
    }
}

/// Allows the guest to report its type and version information. See TLFS
/// section 2.6 for details about this MSR's format.
///
/// Guest OSes are required to identify themselves via this MSR before they can
/// set the enabled bit in [`HV_X64_MSR_HYPERCALL`] or make any hypercalls.
pub const HV_X64_MSR_GUEST_OS_ID: MsrId = MsrId(0x4000_0000);

/// Specifies the guest physical address at which the guest would like to place
/// the hypercall page. See TLFS section 3.13 and
/// [`crate::hypercall::MsrHypercallValue`].
pub const HV_X64_MSR_HYPERCALL: MsrId = MsrId(0x4000_0001);

/// Returns the index of the virtual processor that reads it. Read-only.
pub const HV_X64_MSR_VP_INDEX: MsrId = MsrId(0x4000_0002);

/// The time since the partition was created, in 100-nanosecond units.
/// Read-only; writes raise #GP. See TLFS section 12.4.
pub const HV_X64_MSR_TIME_REF_COUNT: MsrId = MsrId(0x4000_0020);

/// Specifies the guest physical address at which the guest would like to place
/// the reference TSC page. See TLFS section 12.7 and
/// [`crate::tsc::MsrReferenceTscValue`].
pub const HV_X64_MSR_REFERENCE_TSC: MsrId = MsrId(0x4000_0021);

/// Architectural MSR holding the absolute TSC value at which a local APIC
/// timer in TSC-deadline mode fires. Writing 0 disarms the timer.
pub const IA32_TSC_DEADLINE: MsrId = MsrId(0x6e0);

/// Set in a hypercall input value to request the register-based ("fast")
/// calling convention. See TLFS section 3.7.
pub const HV_HYPERCALL_FAST: u64 = 1 << 16;

/// The HvCallSignalEvent call code. The probe issues it only to exercise the
/// transport; a host with no hypercall support must reject it.
pub const HVCALL_SIGNAL_EVENT: u16 = 0x5d;

pub const HV_STATUS_SUCCESS: u16 = 0;
pub const HV_STATUS_INVALID_HYPERCALL_CODE: u16 = 2;

/// The guest OS identity the probe reports by default: the "open source"
/// encoding of TLFS section 2.6 with a vendor-specific OS type and no version
/// information.
pub const GUEST_OS_ID_OPEN_SOURCE: u64 = 0x8f00 << 48;
