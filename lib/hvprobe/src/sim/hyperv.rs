// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side behavior of the Hyper-V synthetic MSRs, following TLFS sections
//! 3.13 and 12.

use hvprobe_config::{SimFeatures, SimQuirks};
use slog::debug;

use super::clock::Clock;
use super::memory::Memory;
use crate::bits::*;
use crate::hypercall::{hypercall_page_contents, MsrHypercallValue};
use crate::msr::{MsrId, RdmsrOutcome, WrmsrOutcome};
use crate::tsc::{MsrReferenceTscValue, ReferenceTscPage, SEQUENCE_INVALID};

pub(super) struct HyperV {
    log: slog::Logger,
    features: SimFeatures,
    quirks: SimQuirks,
    tsc_hz: u64,

    /// The last value stored in [`HV_X64_MSR_GUEST_OS_ID`].
    msr_guest_os_id_value: u64,

    /// The last value stored in [`HV_X64_MSR_HYPERCALL`].
    msr_hypercall_value: MsrHypercallValue,

    /// The last value stored in [`HV_X64_MSR_REFERENCE_TSC`].
    msr_reference_tsc_value: MsrReferenceTscValue,

    /// The sequence number of the most recently published reference TSC page.
    tsc_sequence: u32,
}

impl HyperV {
    pub(super) fn new(
        log: &slog::Logger,
        features: SimFeatures,
        quirks: SimQuirks,
        tsc_hz: u64,
    ) -> Self {
        Self {
            log: log.clone(),
            features,
            quirks,
            tsc_hz,
            msr_guest_os_id_value: 0,
            msr_hypercall_value: MsrHypercallValue::default(),
            msr_reference_tsc_value: MsrReferenceTscValue::default(),
            tsc_sequence: 0,
        }
    }

    /// The access rights reported in leaf 0x4000_0003 eax.
    pub(super) fn privileges(&self) -> HyperVLeaf3Eax {
        let mut privileges = HyperVLeaf3Eax::default();
        if self.features.reference_tsc {
            privileges |= HyperVLeaf3Eax::PARTITION_REFERENCE_COUNTER
                | HyperVLeaf3Eax::PARTITION_REFERENCE_TSC;
        }
        privileges
    }

    pub(super) fn hypercall_msr(&self) -> MsrHypercallValue {
        self.msr_hypercall_value
    }

    pub(super) fn rdmsr(
        &self,
        msr: MsrId,
        vp_index: u32,
        clock: &mut Clock,
    ) -> RdmsrOutcome {
        match msr {
            HV_X64_MSR_GUEST_OS_ID => {
                RdmsrOutcome::Handled(self.msr_guest_os_id_value)
            }
            HV_X64_MSR_HYPERCALL => {
                RdmsrOutcome::Handled(self.msr_hypercall_value.0)
            }
            HV_X64_MSR_VP_INDEX => RdmsrOutcome::Handled(vp_index as u64),
            HV_X64_MSR_TIME_REF_COUNT if self.features.reference_tsc => {
                RdmsrOutcome::Handled(clock.reference_count())
            }
            HV_X64_MSR_REFERENCE_TSC if self.features.reference_tsc => {
                RdmsrOutcome::Handled(self.msr_reference_tsc_value.0)
            }
            HV_X64_MSR_TIME_REF_COUNT | HV_X64_MSR_REFERENCE_TSC => {
                RdmsrOutcome::GpException
            }
            _ => RdmsrOutcome::NotHandled,
        }
    }

    pub(super) fn wrmsr(
        &mut self,
        msr: MsrId,
        value: u64,
        memory: &mut Memory,
    ) -> WrmsrOutcome {
        match msr {
            HV_X64_MSR_GUEST_OS_ID => self.handle_wrmsr_guest_os_id(value),
            HV_X64_MSR_HYPERCALL => self.handle_wrmsr_hypercall(value, memory),
            HV_X64_MSR_REFERENCE_TSC => {
                self.handle_wrmsr_reference_tsc(value, memory)
            }
            HV_X64_MSR_VP_INDEX | HV_X64_MSR_TIME_REF_COUNT => {
                WrmsrOutcome::GpException
            }
            _ => WrmsrOutcome::NotHandled,
        }
    }

    fn handle_wrmsr_guest_os_id(&mut self, value: u64) -> WrmsrOutcome {
        debug!(self.log, "wrmsr guest OS ID"; "value" => value);

        // Clearing the guest OS ID disables the hypercall page but otherwise
        // leaves the hypercall MSR alone.
        if value == 0 {
            self.msr_hypercall_value.clear_enabled();
        }

        self.msr_guest_os_id_value = value;
        WrmsrOutcome::Handled
    }

    fn handle_wrmsr_hypercall(
        &mut self,
        value: u64,
        memory: &mut Memory,
    ) -> WrmsrOutcome {
        let mut new = MsrHypercallValue(value);
        debug!(self.log, "wrmsr hypercall"; "value" => ?new);

        // Immutable once locked.
        if self.msr_hypercall_value.locked() {
            return WrmsrOutcome::Handled;
        }

        // Without a guest OS ID the Enabled bit is dropped and the write
        // otherwise succeeds.
        if self.msr_guest_os_id_value == 0 {
            new.clear_enabled();
        }

        if new.enabled() {
            let Some(page) = memory.page_mut(new.gpa()) else {
                debug!(self.log, "hypercall page GPA is not backed";
                       "gpa" => %new.gpa());
                return WrmsrOutcome::GpException;
            };
            page.copy_from_slice(&hypercall_page_contents());
        }

        self.msr_hypercall_value = new;
        WrmsrOutcome::Handled
    }

    fn handle_wrmsr_reference_tsc(
        &mut self,
        value: u64,
        memory: &mut Memory,
    ) -> WrmsrOutcome {
        if !self.features.reference_tsc {
            return WrmsrOutcome::GpException;
        }

        let new = MsrReferenceTscValue(value);
        debug!(self.log, "wrmsr reference TSC"; "value" => ?new);

        // Writes always succeed, even if they name a PFN with no memory
        // behind it. See TLFS section 12.7.1.
        self.msr_reference_tsc_value = new;
        if !new.enabled() {
            return WrmsrOutcome::Handled;
        }

        let mut contents = ReferenceTscPage::new(self.tsc_hz);
        contents.offset = self.quirks.reference_tsc_offset;
        contents.sequence = if self.quirks.unpublished_reference_tsc {
            0
        } else {
            self.next_sequence()
        };

        if let Some(page) = memory.page_mut(new.gpa()) {
            contents.write_to_page(page);
        }

        WrmsrOutcome::Handled
    }

    fn next_sequence(&mut self) -> u32 {
        self.tsc_sequence = match self.tsc_sequence.wrapping_add(1) {
            0 | SEQUENCE_INVALID => 1,
            n => n,
        };
        self.tsc_sequence
    }
}
