// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A deterministic software model of a Hyper-V-compatible host.
//!
//! [`SimHost`] implements every [`Platform`](crate::platform::Platform)
//! service, so the whole probe can run in an ordinary process. The host's
//! capabilities come from a [`SimHostConfig`], and its
//! [`SimQuirks`](hvprobe_config::SimQuirks) make it violate specific
//! interface requirements on demand.

use std::collections::BTreeMap;
use std::sync::Mutex;

use cpuid_utils::bits::{
    ExtLeaf7Edx, FrequencyLeaf, Leaf1Ecx, Leaf1Edx, TscCrystalLeaf,
    EXTENDED_BASE_LEAF, EXT_POWER_MGMT_LEAF, FEATURE_LEAF, FREQUENCY_LEAF,
    STANDARD_BASE_LEAF, TSC_CRYSTAL_LEAF,
};
use cpuid_utils::{CpuidIdent, CpuidSet, CpuidValues};
use hvprobe_config::{ConfigError, SimHostConfig};
use slog::{debug, info, warn};

use crate::bits::{
    hyperv_leaf_0_values, HYPERV_INTERFACE_SIGNATURE, IA32_TSC_DEADLINE,
};
use crate::common::{GuestAddr, PAGE_SIZE};
use crate::hypercall::HYPERCALL_INSTRUCTION_SEQUENCE;
use crate::msr::{MsrFault, MsrId, RdmsrOutcome, WrmsrOutcome};
use crate::platform::{
    CallGate, Cpu, EndOfInterrupt, HypercallRegs, InterruptController,
    InterruptHandler, PageAllocator, PageHandle,
};

mod clock;
mod hyperv;
mod memory;

use clock::Clock;
use hyperv::HyperV;
use memory::Memory;

/// "GenuineIntel", in leaf 0 register order (ebx, edx, ecx).
const VENDOR_INTEL: [u32; 3] = [0x756e_6547, 0x4965_6e69, 0x6c65_746e];

/// The highest hypervisor leaf the simulated host reports.
const MAX_HYPERVISOR_LEAF: u32 = 0x4000_0006;

/// The local APIC timer and interrupt dispatch.
#[derive(Default)]
struct Apic {
    /// The vector programmed into the timer LVT in TSC-deadline mode.
    deadline_vector: Option<u8>,
    handlers: BTreeMap<u8, InterruptHandler>,
    interrupts_enabled: bool,
    delivered: u64,
    eoi_count: u64,
}

struct Inner {
    clock: Clock,
    memory: Memory,
    hyperv: HyperV,
    apic: Apic,
    last_hypercall_control: Option<u64>,
}

pub struct SimHost {
    log: slog::Logger,
    config: SimHostConfig,
    cpuid: CpuidSet,
    inner: Mutex<Inner>,
}

impl SimHost {
    pub fn new(
        log: &slog::Logger,
        config: &SimHostConfig,
    ) -> Result<Self, ConfigError> {
        let log = log.new(slog::o!("component" => "sim"));
        info!(log, "creating simulated host";
              "tsc_hz" => config.tsc_hz,
              "features" => ?config.features,
              "quirks" => ?config.quirks);

        let hyperv =
            HyperV::new(&log, config.features, config.quirks, config.tsc_hz);
        let cpuid = build_cpuid(&log, config, &hyperv)?;

        Ok(Self {
            log,
            config: config.clone(),
            cpuid,
            inner: Mutex::new(Inner {
                clock: Clock::new(config),
                memory: Memory::new(config.pages),
                hyperv,
                apic: Apic::default(),
                last_hypercall_control: None,
            }),
        })
    }

    /// The number of pages currently allocated.
    pub fn pages_in_use(&self) -> usize {
        self.inner.lock().unwrap().memory.in_use()
    }

    /// The control value of the most recent hypercall.
    pub fn last_hypercall_control(&self) -> Option<u64> {
        self.inner.lock().unwrap().last_hypercall_control
    }

    /// The number of deadline-timer interrupts delivered to a handler.
    pub fn interrupts_delivered(&self) -> u64 {
        self.inner.lock().unwrap().apic.delivered
    }

    pub fn eoi_count(&self) -> u64 {
        self.inner.lock().unwrap().apic.eoi_count
    }

    /// The current TSC value. Unlike [`Cpu::rdtsc`] this costs no cycles.
    pub fn tsc(&self) -> u64 {
        self.inner.lock().unwrap().clock.tsc()
    }

    /// Runs `f` against the host state, charging one access's worth of
    /// cycles first, then delivers a timer interrupt if that crossed the
    /// deadline.
    fn access<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let (result, pending) = {
            let mut inner = self.inner.lock().unwrap();
            let expired = inner.clock.advance(self.config.access_cycles);
            let pending = self.expire(&mut inner, expired);
            (f(&mut *inner), pending)
        };

        self.deliver(pending);
        result
    }

    /// Decides what happens when the deadline comparator matches. The timer
    /// disarms either way; an interrupt reaches a handler only if the LVT is
    /// in deadline mode and interrupts are enabled.
    fn expire(
        &self,
        inner: &mut Inner,
        expired: bool,
    ) -> Option<InterruptHandler> {
        if !expired {
            return None;
        }

        let apic = &mut inner.apic;
        let Some(vector) = apic.deadline_vector else {
            return None;
        };
        let dropped = self.config.quirks.drop_deadline_interrupts;
        if !apic.interrupts_enabled || dropped {
            debug!(self.log, "deadline interrupt dropped"; "vector" => vector);
            return None;
        }

        let handler = apic.handlers.get(&vector).cloned();
        if handler.is_some() {
            apic.delivered += 1;
        } else {
            warn!(self.log, "no handler for deadline vector";
                  "vector" => vector);
        }
        handler
    }

    /// Handlers run with the state lock released so they can call back in.
    fn deliver(&self, pending: Option<InterruptHandler>) {
        if let Some(handler) = pending {
            handler(self);
        }
    }

    fn page_gpa(page: &PageHandle) -> GuestAddr {
        GuestAddr(page.vaddr() as u64)
    }
}

fn build_cpuid(
    log: &slog::Logger,
    config: &SimHostConfig,
    hyperv: &HyperV,
) -> Result<CpuidSet, ConfigError> {
    let features = &config.features;
    let mut leaf1_ecx = Leaf1Ecx::HV_GUEST;
    if features.tsc_deadline {
        leaf1_ecx |= Leaf1Ecx::TSC_DEADLINE;
    }
    let leaf1_edx =
        Leaf1Edx::FPU | Leaf1Edx::TSC | Leaf1Edx::MSR | Leaf1Edx::APIC;

    let mut power = ExtLeaf7Edx::empty();
    if features.invariant_tsc {
        power |= ExtLeaf7Edx::INVARIANT_TSC;
    }

    let zero = CpuidValues::default();
    let leaves = [
        (
            STANDARD_BASE_LEAF,
            CpuidValues {
                eax: FREQUENCY_LEAF,
                ebx: VENDOR_INTEL[0],
                ecx: VENDOR_INTEL[2],
                edx: VENDOR_INTEL[1],
            },
        ),
        (
            FEATURE_LEAF,
            CpuidValues {
                ecx: leaf1_ecx.bits(),
                edx: leaf1_edx.bits(),
                ..zero
            },
        ),
        (
            TSC_CRYSTAL_LEAF,
            TscCrystalLeaf {
                denominator: config.tsc_ratio_denominator,
                numerator: config.tsc_ratio_numerator,
                crystal_hz: config.crystal_hz,
            }
            .into(),
        ),
        (
            FREQUENCY_LEAF,
            FrequencyLeaf {
                base_mhz: config.base_mhz,
                max_mhz: config.max_mhz,
                bus_mhz: config.bus_mhz,
            }
            .into(),
        ),
        (0x4000_0000, hyperv_leaf_0_values(MAX_HYPERVISOR_LEAF)),
        (0x4000_0001, CpuidValues { eax: HYPERV_INTERFACE_SIGNATURE, ..zero }),
        (0x4000_0002, zero),
        (0x4000_0003, CpuidValues { eax: hyperv.privileges().bits(), ..zero }),
        (0x4000_0004, zero),
        (
            0x4000_0005,
            CpuidValues { eax: config.max_virtual_processors, ..zero },
        ),
        (0x4000_0006, zero),
        (EXTENDED_BASE_LEAF, CpuidValues { eax: EXT_POWER_MGMT_LEAF, ..zero }),
        (EXT_POWER_MGMT_LEAF, CpuidValues { edx: power.bits(), ..zero }),
    ];

    let mut set = CpuidSet::new();
    for (leaf, values) in leaves {
        // Every leaf above is distinct and leaf-only.
        let _ = set.insert(CpuidIdent::leaf(leaf), values);
    }

    for (ident, values) in config.cpuid_overrides()? {
        if set.insert(ident, values).is_err() {
            // A subleaf override replaces a built-in leaf-only entry, and
            // vice versa.
            set.remove_leaf(ident.leaf);
            if let Err(e) = set.insert(ident, values) {
                warn!(log, "ignoring CPUID override"; "error" => %e);
                continue;
            }
        }
        debug!(log, "CPUID override"; "leaf" => %ident, "values" => ?values);
    }

    Ok(set)
}

impl Cpu for SimHost {
    fn cpuid(&self, ident: CpuidIdent) -> CpuidValues {
        self.access(|_| self.cpuid.query(ident))
    }

    fn rdmsr(&self, msr: MsrId) -> Result<u64, MsrFault> {
        let outcome = self.access(|inner| {
            if msr == IA32_TSC_DEADLINE && self.config.features.tsc_deadline {
                return RdmsrOutcome::Handled(inner.clock.deadline());
            }
            inner.hyperv.rdmsr(
                msr,
                self.config.processor_id,
                &mut inner.clock,
            )
        });

        match outcome {
            RdmsrOutcome::Handled(value) => Ok(value),
            RdmsrOutcome::NotHandled | RdmsrOutcome::GpException => {
                debug!(self.log, "rdmsr #GP"; "msr" => %msr);
                Err(MsrFault::read(msr))
            }
        }
    }

    fn wrmsr(&self, msr: MsrId, value: u64) -> Result<(), MsrFault> {
        let (outcome, pending) = {
            let mut inner = self.inner.lock().unwrap();
            let expired = inner.clock.advance(self.config.access_cycles);
            let mut pending = self.expire(&mut inner, expired);

            let outcome = if msr == IA32_TSC_DEADLINE
                && self.config.features.tsc_deadline
            {
                let expired = inner.clock.arm(value);
                pending = pending.or_else(|| self.expire(&mut inner, expired));
                WrmsrOutcome::Handled
            } else {
                let Inner { hyperv, memory, .. } = &mut *inner;
                hyperv.wrmsr(msr, value, memory)
            };

            (outcome, pending)
        };

        self.deliver(pending);
        match outcome {
            WrmsrOutcome::Handled => Ok(()),
            WrmsrOutcome::NotHandled | WrmsrOutcome::GpException => {
                debug!(self.log, "wrmsr #GP";
                       "msr" => %msr, "value" => value);
                Err(MsrFault::write(msr, value))
            }
        }
    }

    fn rdtsc(&self) -> u64 {
        self.access(|inner| inner.clock.tsc())
    }

    fn relax(&self) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            let expired = inner.clock.relax();
            self.expire(&mut inner, expired)
        };

        self.deliver(pending);
    }

    fn current_processor_id(&self) -> u32 {
        self.config.processor_id
    }
}

impl CallGate for SimHost {
    /// Executes the page's `mov rax, imm32; ret` stub.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not an installed hypercall page: real hardware
    /// would execute garbage.
    unsafe fn hypercall(
        &self,
        page: &PageHandle,
        control: u64,
        input: u64,
    ) -> HypercallRegs {
        let gpa = Self::page_gpa(page);
        self.access(|inner| {
            let msr = inner.hyperv.hypercall_msr();
            let stub = inner
                .memory
                .page(gpa)
                .map(|p| &p[..HYPERCALL_INSTRUCTION_SEQUENCE.len()]);
            assert!(
                msr.enabled()
                    && msr.gpa() == gpa
                    && stub == Some(&HYPERCALL_INSTRUCTION_SEQUENCE[..]),
                "call into {gpa}, which is not an installed hypercall page"
            );

            inner.last_hypercall_control = Some(control);

            let mut imm = [0u8; 4];
            imm.copy_from_slice(&HYPERCALL_INSTRUCTION_SEQUENCE[3..7]);
            let rax = i32::from_le_bytes(imm) as i64 as u64;
            let rdx = if self.config.quirks.clobber_hypercall_rdx {
                !input
            } else {
                input
            };

            HypercallRegs { rax, rdx }
        })
    }
}

impl PageAllocator for SimHost {
    fn allocate_page(&self) -> Option<PageHandle> {
        if self.config.quirks.fail_page_allocation {
            debug!(self.log, "refusing page allocation");
            return None;
        }

        let gpa = self.inner.lock().unwrap().memory.allocate()?;
        Some(PageHandle::new(gpa.0 as usize))
    }

    fn physical_address_of(&self, page: &PageHandle) -> GuestAddr {
        Self::page_gpa(page)
    }

    fn free_page(&self, page: PageHandle) {
        let gpa = Self::page_gpa(&page);
        if !self.inner.lock().unwrap().memory.free(gpa) {
            warn!(self.log, "free of unallocated page"; "gpa" => %gpa);
        }
    }

    fn read_bytes(&self, page: &PageHandle, offset: usize, buf: &mut [u8]) {
        let gpa = Self::page_gpa(page);
        let inner = self.inner.lock().unwrap();
        match inner.memory.page(gpa) {
            Some(contents) => {
                buf.copy_from_slice(&contents[offset..offset + buf.len()])
            }
            None => panic!("read from unallocated page {gpa}"),
        }
    }

    fn zero_page(&self, page: &PageHandle) {
        let gpa = Self::page_gpa(page);
        let mut inner = self.inner.lock().unwrap();
        if let Some(contents) = inner.memory.page_mut(gpa) {
            *contents = [0u8; PAGE_SIZE];
        }
    }
}

impl EndOfInterrupt for SimHost {
    fn signal_end_of_interrupt(&self) {
        self.inner.lock().unwrap().apic.eoi_count += 1;
    }
}

impl InterruptController for SimHost {
    fn set_tsc_deadline_mode(&self, vector: u8) {
        self.inner.lock().unwrap().apic.deadline_vector = Some(vector);
    }

    fn register_vector(&self, vector: u8, handler: InterruptHandler) {
        self.inner.lock().unwrap().apic.handlers.insert(vector, handler);
    }

    fn enable_interrupts(&self) {
        self.inner.lock().unwrap().apic.interrupts_enabled = true;
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::bits::{HV_X64_MSR_TIME_REF_COUNT, HV_X64_MSR_VP_INDEX};

    pub(crate) fn discard_log() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    pub(crate) fn sim_host(config: SimHostConfig) -> SimHost {
        SimHost::new(&discard_log(), &config).unwrap()
    }

    fn counting_handler(count: &Arc<AtomicU32>) -> InterruptHandler {
        let count = count.clone();
        Arc::new(move |eoi: &dyn EndOfInterrupt| {
            count.fetch_add(1, Ordering::Relaxed);
            eoi.signal_end_of_interrupt();
        })
    }

    #[test]
    fn every_access_costs_cycles() {
        let host = sim_host(SimHostConfig::default());
        let a = host.rdtsc();
        let b = host.rdtsc();
        assert_eq!(b - a, SimHostConfig::default().access_cycles);
        assert_eq!(host.tsc(), b);
    }

    #[test]
    fn vp_index_reports_processor_id() {
        let host =
            sim_host(SimHostConfig { processor_id: 5, ..Default::default() });
        assert_eq!(host.rdmsr(HV_X64_MSR_VP_INDEX).unwrap(), 5);
        assert_eq!(host.current_processor_id(), 5);
    }

    #[test]
    fn unknown_msrs_fault() {
        let host = sim_host(SimHostConfig::default());
        let efer = MsrId(0xc000_0080);
        assert_eq!(host.rdmsr(efer), Err(MsrFault::read(efer)));
        assert_eq!(host.wrmsr(efer, 1), Err(MsrFault::write(efer, 1)));
    }

    #[test]
    fn deadline_interrupt_is_delivered_once() {
        let host = sim_host(SimHostConfig::default());
        let count = Arc::new(AtomicU32::new(0));
        host.register_vector(0xef, counting_handler(&count));
        host.set_tsc_deadline_mode(0xef);
        host.enable_interrupts();

        host.wrmsr(IA32_TSC_DEADLINE, host.tsc() + 10_000).unwrap();
        while count.load(Ordering::Relaxed) == 0 {
            host.relax();
        }
        for _ in 0..4 {
            host.relax();
        }

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(host.interrupts_delivered(), 1);
        assert_eq!(host.eoi_count(), 1);
        assert_eq!(host.rdmsr(IA32_TSC_DEADLINE).unwrap(), 0);
    }

    #[test]
    fn masked_timer_disarms_without_delivery() {
        let host = sim_host(SimHostConfig::default());
        let count = Arc::new(AtomicU32::new(0));
        host.register_vector(0xef, counting_handler(&count));
        host.set_tsc_deadline_mode(0xef);

        host.wrmsr(IA32_TSC_DEADLINE, host.tsc() + 10).unwrap();
        host.relax();
        assert_eq!(host.rdmsr(IA32_TSC_DEADLINE).unwrap(), 0);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn deadline_msr_faults_without_the_feature() {
        let mut config = SimHostConfig::default();
        config.features.tsc_deadline = false;
        let host = sim_host(config);

        let leaf1 = Leaf1Ecx::from_bits_retain(
            host.cpuid(CpuidIdent::leaf(FEATURE_LEAF)).ecx,
        );
        assert!(!leaf1.contains(Leaf1Ecx::TSC_DEADLINE));
        assert!(host.wrmsr(IA32_TSC_DEADLINE, 1).is_err());
    }

    #[test]
    fn cpuid_overrides_replace_built_in_leaves() {
        let mut config = SimHostConfig::default();
        config.cpuid.insert("0x40000004".to_string(), [1, 2, 3, 4]);
        config.cpuid.insert("15-0".to_string(), [1, 88, 25_000_000, 0]);
        let host = sim_host(config);

        assert_eq!(
            host.cpuid(CpuidIdent::leaf(0x4000_0004)),
            CpuidValues { eax: 1, ebx: 2, ecx: 3, edx: 4 }
        );
        assert_eq!(
            host.cpuid(CpuidIdent::subleaf(TSC_CRYSTAL_LEAF, 0)).ecx,
            25_000_000
        );
    }

    #[test]
    fn bad_cpuid_override_is_a_config_error() {
        let mut config = SimHostConfig::default();
        config.cpuid.insert("leaf".to_string(), [0; 4]);
        assert!(SimHost::new(&discard_log(), &config).is_err());
    }

    #[test]
    fn pages_are_reclaimed() {
        let host = sim_host(SimHostConfig { pages: 1, ..Default::default() });
        let page = host.allocate_page().unwrap();
        assert!(host.allocate_page().is_none());
        assert_eq!(host.pages_in_use(), 1);
        host.free_page(page);
        assert_eq!(host.pages_in_use(), 0);
    }

    #[test]
    fn reference_counter_tracks_tsc() {
        let host = sim_host(SimHostConfig::default());
        let first = host.rdmsr(HV_X64_MSR_TIME_REF_COUNT).unwrap();
        assert!(first >= 3_000_000);
        for _ in 0..100 {
            host.relax();
        }
        let second = host.rdmsr(HV_X64_MSR_TIME_REF_COUNT).unwrap();
        assert!(second > first);
    }
}
