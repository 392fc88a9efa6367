// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::arch::asm;

use cpuid_utils::{CpuidIdent, CpuidValues};

use crate::common::GuestAddr;
use crate::msr::{MsrFault, MsrId};
use crate::platform::{
    CallGate, Cpu, EndOfInterrupt, HypercallRegs, InterruptController,
    InterruptHandler, PageAllocator, PageHandle,
};

/// Executes RDMSR.
///
/// # Safety
///
/// Raises #GP if `msr` is not readable. Must run at CPL 0.
pub unsafe fn rdmsr_unchecked(msr: MsrId) -> u64 {
    let lo: u32;
    let hi: u32;
    asm!(
        "rdmsr",
        in("ecx") msr.0,
        out("eax") lo,
        out("edx") hi,
        options(nostack, preserves_flags)
    );
    ((hi as u64) << 32) | lo as u64
}

/// Executes WRMSR.
///
/// # Safety
///
/// Raises #GP if `msr` does not accept `value`. Must run at CPL 0, and
/// writing an architectural MSR can change processor behavior arbitrarily.
pub unsafe fn wrmsr_unchecked(msr: MsrId, value: u64) {
    asm!(
        "wrmsr",
        in("ecx") msr.0,
        in("eax") value as u32,
        in("edx") (value >> 32) as u32,
        options(nostack, preserves_flags)
    );
}

/// Recovers from a #GP raised by a single MSR access.
///
/// The probe cannot install exception handlers itself, so the embedder
/// provides this, typically with an exception-table fixup that skips the
/// faulting instruction.
pub trait FaultGuard {
    /// Runs `access`, which executes exactly one RDMSR or WRMSR. Returns
    /// `false` if that instruction raised #GP and was skipped.
    fn run_guarded(&self, access: &mut dyn FnMut()) -> bool;
}

/// The processor the probe is running on.
pub struct HostCpu<G> {
    guard: G,
    processor_id: u32,
}

impl<G: FaultGuard> HostCpu<G> {
    /// # Safety
    ///
    /// The caller must be running at CPL 0 on processor `processor_id`, must
    /// stay on that processor for as long as this object lives, and `guard`
    /// must really recover from #GP.
    pub unsafe fn new(guard: G, processor_id: u32) -> Self {
        Self { guard, processor_id }
    }
}

impl<G: FaultGuard> Cpu for HostCpu<G> {
    fn cpuid(&self, ident: CpuidIdent) -> CpuidValues {
        cpuid_utils::host::query(ident)
    }

    fn rdmsr(&self, msr: MsrId) -> Result<u64, MsrFault> {
        let mut value = 0;
        // SAFETY: `new`'s contract puts us at CPL 0 with a working guard.
        let mut read = || value = unsafe { rdmsr_unchecked(msr) };
        if self.guard.run_guarded(&mut read) {
            Ok(value)
        } else {
            Err(MsrFault::read(msr))
        }
    }

    fn wrmsr(&self, msr: MsrId, value: u64) -> Result<(), MsrFault> {
        // SAFETY: as above. The probe only writes the Hyper-V synthetic MSRs
        // and IA32_TSC_DEADLINE.
        let mut write = || unsafe { wrmsr_unchecked(msr, value) };
        if self.guard.run_guarded(&mut write) {
            Ok(())
        } else {
            Err(MsrFault::write(msr, value))
        }
    }

    #[allow(unused_unsafe)]
    fn rdtsc(&self) -> u64 {
        // SAFETY: RDTSC is available on every x86-64 processor.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn relax(&self) {
        std::hint::spin_loop();
    }

    fn current_processor_id(&self) -> u32 {
        self.processor_id
    }
}

impl<G> CallGate for HostCpu<G> {
    unsafe fn hypercall(
        &self,
        page: &PageHandle,
        control: u64,
        input: u64,
    ) -> HypercallRegs {
        let rax: u64;
        let rdx: u64;
        // Fast hypercall convention: control in rcx, input in rdx, output
        // parameter (unused here) in r8, result in rax.
        asm!(
            "call {page}",
            page = in(reg) page.vaddr(),
            in("rcx") control,
            inout("rdx") input => rdx,
            in("r8") 0u64,
            out("rax") rax,
            clobber_abi("C"),
        );
        HypercallRegs { rax, rdx }
    }
}

/// A [`Platform`](crate::platform::Platform) built from the host processor
/// and embedder-supplied memory and interrupt services.
pub struct HostPlatform<G, S> {
    cpu: HostCpu<G>,
    services: S,
}

impl<G, S> HostPlatform<G, S>
where
    G: FaultGuard,
    S: PageAllocator + InterruptController,
{
    pub fn new(cpu: HostCpu<G>, services: S) -> Self {
        Self { cpu, services }
    }
}

impl<G: FaultGuard, S> Cpu for HostPlatform<G, S> {
    fn cpuid(&self, ident: CpuidIdent) -> CpuidValues {
        self.cpu.cpuid(ident)
    }

    fn rdmsr(&self, msr: MsrId) -> Result<u64, MsrFault> {
        self.cpu.rdmsr(msr)
    }

    fn wrmsr(&self, msr: MsrId, value: u64) -> Result<(), MsrFault> {
        self.cpu.wrmsr(msr, value)
    }

    fn rdtsc(&self) -> u64 {
        self.cpu.rdtsc()
    }

    fn relax(&self) {
        self.cpu.relax()
    }

    fn current_processor_id(&self) -> u32 {
        self.cpu.current_processor_id()
    }
}

impl<G, S> CallGate for HostPlatform<G, S> {
    unsafe fn hypercall(
        &self,
        page: &PageHandle,
        control: u64,
        input: u64,
    ) -> HypercallRegs {
        self.cpu.hypercall(page, control, input)
    }
}

impl<G, S: PageAllocator> PageAllocator for HostPlatform<G, S> {
    fn allocate_page(&self) -> Option<PageHandle> {
        self.services.allocate_page()
    }

    fn physical_address_of(&self, page: &PageHandle) -> GuestAddr {
        self.services.physical_address_of(page)
    }

    fn free_page(&self, page: PageHandle) {
        self.services.free_page(page)
    }

    fn read_bytes(&self, page: &PageHandle, offset: usize, buf: &mut [u8]) {
        self.services.read_bytes(page, offset, buf)
    }

    fn zero_page(&self, page: &PageHandle) {
        self.services.zero_page(page)
    }
}

impl<G, S: EndOfInterrupt> EndOfInterrupt for HostPlatform<G, S> {
    fn signal_end_of_interrupt(&self) {
        self.services.signal_end_of_interrupt()
    }
}

impl<G, S: InterruptController> InterruptController for HostPlatform<G, S> {
    fn set_tsc_deadline_mode(&self, vector: u8) {
        self.services.set_tsc_deadline_mode(vector)
    }

    fn register_vector(&self, vector: u8, handler: InterruptHandler) {
        self.services.register_vector(vector, handler)
    }

    fn enable_interrupts(&self) {
        self.services.enable_interrupts()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::platform::Platform;
    use crate::sim::test::sim_host;
    use hvprobe_config::SimHostConfig;

    /// Refuses every access, so no privileged instruction ever runs.
    struct NoAccess;

    impl FaultGuard for NoAccess {
        fn run_guarded(&self, _access: &mut dyn FnMut()) -> bool {
            false
        }
    }

    fn cpu() -> HostCpu<NoAccess> {
        // SAFETY: the guard never runs an access, so nothing privileged
        // executes.
        unsafe { HostCpu::new(NoAccess, 2) }
    }

    #[test]
    fn unprivileged_primitives_work() {
        let cpu = cpu();
        let a = cpu.rdtsc();
        cpu.relax();
        let b = cpu.rdtsc();
        assert!(b >= a);
        assert_eq!(cpu.current_processor_id(), 2);

        let leaf0 = CpuidIdent::leaf(0);
        assert_eq!(cpu.cpuid(leaf0), cpuid_utils::host::query(leaf0));
    }

    #[test]
    fn guarded_faults_become_errors() {
        let cpu = cpu();
        let msr = MsrId(0x4000_0020);
        assert_eq!(cpu.rdmsr(msr), Err(MsrFault::read(msr)));
        assert_eq!(cpu.wrmsr(msr, 9), Err(MsrFault::write(msr, 9)));
    }

    #[test]
    fn platform_delegates_memory_to_services() {
        fn assert_platform<P: Platform>(_: &P) {}

        let host = sim_host(SimHostConfig::default());
        let platform = HostPlatform::new(cpu(), host);
        assert_platform(&platform);

        let page = platform.allocate_page().unwrap();
        assert!(platform.physical_address_of(&page).is_page_aligned());
        platform.free_page(page);
        assert_eq!(platform.services.pages_in_use(), 0);
    }
}
