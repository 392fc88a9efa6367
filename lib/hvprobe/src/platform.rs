// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Services the probe consumes from whatever it is running on.
//!
//! On real hardware these are the embedder's page allocator, interrupt
//! dispatch, and the raw instructions in [`crate::arch`]. In tests, and in the
//! standalone runner, [`crate::sim::SimHost`] provides all of them.

use std::sync::Arc;

use cpuid_utils::{CpuidIdent, CpuidValues};

use crate::common::GuestAddr;
use crate::msr::{MsrFault, MsrId};

/// Processor-level primitives.
pub trait Cpu {
    fn cpuid(&self, ident: CpuidIdent) -> CpuidValues;

    fn rdmsr(&self, msr: MsrId) -> Result<u64, MsrFault>;

    fn wrmsr(&self, msr: MsrId, value: u64) -> Result<(), MsrFault>;

    /// Reads the free-running time stamp counter.
    fn rdtsc(&self) -> u64;

    /// Spin-loop hint issued on every iteration of a busy-wait.
    fn relax(&self);

    /// The identifier of the processor the probe is running on.
    fn current_processor_id(&self) -> u32;
}

/// An exclusively-owned page of guest memory.
///
/// Handles are neither `Clone` nor `Copy`: whoever holds one is the only
/// party that may hand it back to [`PageAllocator::free_page`].
#[derive(Debug, PartialEq, Eq)]
pub struct PageHandle {
    vaddr: usize,
}

impl PageHandle {
    /// Wraps the page mapped at `vaddr`. Only allocators should call this.
    pub fn new(vaddr: usize) -> Self {
        Self { vaddr }
    }

    /// The address at which the page is mapped in the probe's address space.
    pub fn vaddr(&self) -> usize {
        self.vaddr
    }
}

pub trait PageAllocator {
    fn allocate_page(&self) -> Option<PageHandle>;

    fn physical_address_of(&self, page: &PageHandle) -> GuestAddr;

    fn free_page(&self, page: PageHandle);

    /// Copies `buf.len()` bytes starting at `offset` within `page` into `buf`.
    /// The page may be written concurrently by the host, so implementations
    /// must read it with volatile semantics.
    fn read_bytes(&self, page: &PageHandle, offset: usize, buf: &mut [u8]);

    fn zero_page(&self, page: &PageHandle);
}

/// The register state returned by a hypercall.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HypercallRegs {
    /// The hypercall result value.
    pub rax: u64,

    /// The register the caller passed its input in. The calling convention
    /// requires the host to leave it intact.
    pub rdx: u64,
}

/// Transfers control into a host-installed hypercall page.
pub trait CallGate {
    /// Calls the first instruction of `page` with `control` in rcx and
    /// `input` in rdx.
    ///
    /// # Safety
    ///
    /// `page` must hold a hypercall page the host has installed and not since
    /// disabled. Calling into any other page executes whatever bytes it
    /// happens to contain.
    unsafe fn hypercall(
        &self,
        page: &PageHandle,
        control: u64,
        input: u64,
    ) -> HypercallRegs;
}

/// Lets an interrupt handler acknowledge the interrupt it is servicing.
pub trait EndOfInterrupt {
    fn signal_end_of_interrupt(&self);
}

/// A handler for one interrupt vector. Handlers run in interrupt context and
/// must signal end-of-interrupt through the supplied controller.
pub type InterruptHandler = Arc<dyn Fn(&dyn EndOfInterrupt) + Send + Sync>;

/// The local interrupt controller and vector dispatch.
pub trait InterruptController: EndOfInterrupt {
    /// Programs the local APIC timer's LVT entry for TSC-deadline mode on
    /// `vector`. Arming happens through [`crate::bits::IA32_TSC_DEADLINE`].
    fn set_tsc_deadline_mode(&self, vector: u8);

    fn register_vector(&self, vector: u8, handler: InterruptHandler);

    fn enable_interrupts(&self);
}

/// Everything the engine needs from its environment.
pub trait Platform: Cpu + CallGate + PageAllocator + InterruptController {}

impl<T: Cpu + CallGate + PageAllocator + InterruptController + ?Sized> Platform
    for T
{
}
