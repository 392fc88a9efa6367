// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for hypercalls and their related MSRs.
//!
//! A guest enables hypercalls by identifying itself through
//! [`HV_X64_MSR_GUEST_OS_ID`] and then pointing [`HV_X64_MSR_HYPERCALL`] at a
//! page of its own memory. The host overwrites that page with the instruction
//! sequence the guest must call to reach it. See TLFS section 3.13.

use slog::{debug, warn};
use thiserror::Error;

use crate::bits::{
    HV_HYPERCALL_FAST, HV_STATUS_INVALID_HYPERCALL_CODE, HV_STATUS_SUCCESS,
    HV_X64_MSR_GUEST_OS_ID, HV_X64_MSR_HYPERCALL,
};
use crate::common::{GuestAddr, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::msr::MsrFault;
use crate::platform::{CallGate, Cpu, PageAllocator, PageHandle};

const LOCKED_BIT: u64 = 1;
const LOCKED_MASK: u64 = 1 << LOCKED_BIT;
const ENABLED_BIT: u64 = 0;
const ENABLED_MASK: u64 = 1 << ENABLED_BIT;

/// Represents a value written to the [`HV_X64_MSR_HYPERCALL`] register.
///
/// Bits 11:2 of this register are reserved. The TLFS specifies that the guest
/// "should ignore [them] on reads and preserve [them] on writes".
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrHypercallValue(pub u64);

impl std::fmt::Debug for MsrHypercallValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsrHypercallValue")
            .field("raw", &format!("{:#x}", self.0))
            .field("gpa", &format!("{:#x}", self.gpa().0))
            .field("locked", &self.locked())
            .field("enabled", &self.enabled())
            .finish()
    }
}

impl MsrHypercallValue {
    /// A value that places an enabled (or disabled) page at `gpa`.
    pub fn new(gpa: GuestAddr, enabled: bool) -> Self {
        let enable = if enabled { ENABLED_MASK } else { 0 };
        Self((gpa.0 & PAGE_MASK as u64) | enable)
    }

    /// Yields the guest page number at which the hypercall page is placed.
    pub fn gpfn(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the guest physical address at which the hypercall page is
    /// placed.
    pub fn gpa(&self) -> GuestAddr {
        GuestAddr(self.0 & PAGE_MASK as u64)
    }

    /// Returns whether the hypercall page location is locked. Once locked, the
    /// value in `MSR_HYPERCALL` cannot change until the hypervisor resets the
    /// guest.
    pub fn locked(&self) -> bool {
        (self.0 & LOCKED_MASK) != 0
    }

    /// Indicates whether the hypercall page is enabled.
    pub fn enabled(&self) -> bool {
        (self.0 & ENABLED_MASK) != 0
    }

    /// Clears this value's enabled bit.
    pub fn clear_enabled(&mut self) {
        self.0 &= !ENABLED_MASK;
    }
}

/// `mov rax, 2; ret`: a hypercall page that answers every call with
/// [`HV_STATUS_INVALID_HYPERCALL_CODE`] without leaving the guest.
pub const HYPERCALL_INSTRUCTION_SEQUENCE: [u8; 8] =
    [0x48, 0xc7, 0xc0, 0x02, 0x00, 0x00, 0x00, 0xc3];

/// Yields a page-sized buffer containing the contents of the hypercall page.
pub fn hypercall_page_contents() -> [u8; PAGE_SIZE] {
    let mut page = [0u8; PAGE_SIZE];
    page[0..HYPERCALL_INSTRUCTION_SEQUENCE.len()]
        .copy_from_slice(&HYPERCALL_INSTRUCTION_SEQUENCE);
    page
}

/// The value [`HypercallChannel::issue`] reports when the host did not
/// preserve the input register across the call.
pub const HYPERCALL_ECHO_MISMATCH: u64 = u64::MAX;

/// A hypercall result value. The status code is in bits 15:0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HypercallStatus(pub u64);

impl HypercallStatus {
    pub const SUCCESS: Self = Self(HV_STATUS_SUCCESS as u64);
    pub const INVALID_HYPERCALL_CODE: Self =
        Self(HV_STATUS_INVALID_HYPERCALL_CODE as u64);
    pub const ECHO_MISMATCH: Self = Self(HYPERCALL_ECHO_MISMATCH);

    pub fn code(&self) -> u16 {
        self.0 as u16
    }

    pub fn is_echo_mismatch(&self) -> bool {
        *self == Self::ECHO_MISMATCH
    }
}

impl std::fmt::Display for HypercallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum HypercallError {
    #[error("failed to allocate hypercall page")]
    Allocation,

    #[error("hypercall MSR access failed")]
    Msr(#[from] MsrFault),

    #[error("hypercall page is not enabled")]
    ChannelDisabled,
}

/// A hypercall page owned by the probe.
///
/// While a channel exists the page is registered with the host. Dropping the
/// channel tears it down.
pub struct HypercallChannel<'a, P: Cpu + CallGate + PageAllocator + ?Sized> {
    log: slog::Logger,
    platform: &'a P,
    page: Option<PageHandle>,
    gpa: GuestAddr,
    enabled: bool,
}

impl<'a, P: Cpu + CallGate + PageAllocator + ?Sized> HypercallChannel<'a, P> {
    /// Allocates and zeroes a page, reports `guest_os_id`, and asks the host
    /// to install its hypercall page there.
    ///
    /// The returned channel is enabled only if the host's hypercall MSR
    /// reflects the request afterwards.
    pub fn setup(
        platform: &'a P,
        guest_os_id: u64,
        log: &slog::Logger,
    ) -> Result<Self, HypercallError> {
        let page = platform.allocate_page().ok_or(HypercallError::Allocation)?;
        platform.zero_page(&page);
        let gpa = platform.physical_address_of(&page);

        // The channel owns the page from here on, so early returns release it.
        let mut channel = Self {
            log: log.clone(),
            platform,
            page: Some(page),
            gpa,
            enabled: false,
        };

        let request = MsrHypercallValue::new(gpa, true);
        platform.wrmsr(HV_X64_MSR_GUEST_OS_ID, guest_os_id)?;
        platform.wrmsr(HV_X64_MSR_HYPERCALL, request.0)?;

        let installed =
            MsrHypercallValue(platform.rdmsr(HV_X64_MSR_HYPERCALL)?);
        channel.enabled = installed.enabled() && installed.gpa() == gpa;
        debug!(channel.log, "hypercall page set up";
               "requested" => ?request,
               "installed" => ?installed);

        Ok(channel)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn gpa(&self) -> GuestAddr {
        self.gpa
    }

    /// Issues hypercall `code` with `arg` as its input.
    ///
    /// The host must hand the input register back unchanged. If the low 32
    /// bits of rdx differ from `arg` after the call, the host's result is
    /// discarded and [`HypercallStatus::ECHO_MISMATCH`] is returned in its
    /// place.
    pub fn issue(
        &self,
        code: u16,
        arg: u64,
        fast: bool,
    ) -> Result<HypercallStatus, HypercallError> {
        let page = match (&self.page, self.enabled) {
            (Some(page), true) => page,
            _ => return Err(HypercallError::ChannelDisabled),
        };

        let mut control = code as u64;
        if fast {
            control |= HV_HYPERCALL_FAST;
        }

        // SAFETY: the channel is enabled, so the host installed its hypercall
        // page at `page` and nothing has disabled it since.
        let regs = unsafe { self.platform.hypercall(page, control, arg) };

        if regs.rdx as u32 != arg as u32 {
            warn!(self.log, "hypercall clobbered its input register";
                  "code" => code,
                  "arg" => arg,
                  "rdx" => regs.rdx,
                  "rax" => regs.rax);
            return Ok(HypercallStatus::ECHO_MISMATCH);
        }

        Ok(HypercallStatus(regs.rax))
    }

    /// Disables the hypercall page, clears the guest OS identity, and frees
    /// the page. Later calls do nothing.
    ///
    /// The page is freed even if the host faults either MSR write; the first
    /// fault is returned.
    pub fn teardown(&mut self) -> Result<(), HypercallError> {
        let Some(page) = self.page.take() else {
            return Ok(());
        };

        self.enabled = false;
        let hypercall = self.platform.wrmsr(HV_X64_MSR_HYPERCALL, 0);
        let os_id = self.platform.wrmsr(HV_X64_MSR_GUEST_OS_ID, 0);
        self.platform.free_page(page);

        hypercall?;
        os_id?;
        Ok(())
    }
}

impl<P: Cpu + CallGate + PageAllocator + ?Sized> Drop
    for HypercallChannel<'_, P>
{
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(self.log, "error tearing down hypercall page"; "error" => %e);
        }
    }
}
