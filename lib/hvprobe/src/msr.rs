// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// A model-specific register (MSR) number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsrId(pub u32);

impl std::fmt::Display for MsrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The operation that raised an [`MsrFault`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrAccess {
    Read,
    Write(u64),
}

/// An RDMSR or WRMSR raised a general protection fault.
///
/// Whether an access faults is part of what the probe checks: some registers
/// are required to reject writes with #GP, so a fault is an ordinary value
/// here, not an exceptional condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("#GP on {access:?} of MSR {msr}")]
pub struct MsrFault {
    pub msr: MsrId,
    pub access: MsrAccess,
}

impl MsrFault {
    pub fn read(msr: MsrId) -> Self {
        Self { msr, access: MsrAccess::Read }
    }

    pub fn write(msr: MsrId, value: u64) -> Self {
        Self { msr, access: MsrAccess::Write(value) }
    }
}

/// How the simulated host disposed of an RDMSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RdmsrOutcome {
    /// No model claims this MSR; the access raises #GP.
    NotHandled,

    /// The guest reads the contained value.
    Handled(u64),

    /// The MSR is modeled but not readable in the current configuration.
    GpException,
}

/// How the simulated host disposed of a WRMSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WrmsrOutcome {
    NotHandled,
    Handled,

    /// The MSR is modeled but rejects this write, e.g. a read-only register.
    GpException,
}
