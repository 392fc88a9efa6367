// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A guest-side conformance probe for the Microsoft Hyper-V hypervisor
//! interface.
//!
//! The probe runs inside a virtual machine and checks that the host's
//! Hyper-V enlightenments (the hypervisor CPUID leaves, the synthetic MSRs,
//! the hypercall page and the partition reference time sources) behave as
//! the TLFS and Microsoft's minimum interface requirements say they must.
//! Everything it needs from the machine goes through the traits in
//! [`platform`]; [`arch`] implements the processor-level ones with real
//! instructions and [`sim::SimHost`] implements all of them in software.

#![allow(clippy::style)]

pub mod arch;
pub mod bits;
pub mod calibrate;
pub mod checks;
pub mod common;
pub mod engine;
pub mod hypercall;
pub mod msr;
pub mod platform;
pub mod report;
pub mod sim;
pub mod tsc;

pub use checks::CheckId;
pub use engine::{Engine, EngineOutcome, EngineState};
pub use report::{Report, TestOutcome};
