// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The probe's processor services on real hardware.
//!
//! These execute privileged instructions and only work when the probe runs
//! at CPL 0 inside the guest under test. Memory and interrupt services always
//! come from the embedder.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;
