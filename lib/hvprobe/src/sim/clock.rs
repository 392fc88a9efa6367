// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The simulated TSC, the reference counter derived from it, and the local
//! APIC timer's TSC-deadline comparator.
//!
//! Time only moves when the guest does something: every instruction the probe
//! issues costs a fixed number of cycles, and a spin-loop hint skips ahead.

use hvprobe_config::SimHostConfig;

use crate::common::HUNDRED_NS_PER_SEC;

pub(super) struct Clock {
    tsc: u64,
    tsc_hz: u64,
    relax_cycles: u64,
    skew_ppm: i64,
    stall: bool,
    stalled_at: Option<u64>,

    /// The armed TSC deadline, or 0 if the timer is disarmed.
    deadline: u64,
}

impl Clock {
    pub(super) fn new(config: &SimHostConfig) -> Self {
        let tsc = config.boot_reference_count as u128 * config.tsc_hz as u128
            / HUNDRED_NS_PER_SEC as u128;

        Self {
            tsc: u64::try_from(tsc).unwrap_or(u64::MAX),
            tsc_hz: config.tsc_hz,
            relax_cycles: config.relax_cycles,
            skew_ppm: config.quirks.reference_counter_skew_ppm,
            stall: config.quirks.stall_reference_counter,
            stalled_at: None,
            deadline: 0,
        }
    }

    pub(super) fn tsc(&self) -> u64 {
        self.tsc
    }

    pub(super) fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Moves the TSC forward by `cycles`. Returns `true` if this crossed the
    /// armed deadline, in which case the timer is now disarmed.
    pub(super) fn advance(&mut self, cycles: u64) -> bool {
        self.tsc = self.tsc.saturating_add(cycles);
        self.check_deadline()
    }

    /// A spin-loop iteration. Never steps past an armed deadline, so waiting
    /// for the timer lands exactly on it.
    pub(super) fn relax(&mut self) -> bool {
        let cycles = if self.deadline > self.tsc {
            self.relax_cycles.min(self.deadline - self.tsc)
        } else {
            self.relax_cycles
        };

        self.advance(cycles)
    }

    /// Writes the deadline comparator. A deadline at or before the current
    /// TSC expires immediately; 0 disarms the timer.
    pub(super) fn arm(&mut self, deadline: u64) -> bool {
        self.deadline = deadline;
        self.check_deadline()
    }

    /// The partition reference counter: TSC time since partition creation in
    /// 100 ns units, distorted by whatever quirks are configured.
    pub(super) fn reference_count(&mut self) -> u64 {
        if let Some(stalled) = self.stalled_at {
            return stalled;
        }

        let ticks = (self.tsc as u128 * HUNDRED_NS_PER_SEC as u128
            / self.tsc_hz as u128) as i128;
        let skewed = ticks + ticks * self.skew_ppm as i128 / 1_000_000;
        let value = skewed.clamp(0, u64::MAX as i128) as u64;

        if self.stall {
            self.stalled_at = Some(value);
        }

        value
    }

    fn check_deadline(&mut self) -> bool {
        if self.deadline != 0 && self.tsc >= self.deadline {
            self.deadline = 0;
            true
        } else {
            false
        }
    }
}
