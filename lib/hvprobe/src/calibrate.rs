// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Derives the TSC frequency from CPUID.
//!
//! Leaf 0x15 reports the core crystal clock frequency and the ratio between
//! it and the TSC. Virtualized and older processors frequently withhold the
//! crystal frequency (ecx = 0); in that case the TSC is assumed to run at the
//! base frequency from leaf 0x16, and the APIC timer frequency is backed out of
//! the leaf 0x15 ratio instead.

use cpuid_utils::bits::{
    FrequencyLeaf, TscCrystalLeaf, FREQUENCY_LEAF, STANDARD_BASE_LEAF,
    TSC_CRYSTAL_LEAF,
};
use cpuid_utils::CpuidIdent;
use slog::info;
use thiserror::Error;

use crate::platform::Cpu;

const HZ_PER_MHZ: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error(
        "TSC/crystal ratio {numerator}/{denominator} has a zero term"
    )]
    ZeroRatio { numerator: u32, denominator: u32 },

    #[error("CPUID reports no usable TSC frequency")]
    Uncalibrated,

    #[error("{0} frequency does not fit in 64 bits")]
    Overflow(&'static str),
}

/// The clock rates the rest of the probe converts ticks with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrequencyProfile {
    /// TSC ticks per second. Never zero.
    pub counter_hz: u64,

    /// Local APIC timer ticks per second.
    pub timer_hz: u64,

    /// Processor base frequency, or 0 if leaf 0x16 was not consulted.
    pub cpu_hz: u64,

    /// Bus (reference) frequency, or 0 if leaf 0x16 was not consulted.
    pub bus_hz: u64,
}

fn narrow(value: u128, what: &'static str) -> Result<u64, CalibrationError> {
    u64::try_from(value).map_err(|_| CalibrationError::Overflow(what))
}

impl FrequencyProfile {
    /// Builds a profile from the contents of leaf 0x15. `frequency` supplies
    /// leaf 0x16 and is only consulted when `crystal` has no crystal
    /// frequency.
    pub fn from_leaves(
        crystal: TscCrystalLeaf,
        frequency: impl FnOnce() -> FrequencyLeaf,
    ) -> Result<Self, CalibrationError> {
        let TscCrystalLeaf { denominator, numerator, crystal_hz } = crystal;
        let zero_ratio =
            || CalibrationError::ZeroRatio { numerator, denominator };

        let profile = if crystal_hz != 0 {
            if numerator == 0 || denominator == 0 {
                return Err(zero_ratio());
            }

            Self {
                counter_hz: narrow(
                    crystal_hz as u128 * numerator as u128
                        / denominator as u128,
                    "TSC",
                )?,
                timer_hz: crystal_hz as u64,
                cpu_hz: 0,
                bus_hz: 0,
            }
        } else {
            let freq = frequency();
            let counter_hz = freq.base_mhz as u64 * HZ_PER_MHZ;
            if counter_hz == 0 {
                return Err(CalibrationError::Uncalibrated);
            }

            // The timer rate comes from the leaf 0x15 ratio, which hosts
            // that withhold the crystal frequency often zero out as well.
            if numerator == 0 || denominator == 0 {
                return Err(zero_ratio());
            }

            Self {
                counter_hz,
                timer_hz: narrow(
                    counter_hz as u128 * denominator as u128
                        / numerator as u128,
                    "APIC timer",
                )?,
                cpu_hz: counter_hz,
                bus_hz: freq.bus_mhz as u64 * HZ_PER_MHZ,
            }
        };

        if profile.counter_hz == 0 {
            return Err(CalibrationError::Uncalibrated);
        }

        Ok(profile)
    }
}

/// Queries the frequency leaves on `cpu` and builds a [`FrequencyProfile`].
///
/// Leaves above the maximum standard leaf reported in leaf 0 are treated as
/// all zeroes rather than queried, since processors answer out-of-range
/// queries with the contents of some other leaf.
pub fn calibrate(
    cpu: &(impl Cpu + ?Sized),
    log: &slog::Logger,
) -> Result<FrequencyProfile, CalibrationError> {
    let max_leaf = cpu.cpuid(CpuidIdent::leaf(STANDARD_BASE_LEAF)).eax;
    let query = |leaf: u32| {
        if leaf <= max_leaf {
            cpu.cpuid(CpuidIdent::subleaf(leaf, 0))
        } else {
            Default::default()
        }
    };

    let crystal = TscCrystalLeaf::from(query(TSC_CRYSTAL_LEAF));
    info!(log, "TSC crystal leaf";
          "crystal_hz" => crystal.crystal_hz,
          "numerator" => crystal.numerator,
          "denominator" => crystal.denominator);

    let profile = FrequencyProfile::from_leaves(crystal, || {
        FrequencyLeaf::from(query(FREQUENCY_LEAF))
    })?;

    info!(log, "calibrated frequencies";
          "apic_timer_hz" => profile.timer_hz,
          "tsc_hz" => profile.counter_hz,
          "cpu_hz" => profile.cpu_hz,
          "bus_hz" => profile.bus_hz);

    Ok(profile)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn unused_leaf() -> FrequencyLeaf {
        panic!("leaf 0x16 should not be consulted")
    }

    #[test]
    fn withheld_crystal_falls_back_to_base_frequency() {
        // The values a 2.1 GHz host with a 176/2 ratio reports.
        let profile = FrequencyProfile::from_leaves(
            TscCrystalLeaf { denominator: 2, numerator: 176, crystal_hz: 0 },
            || FrequencyLeaf { base_mhz: 2100, max_mhz: 2100, bus_mhz: 100 },
        )
        .unwrap();

        assert_eq!(
            profile,
            FrequencyProfile {
                counter_hz: 2_100_000_000,
                timer_hz: 23_863_636,
                cpu_hz: 2_100_000_000,
                bus_hz: 100_000_000,
            }
        );
    }

    #[test]
    fn crystal_branch_leaves_leaf_16_fields_zero() {
        let profile = FrequencyProfile::from_leaves(
            TscCrystalLeaf {
                denominator: 2,
                numerator: 168,
                crystal_hz: 25_000_000,
            },
            unused_leaf,
        )
        .unwrap();

        assert_eq!(profile.counter_hz, 2_100_000_000);
        assert_eq!(profile.timer_hz, 25_000_000);
        assert_eq!(profile.cpu_hz, 0);
        assert_eq!(profile.bus_hz, 0);
    }

    #[test]
    fn zero_ratio_terms_fail_calibration() {
        let err = FrequencyProfile::from_leaves(
            TscCrystalLeaf { denominator: 0, numerator: 0, crystal_hz: 0 },
            || FrequencyLeaf { base_mhz: 2100, max_mhz: 2100, bus_mhz: 100 },
        )
        .unwrap_err();
        assert_eq!(
            err,
            CalibrationError::ZeroRatio { numerator: 0, denominator: 0 }
        );

        let err = FrequencyProfile::from_leaves(
            TscCrystalLeaf {
                denominator: 0,
                numerator: 100,
                crystal_hz: 24_000_000,
            },
            unused_leaf,
        )
        .unwrap_err();
        assert!(matches!(err, CalibrationError::ZeroRatio { .. }));
    }

    #[test]
    fn all_zero_leaves_are_uncalibrated() {
        let err = FrequencyProfile::from_leaves(
            TscCrystalLeaf::default(),
            FrequencyLeaf::default,
        )
        .unwrap_err();
        assert_eq!(err, CalibrationError::Uncalibrated);

        // A ratio that truncates the TSC frequency to zero.
        let err = FrequencyProfile::from_leaves(
            TscCrystalLeaf { denominator: 4, numerator: 1, crystal_hz: 3 },
            unused_leaf,
        )
        .unwrap_err();
        assert_eq!(err, CalibrationError::Uncalibrated);
    }

    #[test]
    fn oversized_timer_rate_is_reported() {
        let err = FrequencyProfile::from_leaves(
            TscCrystalLeaf {
                denominator: u32::MAX,
                numerator: 1,
                crystal_hz: 0,
            },
            || FrequencyLeaf { base_mhz: 0xffff, max_mhz: 0, bus_mhz: 0 },
        )
        .unwrap_err();
        assert_eq!(err, CalibrationError::Overflow("APIC timer"));
    }

    proptest! {
        #[test]
        fn crystal_ratio_truncates(
            crystal_hz in 1..=u32::MAX,
            numerator in 1..=u32::MAX,
            denominator in 1..=u32::MAX,
        ) {
            let expected = crystal_hz as u128 * numerator as u128
                / denominator as u128;
            let result = FrequencyProfile::from_leaves(
                TscCrystalLeaf { denominator, numerator, crystal_hz },
                unused_leaf,
            );

            match result {
                Ok(profile) => {
                    prop_assert_eq!(profile.counter_hz as u128, expected);
                    prop_assert_eq!(profile.timer_hz, crystal_hz as u64);
                }
                Err(CalibrationError::Uncalibrated) => {
                    prop_assert_eq!(expected, 0)
                }
                Err(e) => prop_assert!(false, "unexpected error {e}"),
            }
        }
    }
}
