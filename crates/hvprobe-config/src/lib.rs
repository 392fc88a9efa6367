// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the Hyper-V enlightenment probe.
//!
//! A configuration file has three optional sections:
//!
//! - `[probe]` tunes the cross-validation protocols (sample counts and
//!   tolerances).
//! - `[expect]` holds the identification values the host under test is
//!   expected to report.
//! - `[host]` describes the simulated host the standalone runner probes,
//!   including fault-injection quirks and raw CPUID overrides.
//!
//! Every field has a default, so an empty file is a valid configuration that
//! describes a conforming host.

use std::collections::BTreeMap;

use anyhow::Context;
use cpuid_utils::{CpuidIdent, CpuidValues};
use serde::{Deserialize, Serialize};

/// Guest OS identity reported before enabling the hypercall page. This is the
/// "open source, vendor-specific" encoding from TLFS section 2.6 with every
/// version field zeroed.
pub const DEFAULT_GUEST_OS_ID: u64 = 0x8f00 << 48;

/// The privileges (CPUID 0x4000_0003 eax) a host exposing the reference
/// counter, hypercall, VP index and reference TSC MSRs reports.
pub const DEFAULT_PARTITION_PRIVILEGES: u32 =
    (1 << 1) | (1 << 5) | (1 << 6) | (1 << 9);

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub probe: ProbeOptions,
    pub expect: Expectations,
    pub host: SimHostConfig,
}

impl Config {
    /// Checks for option combinations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.reference_count_samples == 0 {
            return Err(ConfigError::Invalid {
                field: "probe.reference_count_samples",
                reason: "must take at least one sample after the baseline",
            });
        }
        if self.probe.deadline_iterations == 0 {
            return Err(ConfigError::Invalid {
                field: "probe.deadline_iterations",
                reason: "must run at least one deadline window",
            });
        }
        if self.probe.deadline_vector < 32 {
            return Err(ConfigError::Invalid {
                field: "probe.deadline_vector",
                reason: "vectors below 32 are reserved for exceptions",
            });
        }
        if self.host.tsc_hz == 0 {
            return Err(ConfigError::Invalid {
                field: "host.tsc_hz",
                reason: "the simulated TSC must advance",
            });
        }
        if self.host.access_cycles == 0 || self.host.relax_cycles == 0 {
            return Err(ConfigError::Invalid {
                field: "host.access_cycles",
                reason: "simulated accesses must cost at least one cycle",
            });
        }

        // Surface malformed overrides now rather than when the host is built.
        self.host.cpuid_overrides()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: &'static str },

    #[error("unable to parse CPUID leaf {0}: {1}")]
    CpuidLeaf(String, std::num::ParseIntError),
}

/// Tunables for the cross-validation protocols. The defaults reproduce the
/// reference workload; the tolerances in particular were chosen empirically
/// against one host's scheduling latency and may need loosening elsewhere.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeOptions {
    /// Guest OS identity written before enabling the hypercall page.
    #[serde(with = "hex_u64")]
    pub guest_os_id: u64,

    /// Number of reference-counter readings taken after the baseline in the
    /// monotonicity protocol.
    pub reference_count_samples: u32,

    /// Busy-wait between monotonicity readings, in nanoseconds.
    pub sample_interval_ns: u64,

    /// Number of one-second deadline windows to measure.
    pub deadline_iterations: u32,

    /// Interrupt vector used for the TSC-deadline timer.
    pub deadline_vector: u8,

    /// Allowed deviation (in 100 ns ticks) of each deadline window from one
    /// second of reference time.
    pub deadline_tolerance_ticks: u64,

    /// If set, a deadline interrupt that has not arrived after this many
    /// milliseconds of TSC time fails the check instead of hanging the run.
    pub deadline_watchdog_ms: Option<u64>,

    /// Slack added to the reference TSC page's time before comparing it with
    /// the reference counter read just after it.
    pub clock_page_tolerance_ticks: u64,

    /// Upper bound for the reference counter when the probe starts, i.e. how
    /// long after partition creation the probe may begin (100 ns units).
    pub initial_reference_count_limit: u64,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            guest_os_id: DEFAULT_GUEST_OS_ID,
            reference_count_samples: 20,
            sample_interval_ns: 100,
            deadline_iterations: 10,
            deadline_vector: 0xef,
            deadline_tolerance_ticks: 100,
            deadline_watchdog_ms: None,
            clock_page_tolerance_ticks: 10,
            initial_reference_count_limit: 2 * 10_000_000,
        }
    }
}

/// Identification values the host is expected to report.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Expectations {
    /// CPUID 0x4000_0003 eax.
    pub partition_privileges: u32,

    /// CPUID 0x4000_0005 eax.
    pub max_virtual_processors: u32,
}

impl Default for Expectations {
    fn default() -> Self {
        Self {
            partition_privileges: DEFAULT_PARTITION_PRIVILEGES,
            max_virtual_processors: 8,
        }
    }
}

/// The simulated host the standalone runner probes.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SimHostConfig {
    /// The rate at which the simulated TSC actually advances.
    pub tsc_hz: u64,

    /// CPUID 0x15 ecx. Zero withholds the crystal frequency, forcing guests
    /// onto the leaf 0x16 fallback.
    pub crystal_hz: u32,

    /// CPUID 0x15 ebx.
    pub tsc_ratio_numerator: u32,

    /// CPUID 0x15 eax.
    pub tsc_ratio_denominator: u32,

    /// CPUID 0x16 eax.
    pub base_mhz: u32,

    /// CPUID 0x16 ebx.
    pub max_mhz: u32,

    /// CPUID 0x16 ecx.
    pub bus_mhz: u32,

    /// Identifier of the processor the probe runs on; also the VP index.
    pub processor_id: u32,

    /// CPUID 0x4000_0005 eax.
    pub max_virtual_processors: u32,

    /// Reference time (100 ns units) that has elapsed since partition
    /// creation when the probe starts.
    pub boot_reference_count: u64,

    /// TSC cycles consumed by each guest-visible access (MSR, CPUID, RDTSC).
    pub access_cycles: u64,

    /// Upper bound on TSC cycles consumed by one spin-loop pause.
    pub relax_cycles: u64,

    /// Number of pages the simulated allocator can hand out.
    pub pages: u32,

    pub features: SimFeatures,
    pub quirks: SimQuirks,

    /// Raw CPUID overrides applied after the host's own table is built. Keys
    /// are hexadecimal leaf numbers, optionally followed by `-subleaf`; values
    /// are `[eax, ebx, ecx, edx]`.
    pub cpuid: BTreeMap<String, [u32; 4]>,
}

impl Default for SimHostConfig {
    fn default() -> Self {
        // A 2.1 GHz part with a withheld crystal frequency and a 176/2 ratio,
        // i.e. a 23.86 MHz APIC timer.
        Self {
            tsc_hz: 2_100_000_000,
            crystal_hz: 0,
            tsc_ratio_numerator: 176,
            tsc_ratio_denominator: 2,
            base_mhz: 2100,
            max_mhz: 2100,
            bus_mhz: 100,
            processor_id: 0,
            max_virtual_processors: 8,
            boot_reference_count: 3_000_000,
            access_cycles: 64,
            relax_cycles: 1_000_000,
            pages: 16,
            features: SimFeatures::default(),
            quirks: SimQuirks::default(),
            cpuid: BTreeMap::new(),
        }
    }
}

impl SimHostConfig {
    /// Parses the `cpuid` override table.
    pub fn cpuid_overrides(
        &self,
    ) -> Result<Vec<(CpuidIdent, CpuidValues)>, ConfigError> {
        let parse = |s: &str| {
            u32::from_str_radix(s.trim_start_matches("0x"), 16)
        };

        self.cpuid
            .iter()
            .map(|(key, regs)| {
                let err = |e| ConfigError::CpuidLeaf(key.clone(), e);
                let ident = match key.split_once('-') {
                    None => CpuidIdent::leaf(parse(key).map_err(err)?),
                    Some((leaf, sub)) => CpuidIdent::subleaf(
                        parse(leaf).map_err(err)?,
                        parse(sub).map_err(err)?,
                    ),
                };
                Ok((ident, CpuidValues::from(*regs)))
            })
            .collect()
    }
}

/// Enlightenments and platform capabilities the simulated host exposes.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SimFeatures {
    /// Expose the reference counter MSR and the reference TSC page.
    pub reference_tsc: bool,

    /// Advertise TSC-deadline mode for the local APIC timer.
    pub tsc_deadline: bool,

    /// Advertise an invariant TSC.
    pub invariant_tsc: bool,
}

impl Default for SimFeatures {
    fn default() -> Self {
        Self { reference_tsc: true, tsc_deadline: true, invariant_tsc: true }
    }
}

/// Non-conforming behaviors the simulated host can be told to exhibit.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SimQuirks {
    /// The hypercall stub scribbles over rdx instead of preserving it.
    pub clobber_hypercall_rdx: bool,

    /// The reference counter stops advancing after its first read.
    pub stall_reference_counter: bool,

    /// Rate error of the reference counter, in parts per million.
    pub reference_counter_skew_ppm: i64,

    /// Deadline timer interrupts are never delivered.
    pub drop_deadline_interrupts: bool,

    /// The reference TSC page is never populated (sequence stays 0).
    pub unpublished_reference_tsc: bool,

    /// Offset published on the reference TSC page, in 100 ns units, on top of
    /// the correct one.
    pub reference_tsc_offset: i64,

    /// The page allocator always reports exhaustion.
    pub fail_page_allocation: bool,
}

/// Full-width register values do not fit TOML's signed integers, so they are
/// written as hex strings. Integers within range are accepted on input.
mod hex_u64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &u64,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Int(u64),
        Str(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<u64, D::Error> {
        let text = match Repr::deserialize(deserializer)? {
            Repr::Int(value) => return Ok(value),
            Repr::Str(text) => text,
        };

        let digits = text.replace('_', "");
        let parsed = match digits
            .strip_prefix("0x")
            .or_else(|| digits.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => digits.parse(),
        };
        parsed.map_err(|e| {
            de::Error::custom(format!("invalid u64 value {text:?}: {e}"))
        })
    }
}

pub fn parse(path: &str) -> anyhow::Result<Config> {
    let file_data =
        std::fs::read(path).context("Failed to read given config.toml")?;
    let config = toml::from_str::<Config>(
        std::str::from_utf8(&file_data)
            .context("config should be valid utf-8")?,
    )?;
    config.validate().context("config failed validation")?;
    Ok(config)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_is_the_default() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.probe.reference_count_samples, 20);
        assert_eq!(config.probe.deadline_tolerance_ticks, 100);
        assert_eq!(config.probe.clock_page_tolerance_ticks, 10);
        assert_eq!(config.probe.deadline_watchdog_ms, None);
        assert_eq!(config.expect.partition_privileges, 0x262);
        assert_eq!(config.host.tsc_hz, 2_100_000_000);
        assert!(config.host.features.tsc_deadline);
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string(&Config::default()).unwrap();
        assert!(text.contains(r#"guest_os_id = "0x8f00000000000000""#));

        let config: Config = toml::from_str(&text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.probe.guest_os_id, DEFAULT_GUEST_OS_ID);
        assert_eq!(config.probe.deadline_watchdog_ms, None);
        assert_eq!(config.host.tsc_hz, SimHostConfig::default().tsc_hz);
    }

    #[test]
    fn guest_os_id_accepts_strings_and_integers() {
        let id = |text: &str| {
            let doc = format!("[probe]\nguest_os_id = {text}");
            toml::from_str::<Config>(&doc).map(|c| c.probe.guest_os_id)
        };

        assert_eq!(id(r#""0x8f00_0000_0000_0000""#).unwrap(), 0x8f00 << 48);
        assert_eq!(id(r#""4096""#).unwrap(), 4096);
        assert_eq!(id("0x1000").unwrap(), 0x1000);
        assert_eq!(id("12").unwrap(), 12);
        assert!(id(r#""0xzz""#).is_err());
        assert!(id("-1").is_err());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [probe]
            deadline_tolerance_ticks = 250
            deadline_watchdog_ms = 3000

            [host]
            crystal_hz = 25000000
            tsc_ratio_numerator = 168

            [host.quirks]
            stall_reference_counter = true
            "#,
        )
        .unwrap();

        assert_eq!(config.probe.deadline_tolerance_ticks, 250);
        assert_eq!(config.probe.deadline_watchdog_ms, Some(3000));
        assert_eq!(config.probe.deadline_iterations, 10);
        assert_eq!(config.host.crystal_hz, 25_000_000);
        assert_eq!(config.host.tsc_ratio_denominator, 2);
        assert!(config.host.quirks.stall_reference_counter);
        assert!(!config.host.quirks.drop_deadline_interrupts);
    }

    #[test]
    fn cpuid_overrides_parse_leaf_and_subleaf_keys() {
        let config: Config = toml::from_str(
            r#"
            [host.cpuid]
            40000005 = [4, 0, 0, 0]
            "0x15-0" = [2, 176, 0, 0]
            "#,
        )
        .unwrap();

        let overrides = config.host.cpuid_overrides().unwrap();
        assert!(overrides.contains(&(
            CpuidIdent::leaf(0x4000_0005),
            CpuidValues { eax: 4, ebx: 0, ecx: 0, edx: 0 }
        )));
        assert!(overrides.contains(&(
            CpuidIdent::subleaf(0x15, 0),
            CpuidValues { eax: 2, ebx: 176, ecx: 0, edx: 0 }
        )));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let config: Config = toml::from_str(
            r#"
            [host.cpuid]
            "not-hex" = [0, 0, 0, 0]
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::CpuidLeaf(..))));

        let config: Config =
            toml::from_str("[probe]\nreference_count_samples = 0").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "probe.reference_count_samples",
                ..
            })
        ));

        let config: Config =
            toml::from_str("[probe]\ndeadline_vector = 14").unwrap();
        assert!(config.validate().is_err());
    }
}
