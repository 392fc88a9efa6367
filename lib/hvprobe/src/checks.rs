// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The conformance check catalog, and the checks that are simple predicates
//! over CPUID leaves and MSR accesses.
//!
//! Check identifiers name clauses of the Microsoft hypervisor interface
//! requirements and are stable across releases; downstream tooling matches on
//! them.

use cpuid_utils::bits::{
    ExtLeaf7Edx, Leaf1Ecx, EXT_POWER_MGMT_LEAF, FEATURE_LEAF,
};
use cpuid_utils::{host::collect_hypervisor_leaves, CpuidIdent, CpuidValues};
use hvprobe_config::{Expectations, ProbeOptions};
use slog::{debug, warn};

use crate::bits::*;
use crate::engine::{EngineError, Stage};
use crate::hypercall::{
    HypercallChannel, HypercallError, HypercallStatus, MsrHypercallValue,
};
use crate::msr::{MsrFault, MsrId};
use crate::platform::{CallGate, Cpu, PageAllocator};
use crate::report::{Report, TestOutcome};

/// Every check the probe evaluates, in the order it evaluates them.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::EnumIter,
    strum::Display,
    strum::IntoStaticStr,
)]
pub enum CheckId {
    #[strum(serialize = "TC_TLFS_TSC_WaaG_002")]
    TscWaag002,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_006")]
    TscWaag006,
    #[strum(serialize = "TC_TLFS_MinimalSet_001")]
    MinimalSet001,
    #[strum(serialize = "TC_TLFS_MinimalSet_002")]
    MinimalSet002,
    #[strum(serialize = "TC_TLFS_MinimalSet_003")]
    MinimalSet003,
    #[strum(serialize = "TC_TLFS_MinimalSet_004")]
    MinimalSet004,
    #[strum(serialize = "TC_TLFS_MinimalSet_005")]
    MinimalSet005,
    #[strum(serialize = "TC_TLFS_MinimalSet_006")]
    MinimalSet006,
    #[strum(serialize = "TC_TLFS_MinimalSet_007")]
    MinimalSet007,
    #[strum(serialize = "TC_TLFS_MinimalSet_008")]
    MinimalSet008,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_001")]
    TscWaag001,
    #[strum(serialize = "TC_TLFS_MinimalSet_009")]
    MinimalSet009,
    #[strum(serialize = "TC_TLFS_MinimalSet_010")]
    MinimalSet010,
    #[strum(serialize = "TC_TLFS_MinimalSet_011")]
    MinimalSet011,
    #[strum(serialize = "TC_TLFS_MinimalSet_012")]
    MinimalSet012,
    #[strum(serialize = "TC_TLFS_MinimalSet_013")]
    MinimalSet013,
    #[strum(serialize = "TC_TLFS_MinimalSet_014")]
    MinimalSet014,
    #[strum(serialize = "TC_TLFS_MinimalSet_015")]
    MinimalSet015,
    #[strum(serialize = "TC_TLFS_MinimalSet_016")]
    MinimalSet016,
    #[strum(serialize = "TC_TLFS_MinimalSet_017")]
    MinimalSet017,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_003")]
    TscWaag003,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_004")]
    TscWaag004,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_005")]
    TscWaag005,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_009")]
    TscWaag009,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_010")]
    TscWaag010,
    #[strum(serialize = "TC_TLFS_TSC_WaaG_011")]
    TscWaag011,
}

impl CheckId {
    pub fn description(&self) -> &'static str {
        match self {
            Self::TscWaag002 => "HV_X64_MSR_TIME_REF_COUNT initial value",
            Self::TscWaag006 => {
                "HV_X64_MSR_TIME_REF_COUNT reset after guest reboot"
            }
            Self::MinimalSet001 => "hypervisor present bit",
            Self::MinimalSet002 => "hypervisor CPUID leaf range",
            Self::MinimalSet003 => "vendor-neutral interface identification",
            Self::MinimalSet004 => "hypervisor system identity",
            Self::MinimalSet005 => "hypervisor feature identification",
            Self::MinimalSet006 => "recommended implementation",
            Self::MinimalSet007 => "implementation limits",
            Self::MinimalSet008 => "implementation hardware features",
            Self::TscWaag001 => "invariant TSC support",
            Self::MinimalSet009 => "HV_X64_MSR_GUEST_OS_ID initial value",
            Self::MinimalSet010 => "writing HV_X64_MSR_GUEST_OS_ID",
            Self::MinimalSet011 => "HV_X64_MSR_HYPERCALL initial value",
            Self::MinimalSet012 => {
                "writing HV_X64_MSR_HYPERCALL while HV_X64_MSR_GUEST_OS_ID is 0"
            }
            Self::MinimalSet013 => {
                "writing HV_X64_MSR_HYPERCALL while HV_X64_MSR_GUEST_OS_ID is set"
            }
            Self::MinimalSet014 => {
                "clearing HV_X64_MSR_GUEST_OS_ID disables the hypercall page"
            }
            Self::MinimalSet015 => "hypercall interface",
            Self::MinimalSet016 => "HV_X64_MSR_VP_INDEX value",
            Self::MinimalSet017 => "writing HV_X64_MSR_VP_INDEX raises #GP",
            Self::TscWaag003 => "writing HV_X64_MSR_TIME_REF_COUNT raises #GP",
            Self::TscWaag004 => "reference count is monotonically increasing",
            Self::TscWaag005 => "reference count advances in 100 ns units",
            Self::TscWaag009 => "HV_X64_MSR_REFERENCE_TSC initial value",
            Self::TscWaag010 => "writing HV_X64_MSR_REFERENCE_TSC",
            Self::TscWaag011 => {
                "reference TSC page is synchronous with reference count"
            }
        }
    }

    /// The engine stage that evaluates this check.
    pub fn stage(&self) -> Stage {
        match self {
            Self::TscWaag002 | Self::TscWaag006 => Stage::Uncalibrated,
            Self::MinimalSet001
            | Self::MinimalSet002
            | Self::MinimalSet003
            | Self::MinimalSet004
            | Self::MinimalSet005
            | Self::MinimalSet006
            | Self::MinimalSet007
            | Self::MinimalSet008
            | Self::TscWaag001 => Stage::Calibrated,
            Self::MinimalSet009
            | Self::MinimalSet010
            | Self::MinimalSet011
            | Self::MinimalSet012
            | Self::MinimalSet013
            | Self::MinimalSet014
            | Self::MinimalSet015
            | Self::MinimalSet016
            | Self::MinimalSet017 => Stage::TransportVerified,
            Self::TscWaag003
            | Self::TscWaag004
            | Self::TscWaag005
            | Self::TscWaag009
            | Self::TscWaag010
            | Self::TscWaag011 => Stage::ClockVerified,
        }
    }
}

/// Turns an MSR fault encountered while evaluating a check into a failure of
/// that check.
pub(crate) fn outcome_of(result: Result<TestOutcome, MsrFault>) -> TestOutcome {
    result.unwrap_or_else(|e| TestOutcome::Failed(Some(e.to_string())))
}

/// Passes if writing `value` to `msr` raises #GP.
pub(crate) fn write_faults(
    cpu: &(impl Cpu + ?Sized),
    msr: MsrId,
    value: u64,
) -> TestOutcome {
    match cpu.wrmsr(msr, value) {
        Err(_) => TestOutcome::Passed,
        Ok(()) => TestOutcome::Failed(Some(format!(
            "write of {value:#x} to MSR {msr} did not fault"
        ))),
    }
}

fn leaf_equals(
    ident: CpuidIdent,
    actual: CpuidValues,
    expected: CpuidValues,
) -> TestOutcome {
    TestOutcome::from_predicate(actual == expected, || {
        format!("leaf {ident} is {actual:x?}, expected {expected:x?}")
    })
}

/// The reference counter must start near zero when a partition is created,
/// including after the guest reboots, so this must run before anything else
/// spends time.
pub(crate) fn initial_reference_count(
    cpu: &(impl Cpu + ?Sized),
    options: &ProbeOptions,
    report: &mut Report,
) {
    let limit = options.initial_reference_count_limit;
    let outcome = outcome_of(cpu.rdmsr(HV_X64_MSR_TIME_REF_COUNT).map(|v| {
        TestOutcome::from_predicate(v < limit, || {
            format!("reference count {v} is not below {limit}")
        })
    }));

    report.record(CheckId::TscWaag002, outcome.clone());
    report.record(CheckId::TscWaag006, outcome);
}

/// Checks the hypervisor identification leaves.
pub(crate) fn identification(
    cpu: &(impl Cpu + ?Sized),
    expect: &Expectations,
    report: &mut Report,
    log: &slog::Logger,
) {
    let query = |leaf| cpu.cpuid(CpuidIdent::leaf(leaf));

    let leaves = collect_hypervisor_leaves(|ident| cpu.cpuid(ident));
    for (ident, values) in leaves.iter() {
        debug!(log, "hypervisor CPUID leaf";
               "leaf" => %ident, "values" => ?values);
    }

    let leaf1 = Leaf1Ecx::from_bits_retain(query(FEATURE_LEAF).ecx);
    report.record(
        CheckId::MinimalSet001,
        TestOutcome::from_predicate(leaf1.contains(Leaf1Ecx::HV_GUEST), || {
            "CPUID.1:ECX[31] is clear".to_string()
        }),
    );

    let max_leaf = query(0x4000_0000).eax;
    report.record(
        CheckId::MinimalSet002,
        TestOutcome::from_predicate(
            max_leaf >= HYPERV_MIN_REQUIRED_CPUID_LEAF,
            || format!("maximum hypervisor leaf is {max_leaf:#x}"),
        ),
    );

    let signature = query(0x4000_0001).eax;
    report.record(
        CheckId::MinimalSet003,
        TestOutcome::from_predicate(
            signature == HYPERV_INTERFACE_SIGNATURE,
            || format!("interface signature is {signature:#x}"),
        ),
    );

    let zero = CpuidValues::default();
    report.record(
        CheckId::MinimalSet004,
        leaf_equals(CpuidIdent::leaf(0x4000_0002), query(0x4000_0002), zero),
    );

    report.record(
        CheckId::MinimalSet005,
        leaf_equals(
            CpuidIdent::leaf(0x4000_0003),
            query(0x4000_0003),
            CpuidValues { eax: expect.partition_privileges, ..zero },
        ),
    );

    report.record(
        CheckId::MinimalSet006,
        leaf_equals(CpuidIdent::leaf(0x4000_0004), query(0x4000_0004), zero),
    );

    // Only eax and ebx of the limits leaf are checked; ecx describes the
    // interrupt remapping hardware, which varies by host.
    let limits = query(0x4000_0005);
    report.record(
        CheckId::MinimalSet007,
        TestOutcome::from_predicate(
            limits.eax == expect.max_virtual_processors && limits.ebx == 0,
            || {
                format!(
                    "limits are {} VPs and {} LPs, expected {} and 0",
                    limits.eax, limits.ebx, expect.max_virtual_processors
                )
            },
        ),
    );

    let hw_features = query(0x4000_0006).eax;
    report.record(
        CheckId::MinimalSet008,
        TestOutcome::from_predicate(hw_features == 0, || {
            format!("hardware features are {hw_features:#x}")
        }),
    );

    let power = ExtLeaf7Edx::from_bits_retain(query(EXT_POWER_MGMT_LEAF).edx);
    report.record(
        CheckId::TscWaag001,
        TestOutcome::from_predicate(
            power.contains(ExtLeaf7Edx::INVARIANT_TSC),
            || "CPUID.80000007:EDX[8] is clear".to_string(),
        ),
    );
}

/// Returns `msr` to its reset value after a check has modified it. A fault
/// here does not change any recorded outcome.
fn clear_msr(cpu: &(impl Cpu + ?Sized), msr: MsrId, log: &slog::Logger) {
    if let Err(e) = cpu.wrmsr(msr, 0) {
        warn!(log, "failed to restore MSR"; "msr" => %msr, "error" => %e);
    }
}

/// Checks that the guest OS ID register starts at zero and accepts writes,
/// then clears it again.
pub(crate) fn guest_os_id(
    cpu: &(impl Cpu + ?Sized),
    options: &ProbeOptions,
    report: &mut Report,
    log: &slog::Logger,
) {
    let id = options.guest_os_id;
    report.record(
        CheckId::MinimalSet009,
        outcome_of(cpu.rdmsr(HV_X64_MSR_GUEST_OS_ID).map(|v| {
            TestOutcome::from_predicate(v == 0, || {
                format!("initial guest OS ID is {v:#x}")
            })
        })),
    );

    report.record(
        CheckId::MinimalSet010,
        outcome_of((|| -> Result<TestOutcome, MsrFault> {
            cpu.wrmsr(HV_X64_MSR_GUEST_OS_ID, id)?;
            let v = cpu.rdmsr(HV_X64_MSR_GUEST_OS_ID)?;
            Ok(TestOutcome::from_predicate(v == id, || {
                format!("wrote guest OS ID {id:#x}, read back {v:#x}")
            }))
        })()),
    );

    clear_msr(cpu, HV_X64_MSR_GUEST_OS_ID, log);
}

/// Walks the hypercall MSR through the enable rules of TLFS section 3.13.
///
/// Allocation failure is fatal: without a page there is nothing to point the
/// register at.
pub(crate) fn hypercall_msr<P: Cpu + PageAllocator + ?Sized>(
    platform: &P,
    options: &ProbeOptions,
    report: &mut Report,
    log: &slog::Logger,
) -> Result<(), EngineError> {
    report.record(
        CheckId::MinimalSet011,
        outcome_of(platform.rdmsr(HV_X64_MSR_HYPERCALL).map(|v| {
            TestOutcome::from_predicate(v == 0, || {
                format!("initial hypercall MSR is {:?}", MsrHypercallValue(v))
            })
        })),
    );

    let page = platform
        .allocate_page()
        .ok_or(EngineError::Allocation { purpose: "hypercall MSR checks" })?;
    platform.zero_page(&page);
    let request =
        MsrHypercallValue::new(platform.physical_address_of(&page), true);

    report.record(
        CheckId::MinimalSet012,
        outcome_of((|| -> Result<TestOutcome, MsrFault> {
            platform.wrmsr(HV_X64_MSR_GUEST_OS_ID, 0)?;
            platform.wrmsr(HV_X64_MSR_HYPERCALL, request.0)?;
            let v = MsrHypercallValue(platform.rdmsr(HV_X64_MSR_HYPERCALL)?);
            Ok(TestOutcome::from_predicate(!v.enabled(), || {
                format!("hypercall page enabled without a guest OS ID: {v:?}")
            }))
        })()),
    );

    report.record(
        CheckId::MinimalSet013,
        outcome_of((|| -> Result<TestOutcome, MsrFault> {
            platform.wrmsr(HV_X64_MSR_GUEST_OS_ID, options.guest_os_id)?;
            platform.wrmsr(HV_X64_MSR_HYPERCALL, request.0)?;
            let v = MsrHypercallValue(platform.rdmsr(HV_X64_MSR_HYPERCALL)?);
            Ok(TestOutcome::from_predicate(v == request, || {
                format!("wrote {request:?}, read back {v:?}")
            }))
        })()),
    );

    report.record(
        CheckId::MinimalSet014,
        outcome_of((|| -> Result<TestOutcome, MsrFault> {
            platform.wrmsr(HV_X64_MSR_GUEST_OS_ID, 0)?;
            let v = MsrHypercallValue(platform.rdmsr(HV_X64_MSR_HYPERCALL)?);
            Ok(TestOutcome::from_predicate(!v.enabled(), || {
                format!("hypercall page still enabled: {v:?}")
            }))
        })()),
    );

    clear_msr(platform, HV_X64_MSR_HYPERCALL, log);
    clear_msr(platform, HV_X64_MSR_GUEST_OS_ID, log);
    platform.free_page(page);
    Ok(())
}

/// Sets up a hypercall channel and issues a fast `HvCallSignalEvent`, which a
/// host with no hypercall support must reject with
/// [`HV_STATUS_INVALID_HYPERCALL_CODE`].
pub(crate) fn hypercall_interface<P: Cpu + CallGate + PageAllocator + ?Sized>(
    platform: &P,
    options: &ProbeOptions,
    report: &mut Report,
    log: &slog::Logger,
) -> Result<(), EngineError> {
    let mut channel =
        match HypercallChannel::setup(platform, options.guest_os_id, log) {
            Ok(channel) => channel,
            Err(HypercallError::Allocation) => {
                return Err(EngineError::Allocation {
                    purpose: "hypercall page",
                })
            }
            Err(e) => {
                report.record(
                    CheckId::MinimalSet015,
                    TestOutcome::Failed(Some(e.to_string())),
                );
                return Ok(());
            }
        };

    let outcome = match channel.issue(HVCALL_SIGNAL_EVENT, 2, true) {
        Ok(status) if status.is_echo_mismatch() => TestOutcome::Failed(Some(
            "host did not preserve the hypercall input register".to_string(),
        )),
        Ok(status) => TestOutcome::from_predicate(
            status == HypercallStatus::INVALID_HYPERCALL_CODE,
            || {
                format!(
                    "hypercall returned {status}, expected {}",
                    HypercallStatus::INVALID_HYPERCALL_CODE
                )
            },
        ),
        Err(e) => TestOutcome::Failed(Some(e.to_string())),
    };
    report.record(CheckId::MinimalSet015, outcome);

    if let Err(e) = channel.teardown() {
        warn!(log, "failed to tear down hypercall channel"; "error" => %e);
    }

    Ok(())
}

/// Checks that the VP index names the current processor and is read-only.
pub(crate) fn vp_index(cpu: &(impl Cpu + ?Sized), report: &mut Report) {
    let index = cpu.rdmsr(HV_X64_MSR_VP_INDEX);
    let expected = cpu.current_processor_id() as u64;
    report.record(
        CheckId::MinimalSet016,
        outcome_of(index.map(|v| {
            TestOutcome::from_predicate(v == expected, || {
                format!("VP index is {v}, expected {expected}")
            })
        })),
    );

    let value = index.unwrap_or(expected).wrapping_add(1);
    report.record(
        CheckId::MinimalSet017,
        write_faults(cpu, HV_X64_MSR_VP_INDEX, value),
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::test::{discard_log, sim_host};
    use crate::sim::SimHost;
    use hvprobe_config::SimHostConfig;
    use std::sync::{Arc, Mutex};
    use strum::IntoEnumIterator;

    /// Collects the message of every record logged through it.
    struct Capture(Arc<Mutex<Vec<String>>>);

    impl slog::Drain for Capture {
        type Ok = ();
        type Err = slog::Never;

        fn log(
            &self,
            record: &slog::Record,
            _values: &slog::OwnedKVList,
        ) -> Result<(), slog::Never> {
            self.0.lock().unwrap().push(record.msg().to_string());
            Ok(())
        }
    }

    /// A simulated host that rejects every write to one MSR.
    struct WriteProtected<'a> {
        host: &'a SimHost,
        msr: MsrId,
    }

    impl Cpu for WriteProtected<'_> {
        fn cpuid(&self, ident: CpuidIdent) -> CpuidValues {
            self.host.cpuid(ident)
        }

        fn rdmsr(&self, msr: MsrId) -> Result<u64, MsrFault> {
            self.host.rdmsr(msr)
        }

        fn wrmsr(&self, msr: MsrId, value: u64) -> Result<(), MsrFault> {
            if msr == self.msr {
                return Err(MsrFault::write(msr, value));
            }
            self.host.wrmsr(msr, value)
        }

        fn rdtsc(&self) -> u64 {
            self.host.rdtsc()
        }

        fn relax(&self) {
            self.host.relax()
        }

        fn current_processor_id(&self) -> u32 {
            self.host.current_processor_id()
        }
    }

    #[test]
    fn catalog_is_in_stage_order() {
        let stages: Vec<Stage> = CheckId::iter().map(|id| id.stage()).collect();
        let mut sorted = stages.clone();
        sorted.sort();
        assert_eq!(stages, sorted);
        assert_eq!(CheckId::iter().count(), 26);
    }

    #[test]
    fn identifiers_are_clause_names() {
        assert_eq!(
            CheckId::MinimalSet015.to_string(),
            "TC_TLFS_MinimalSet_015"
        );
        let name: &'static str = CheckId::TscWaag011.into();
        assert_eq!(name, "TC_TLFS_TSC_WaaG_011");
    }

    #[test]
    fn default_host_passes_identification() {
        let host = sim_host(SimHostConfig::default());
        let log = discard_log();
        let mut report = Report::new(&log);
        identification(&host, &Expectations::default(), &mut report, &log);

        assert_eq!(report.results().len(), 9);
        assert!(!report.has_failures(), "{:?}", report.results());
    }

    #[test]
    fn unexpected_privileges_fail_feature_identification() {
        let host = sim_host(SimHostConfig::default());
        let log = discard_log();
        let mut report = Report::new(&log);
        let expect = Expectations {
            partition_privileges: (HyperVLeaf3Eax::default()).bits(),
            ..Default::default()
        };
        identification(&host, &expect, &mut report, &log);

        assert!(report.outcome(CheckId::MinimalSet005).unwrap().is_failure());
        assert_eq!(
            report.stats().failed_test_cases,
            vec![CheckId::MinimalSet005]
        );
    }

    #[test]
    fn msr_checks_pass_on_default_host() {
        let host = sim_host(SimHostConfig::default());
        let log = discard_log();
        let mut report = Report::new(&log);
        let options = ProbeOptions::default();

        guest_os_id(&host, &options, &mut report, &log);
        hypercall_msr(&host, &options, &mut report, &log).unwrap();
        hypercall_interface(&host, &options, &mut report, &log).unwrap();
        vp_index(&host, &mut report);

        assert_eq!(report.results().len(), 9);
        assert!(!report.has_failures(), "{:?}", report.results());
        assert_eq!(host.pages_in_use(), 0);
    }

    #[test]
    fn failed_msr_restore_is_logged() {
        let host = sim_host(SimHostConfig::default());
        let cpu = WriteProtected { host: &host, msr: HV_X64_MSR_GUEST_OS_ID };
        let messages = Arc::new(Mutex::new(Vec::new()));
        let log = slog::Logger::root(Capture(messages.clone()), slog::o!());
        let mut report = Report::new(&discard_log());

        guest_os_id(&cpu, &ProbeOptions::default(), &mut report, &log);

        assert_eq!(
            report.outcome(CheckId::MinimalSet009),
            Some(&TestOutcome::Passed)
        );
        assert!(report.outcome(CheckId::MinimalSet010).unwrap().is_failure());
        assert_eq!(
            *messages.lock().unwrap(),
            vec!["failed to restore MSR".to_string()]
        );
    }

    #[test]
    fn vp_index_follows_processor_id() {
        let config = SimHostConfig { processor_id: 3, ..Default::default() };
        let host = sim_host(config);
        let log = discard_log();
        let mut report = Report::new(&log);
        vp_index(&host, &mut report);
        assert!(!report.has_failures(), "{:?}", report.results());
    }

    #[test]
    fn msr_page_allocation_failure_is_fatal() {
        let mut config = SimHostConfig::default();
        config.quirks.fail_page_allocation = true;
        let host = sim_host(config);
        let log = discard_log();
        let mut report = Report::new(&log);

        let options = ProbeOptions::default();
        let err = hypercall_msr(&host, &options, &mut report, &log)
            .unwrap_err();
        assert!(matches!(err, EngineError::Allocation { .. }));
        assert!(report.outcome(CheckId::MinimalSet011).is_some());
        assert!(report.outcome(CheckId::MinimalSet012).is_none());
    }

    #[test]
    fn initial_count_limit() {
        let config = SimHostConfig {
            boot_reference_count: 25_000_000,
            ..Default::default()
        };
        let host = sim_host(config);
        let log = discard_log();
        let mut report = Report::new(&log);
        initial_reference_count(&host, &ProbeOptions::default(), &mut report);

        let stats = report.stats();
        assert_eq!(
            stats.failed_test_cases,
            vec![CheckId::TscWaag002, CheckId::TscWaag006]
        );
    }
}
