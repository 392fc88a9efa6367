// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The cross-validation engine.
//!
//! The engine walks a fixed sequence of stages:
//!
//! ```text
//! Uncalibrated -> Calibrated -> TransportVerified -> ClockVerified -> Done
//! ```
//!
//! Advancing into a stage evaluates the checks that belong to it (see
//! [`CheckId::stage`]). Each stage runs exactly once. A fatal error (the TSC
//! cannot be calibrated, or a page cannot be allocated) moves the engine
//! straight to `Failed`; failed checks are only recorded, so that later,
//! independent checks still run. Once every stage has run the engine ends in
//! `Done` if nothing failed and in `Failed` otherwise.
//!
//! Three protocols cross-check the partition's time sources:
//!
//! - the reference counter MSR must be strictly increasing across closely
//!   spaced reads;
//! - one second of TSC, as measured by a TSC-deadline timer interrupt, must
//!   advance the reference counter by one second's worth of 100 ns units;
//! - time computed from the reference TSC page must agree with the reference
//!   counter read just after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cpuid_utils::bits::{Leaf1Ecx, FEATURE_LEAF};
use cpuid_utils::CpuidIdent;
use hvprobe_config::{Expectations, ProbeOptions};
use slog::{error, info, warn};
use thiserror::Error;

use crate::bits::{
    HV_X64_MSR_REFERENCE_TSC, HV_X64_MSR_TIME_REF_COUNT, IA32_TSC_DEADLINE,
};
use crate::calibrate::{calibrate, CalibrationError, FrequencyProfile};
use crate::checks::{self, outcome_of, CheckId};
use crate::common::{ns_to_ticks, HUNDRED_NS_PER_SEC};
use crate::msr::MsrFault;
use crate::platform::{Cpu, EndOfInterrupt, PageHandle, Platform};
use crate::report::{ExecutionStats, Report, TestOutcome};
use crate::tsc::{
    self, MsrReferenceTscValue, ReferenceClockPage, ReferenceTime,
    ReferenceTscPage,
};

/// The non-terminal engine stages, in order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display,
)]
pub enum Stage {
    Uncalibrated,
    Calibrated,
    TransportVerified,
    ClockVerified,
}

/// Errors that end a run.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("failed to allocate a page for the {purpose}")]
    Allocation { purpose: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailReason {
    /// The run aborted.
    Fatal(EngineError),

    /// Every stage ran, but some checks failed.
    Assertions { failed: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uncalibrated,
    Calibrated(FrequencyProfile),
    TransportVerified(FrequencyProfile),
    ClockVerified(FrequencyProfile),
    Done,
    Failed(FailReason),
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Uncalibrated => Some(Stage::Uncalibrated),
            Self::Calibrated(_) => Some(Stage::Calibrated),
            Self::TransportVerified(_) => Some(Stage::TransportVerified),
            Self::ClockVerified(_) => Some(Stage::ClockVerified),
            Self::Done | Self::Failed(_) => None,
        }
    }
}

/// Two reference counter readings taken around one deadline-timer window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalibrationSample {
    pub first_tick: u64,
    pub second_tick: u64,
    pub derived_delta: u64,
}

impl CalibrationSample {
    pub fn new(first_tick: u64, second_tick: u64) -> Self {
        Self {
            first_tick,
            second_tick,
            // A counter that went backwards produces an enormous delta, which
            // no window accepts.
            derived_delta: second_tick.wrapping_sub(first_tick),
        }
    }

    /// Returns `true` if the window measured `expected` ticks, give or take
    /// `tolerance`.
    pub fn within(&self, expected: u64, tolerance: u64) -> bool {
        self.derived_delta.abs_diff(expected) <= tolerance
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum MonotonicityError {
    #[error(
        "sample {iteration}: reference count went from {previous} to {current}"
    )]
    NotIncreasing { iteration: u32, previous: u64, current: u64 },

    #[error(transparent)]
    Msr(#[from] MsrFault),
}

/// Takes a baseline reading and then `samples` more, calling `wait` before
/// each. Stops at the first reading that is not strictly greater than the one
/// before it.
pub fn check_monotonic(
    samples: u32,
    mut read: impl FnMut() -> Result<u64, MsrFault>,
    mut wait: impl FnMut(),
) -> Result<(), MonotonicityError> {
    let mut previous = read()?;
    for iteration in 1..=samples {
        wait();
        let current = read()?;
        if current <= previous {
            return Err(MonotonicityError::NotIncreasing {
                iteration,
                previous,
                current,
            });
        }
        previous = current;
    }

    Ok(())
}

/// Compares reference time derived from the TSC page with the reference
/// counter read just afterwards. The page reading may trail the counter by
/// less than `tolerance`; it may lead it by any amount.
pub fn cross_check(
    page_time: ReferenceTime,
    counter: u64,
    tolerance: u64,
) -> TestOutcome {
    TestOutcome::from_predicate(
        page_time.value() + tolerance as i128 > counter as i128,
        || {
            format!(
                "reference TSC page time {} trails reference count {} by \
                {tolerance} or more",
                page_time.value(),
                counter
            )
        },
    )
}

/// Spins for at least `ns` nanoseconds of TSC time, and at least one tick.
pub fn busy_wait_ns(
    cpu: &(impl Cpu + ?Sized),
    profile: &FrequencyProfile,
    ns: u64,
) {
    let ticks = ns_to_ticks(ns, profile.counter_hz).max(1);
    let start = cpu.rdtsc();
    while cpu.rdtsc().wrapping_sub(start) < ticks {
        cpu.relax();
    }
}

/// What a run produced.
pub struct EngineOutcome {
    pub state: EngineState,
    pub profile: Option<FrequencyProfile>,
    pub report: Report,
}

impl EngineOutcome {
    pub fn stats(&self) -> ExecutionStats {
        self.report.stats()
    }

    pub fn exit_code(&self) -> i32 {
        match self.state {
            EngineState::Done => 0,
            _ => 1,
        }
    }
}

pub struct Engine<'a, P: Platform + ?Sized> {
    log: slog::Logger,
    platform: &'a P,
    options: ProbeOptions,
    expect: Expectations,
    report: Report,
    profile: Option<FrequencyProfile>,
    state: EngineState,
}

impl<'a, P: Platform + ?Sized> Engine<'a, P> {
    pub fn new(
        platform: &'a P,
        options: ProbeOptions,
        expect: Expectations,
        log: &slog::Logger,
    ) -> Self {
        let log = log.new(slog::o!("component" => "engine"));
        Self {
            report: Report::new(&log),
            log,
            platform,
            options,
            expect,
            profile: None,
            state: EngineState::Uncalibrated,
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Advances into the next stage. Does nothing once the engine is in a
    /// terminal state.
    pub fn step(&mut self) -> &EngineState {
        let next = match self.state.clone() {
            EngineState::Uncalibrated => {
                self.enter_calibrated().map(EngineState::Calibrated)
            }
            EngineState::Calibrated(profile) => self
                .verify_transport()
                .map(|()| EngineState::TransportVerified(profile)),
            EngineState::TransportVerified(profile) => self
                .verify_clock(&profile)
                .map(|()| EngineState::ClockVerified(profile)),
            EngineState::ClockVerified(_) => Ok(self.conclude()),
            EngineState::Done | EngineState::Failed(_) => {
                return &self.state
            }
        };

        self.state = next.unwrap_or_else(|e| {
            error!(self.log, "probe aborted";
                   "stage" => ?self.state.stage(),
                   "error" => %e);
            EngineState::Failed(FailReason::Fatal(e))
        });

        info!(self.log, "engine advanced"; "state" => ?self.state);
        &self.state
    }

    /// Runs every remaining stage.
    pub fn run(mut self) -> EngineOutcome {
        while !self.state.is_terminal() {
            self.step();
        }

        EngineOutcome {
            state: self.state,
            profile: self.profile,
            report: self.report,
        }
    }

    fn enter_calibrated(&mut self) -> Result<FrequencyProfile, EngineError> {
        // This must be the first thing the probe does.
        checks::initial_reference_count(
            self.platform,
            &self.options,
            &mut self.report,
        );

        let profile = calibrate(self.platform, &self.log)?;
        self.profile = Some(profile);

        checks::identification(
            self.platform,
            &self.expect,
            &mut self.report,
            &self.log,
        );

        Ok(profile)
    }

    fn verify_transport(&mut self) -> Result<(), EngineError> {
        checks::guest_os_id(
            self.platform,
            &self.options,
            &mut self.report,
            &self.log,
        );
        checks::hypercall_msr(
            self.platform,
            &self.options,
            &mut self.report,
            &self.log,
        )?;
        checks::hypercall_interface(
            self.platform,
            &self.options,
            &mut self.report,
            &self.log,
        )?;
        checks::vp_index(self.platform, &mut self.report);
        Ok(())
    }

    fn verify_clock(
        &mut self,
        profile: &FrequencyProfile,
    ) -> Result<(), EngineError> {
        self.report.record(
            CheckId::TscWaag003,
            checks::write_faults(self.platform, HV_X64_MSR_TIME_REF_COUNT, 1),
        );

        let outcome = self.monotonicity(profile);
        self.report.record(CheckId::TscWaag004, outcome);

        let outcome = self.deadline_timer(profile);
        self.report.record(CheckId::TscWaag005, outcome);

        self.reference_tsc()
    }

    fn conclude(&mut self) -> EngineState {
        let stats = self.report.stats();
        info!(self.log, "probe complete";
              "passed" => stats.tests_passed,
              "failed" => stats.tests_failed,
              "skipped" => stats.tests_skipped);

        if stats.tests_failed == 0 {
            EngineState::Done
        } else {
            EngineState::Failed(FailReason::Assertions {
                failed: stats.tests_failed,
            })
        }
    }

    fn monotonicity(&self, profile: &FrequencyProfile) -> TestOutcome {
        let cpu = self.platform;
        let result = check_monotonic(
            self.options.reference_count_samples,
            || cpu.rdmsr(HV_X64_MSR_TIME_REF_COUNT),
            || busy_wait_ns(cpu, profile, self.options.sample_interval_ns),
        );

        match result {
            Ok(()) => TestOutcome::Passed,
            Err(e) => TestOutcome::Failed(Some(e.to_string())),
        }
    }

    /// Measures one-second TSC-deadline windows against the reference counter.
    fn deadline_timer(&self, profile: &FrequencyProfile) -> TestOutcome {
        let platform = self.platform;
        let leaf1 = Leaf1Ecx::from_bits_retain(
            platform.cpuid(CpuidIdent::leaf(FEATURE_LEAF)).ecx,
        );
        if !leaf1.contains(Leaf1Ecx::TSC_DEADLINE) {
            return TestOutcome::Skipped(Some(
                "TSC-deadline timer mode is not supported".to_string(),
            ));
        }

        let vector = self.options.deadline_vector;
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        platform.register_vector(
            vector,
            Arc::new(move |eoi: &dyn EndOfInterrupt| {
                flag.store(true, Ordering::Release);
                eoi.signal_end_of_interrupt();
            }),
        );
        platform.set_tsc_deadline_mode(vector);
        platform.enable_interrupts();

        let watchdog = self
            .options
            .deadline_watchdog_ms
            .map(|ms| {
                ns_to_ticks(ms.saturating_mul(1_000_000), profile.counter_hz)
            });

        info!(self.log, "measuring deadline timer windows";
              "iterations" => self.options.deadline_iterations,
              "vector" => vector);

        let outcome = (|| -> Result<TestOutcome, MsrFault> {
            for iteration in 1..=self.options.deadline_iterations {
                let deadline =
                    platform.rdtsc().saturating_add(profile.counter_hz);
                let first = platform.rdmsr(HV_X64_MSR_TIME_REF_COUNT)?;
                platform.wrmsr(IA32_TSC_DEADLINE, deadline)?;

                if !self.wait_for_interrupt(&fired, watchdog) {
                    return Ok(TestOutcome::Failed(Some(format!(
                        "window {iteration}: deadline interrupt did not \
                        arrive within {} ms",
                        self.options.deadline_watchdog_ms.unwrap_or_default()
                    ))));
                }

                let second = platform.rdmsr(HV_X64_MSR_TIME_REF_COUNT)?;
                fired.store(false, Ordering::Release);

                let sample = CalibrationSample::new(first, second);
                if !sample.within(
                    HUNDRED_NS_PER_SEC,
                    self.options.deadline_tolerance_ticks,
                ) {
                    return Ok(TestOutcome::Failed(Some(format!(
                        "window {iteration}: reference count advanced {} \
                        ticks ({first} to {second}), expected {} +/- {}",
                        sample.derived_delta,
                        HUNDRED_NS_PER_SEC,
                        self.options.deadline_tolerance_ticks
                    ))));
                }
            }

            Ok(TestOutcome::Passed)
        })();

        // Disarm the timer in case a window was abandoned while armed.
        if let Err(e) = platform.wrmsr(IA32_TSC_DEADLINE, 0) {
            warn!(self.log, "failed to disarm deadline timer"; "error" => %e);
        }

        outcome_of(outcome)
    }

    /// Spins until `fired` is set. Returns `false` if `watchdog` TSC ticks
    /// pass first.
    fn wait_for_interrupt(
        &self,
        fired: &AtomicBool,
        watchdog: Option<u64>,
    ) -> bool {
        let cpu = self.platform;
        let start = cpu.rdtsc();
        while !fired.load(Ordering::Acquire) {
            if let Some(limit) = watchdog {
                if cpu.rdtsc().wrapping_sub(start) >= limit {
                    return false;
                }
            }
            cpu.relax();
        }

        true
    }

    /// Places a reference TSC page and checks it against the reference
    /// counter.
    fn reference_tsc(&mut self) -> Result<(), EngineError> {
        let platform = self.platform;
        self.report.record(
            CheckId::TscWaag009,
            outcome_of(platform.rdmsr(HV_X64_MSR_REFERENCE_TSC).map(|v| {
                TestOutcome::from_predicate(v == 0, || {
                    format!("initial value is {:?}", MsrReferenceTscValue(v))
                })
            })),
        );

        let page = platform
            .allocate_page()
            .ok_or(EngineError::Allocation { purpose: "reference TSC page" })?;
        platform.zero_page(&page);
        let gpa = platform.physical_address_of(&page);
        let request = MsrReferenceTscValue::new(gpa, true);

        self.report.record(
            CheckId::TscWaag010,
            outcome_of((|| -> Result<TestOutcome, MsrFault> {
                platform.wrmsr(HV_X64_MSR_REFERENCE_TSC, request.0)?;
                let v = MsrReferenceTscValue(
                    platform.rdmsr(HV_X64_MSR_REFERENCE_TSC)?,
                );
                Ok(TestOutcome::from_predicate(v == request, || {
                    format!("wrote {request:?}, read back {v:?}")
                }))
            })()),
        );

        let outcome = self.clock_page_cross_check(&page);
        self.report.record(CheckId::TscWaag011, outcome);

        if let Err(e) = platform.wrmsr(HV_X64_MSR_REFERENCE_TSC, 0) {
            warn!(self.log, "failed to disable reference TSC page";
                  "error" => %e);
        }
        platform.free_page(page);
        Ok(())
    }

    fn clock_page_cross_check(&self, page: &PageHandle) -> TestOutcome {
        let platform = self.platform;
        let clock =
            ReferenceClockPage::from(ReferenceTscPage::load(platform, page));

        // Read the TSC first, so the counter read afterwards can only be
        // later.
        let tick = platform.rdtsc();
        let page_time = match tsc::read(&clock, tick) {
            Ok(time) => time,
            Err(e) => return TestOutcome::Failed(Some(e.to_string())),
        };

        match platform.rdmsr(HV_X64_MSR_TIME_REF_COUNT) {
            Ok(counter) => {
                info!(self.log, "reference clock cross-check";
                      "sequence" => clock.sequence,
                      "tsc" => tick,
                      "page_time" => page_time.value() as i64,
                      "counter" => counter);
                cross_check(
                    page_time,
                    counter,
                    self.options.clock_page_tolerance_ticks,
                )
            }
            Err(e) => TestOutcome::Failed(Some(e.to_string())),
        }
    }
}
