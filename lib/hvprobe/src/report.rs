// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-check outcomes and the run summary.

use slog::info;
use strum::IntoEnumIterator;

use crate::checks::CheckId;

/// The outcome from evaluating a specific check.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TestOutcome {
    /// The check passed.
    Passed,

    /// The check failed.
    Failed(Option<String>),

    /// The host lacks a capability the check depends on. This is not a
    /// conformance violation. The payload is an optional message.
    Skipped(Option<String>),
}

impl TestOutcome {
    /// `Passed` if `ok` holds, `Failed` with `msg` otherwise.
    pub fn from_predicate(ok: bool, msg: impl FnOnce() -> String) -> Self {
        if ok {
            Self::Passed
        } else {
            Self::Failed(Some(msg()))
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckResult {
    pub id: CheckId,
    pub outcome: TestOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// The number of checks that passed.
    pub tests_passed: u32,

    /// The number of checks that failed.
    pub tests_failed: u32,

    /// The number of checks skipped for want of a capability.
    pub tests_skipped: u32,

    /// The number of checks never evaluated because the run aborted first.
    pub tests_not_run: u32,

    /// The checks that failed, in the order they were recorded.
    pub failed_test_cases: Vec<CheckId>,
}

pub struct Report {
    log: slog::Logger,
    results: Vec<CheckResult>,
}

impl Report {
    pub fn new(log: &slog::Logger) -> Self {
        let log = log.new(slog::o!("component" => "report"));
        Self { log, results: vec![] }
    }

    /// Records the outcome of check `id` and logs it.
    pub fn record(&mut self, id: CheckId, outcome: TestOutcome) {
        info!(
            self.log,
            "test {} ... {}{}",
            id,
            match outcome {
                TestOutcome::Passed => "ok",
                TestOutcome::Failed(_) => "FAILED: ",
                TestOutcome::Skipped(_) => "skipped: ",
            },
            match &outcome {
                TestOutcome::Failed(Some(s))
                | TestOutcome::Skipped(Some(s)) => s.as_str(),
                TestOutcome::Failed(None) | TestOutcome::Skipped(None) =>
                    "[no message]",
                _ => "",
            };
            "description" => id.description()
        );

        self.results.push(CheckResult { id, outcome });
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    pub fn outcome(&self, id: CheckId) -> Option<&TestOutcome> {
        self.results.iter().find(|r| r.id == id).map(|r| &r.outcome)
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.outcome.is_failure())
    }

    pub fn stats(&self) -> ExecutionStats {
        let mut stats = ExecutionStats::default();
        for result in &self.results {
            match result.outcome {
                TestOutcome::Passed => stats.tests_passed += 1,
                TestOutcome::Failed(_) => {
                    stats.tests_failed += 1;
                    stats.failed_test_cases.push(result.id);
                }
                TestOutcome::Skipped(_) => stats.tests_skipped += 1,
            }
        }

        stats.tests_not_run = CheckId::iter()
            .filter(|id| self.outcome(*id).is_none())
            .count() as u32;

        stats
    }
}

impl ExecutionStats {
    /// The process exit status for a run with these results.
    pub fn exit_code(&self) -> i32 {
        if self.tests_failed == 0 && self.tests_not_run == 0 {
            0
        } else {
            1
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn report() -> Report {
        Report::new(&slog::Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn stats_count_each_outcome() {
        let mut report = report();
        report.record(CheckId::MinimalSet001, TestOutcome::Passed);
        report.record(
            CheckId::MinimalSet002,
            TestOutcome::Failed(Some("too few leaves".to_string())),
        );
        report.record(CheckId::TscWaag005, TestOutcome::Skipped(None));

        let stats = report.stats();
        assert_eq!(stats.tests_passed, 1);
        assert_eq!(stats.tests_failed, 1);
        assert_eq!(stats.tests_skipped, 1);
        assert_eq!(
            stats.tests_not_run as usize,
            CheckId::iter().count() - 3
        );
        assert_eq!(stats.failed_test_cases, vec![CheckId::MinimalSet002]);
        assert!(report.has_failures());
        assert_eq!(stats.exit_code(), 1);
    }

    #[test]
    fn skips_do_not_fail_a_complete_run() {
        let mut report = report();
        for id in CheckId::iter() {
            let outcome = if id == CheckId::TscWaag005 {
                TestOutcome::Skipped(Some("no TSC deadline".to_string()))
            } else {
                TestOutcome::Passed
            };
            report.record(id, outcome);
        }

        let stats = report.stats();
        assert_eq!(stats.tests_not_run, 0);
        assert_eq!(stats.tests_skipped, 1);
        assert!(!report.has_failures());
        assert_eq!(stats.exit_code(), 0);
    }

    #[test]
    fn predicate_outcomes() {
        assert_eq!(
            TestOutcome::from_predicate(true, || unreachable!()),
            TestOutcome::Passed
        );
        assert_eq!(
            TestOutcome::from_predicate(false, || "nope".to_string()),
            TestOutcome::Failed(Some("nope".to_string()))
        );
    }
}
