// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Results of a run: per-batch grouped results and the aggregated summary.

use crate::{
    child_manager::CommandRuntime, expectations::ExpectedResult, runner::RunFinished,
};
use capture_replay_metadata::CaptureReplayExitCode;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Duration,
};

/// The terminal state of a test.
///
/// Every test that enters a batch ends up in exactly one of these states.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ResultKind {
    /// Capture and replay ran, and the replayed state matched the captured state.
    Passed,
    /// Replay ran but produced the wrong result.
    Failed,
    /// Capture or replay did not finish within the timeout.
    TimedOut,
    /// The replay binary failed to build.
    CompileFailed,
    /// The capture run exited with an error.
    CaptureFailed,
    /// The replay binary failed to initialize, or exited without reporting a result.
    ReplayFailed,
    /// The suite itself skipped the test during capture.
    Skipped,
    /// Capture ran but did not leave a complete set of trace files.
    FailedToTrace,
}

impl ResultKind {
    /// All result kinds, in report order.
    pub const ALL: [Self; 8] = [
        Self::Passed,
        Self::Failed,
        Self::TimedOut,
        Self::CompileFailed,
        Self::CaptureFailed,
        Self::ReplayFailed,
        Self::Skipped,
        Self::FailedToTrace,
    ];

    /// Returns true if this kind counts as a failure.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Passed | Self::Skipped)
    }

    /// Returns a short human-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "Passed",
            Self::Failed => "Failed",
            Self::TimedOut => "Timeout",
            Self::CompileFailed => "CompileFailed",
            Self::CaptureFailed => "CaptureFailed",
            Self::ReplayFailed => "ReplayFailed",
            Self::Skipped => "Skipped",
            Self::FailedToTrace => "FailedToTrace",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A set of tests from one batch that ended in the same state for the same reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupedResult {
    /// The terminal state.
    pub kind: ResultKind,
    /// A short description of what happened.
    pub message: String,
    /// Output captured from the subprocess responsible, if any.
    pub output: String,
    /// Full names of the tests in this group.
    pub tests: Vec<String>,
}

impl GroupedResult {
    /// Creates a new grouped result.
    pub fn new(
        kind: ResultKind,
        message: impl Into<String>,
        output: impl Into<String>,
        tests: Vec<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            output: output.into(),
            tests,
        }
    }
}

/// A test whose outcome differed from a pass.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TestFailure {
    /// The full test name.
    pub name: String,
    /// How the test ended.
    pub kind: ResultKind,
}

/// The aggregated outcome of a run.
///
/// The summary is independent of the order in which batches finished: test lists are sorted and
/// grouped by result kind.
#[derive(Clone, Debug)]
pub struct RunSummary {
    by_kind: BTreeMap<ResultKind, Vec<String>>,
    groups: Vec<GroupedResult>,
    excluded: Vec<String>,
    not_run: Vec<String>,
    duplicates: Vec<String>,
    unexpected_failures: Vec<TestFailure>,
    expected_failures: Vec<TestFailure>,
    flaky_failures: Vec<TestFailure>,
    unexpected_passes: Vec<String>,
    cancelled: bool,
    elapsed: Duration,
    runtimes: BTreeMap<String, CommandRuntime>,
}

impl RunSummary {
    /// Builds a summary.
    ///
    /// * `scheduled` is every test that was put into a batch.
    /// * `excluded` is every test left out of the run by the expectations file.
    /// * `expected` is the result the expectations file forces, per test.
    pub fn new(
        scheduled: &[String],
        excluded: &[String],
        expected: &BTreeMap<String, ExpectedResult>,
        finished: RunFinished,
    ) -> Self {
        let RunFinished {
            results,
            cancelled,
            elapsed,
            runtimes,
        } = finished;

        let mut by_kind: BTreeMap<ResultKind, Vec<String>> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        let mut duplicates = Vec::new();
        let mut unexpected_failures = Vec::new();
        let mut expected_failures = Vec::new();
        let mut flaky_failures = Vec::new();
        let mut unexpected_passes = Vec::new();

        for group in &results {
            for test in &group.tests {
                if !seen.insert(test.as_str()) {
                    // The first result recorded for a test wins.
                    duplicates.push(test.clone());
                    continue;
                }
                by_kind.entry(group.kind).or_default().push(test.clone());

                let expectation = expected.get(test).copied();
                if group.kind == ResultKind::Passed {
                    if expectation.is_some_and(ExpectedResult::expects_failure) {
                        unexpected_passes.push(test.clone());
                    }
                    continue;
                }
                if !group.kind.is_failure() {
                    continue;
                }

                let failure = TestFailure {
                    name: test.clone(),
                    kind: group.kind,
                };
                match expectation {
                    Some(ExpectedResult::Flaky) => flaky_failures.push(failure),
                    Some(result) if result.predicts(group.kind) => expected_failures.push(failure),
                    _ => unexpected_failures.push(failure),
                }
            }
        }

        let not_run = scheduled
            .iter()
            .filter(|test| !seen.contains(test.as_str()))
            .cloned()
            .collect();

        for tests in by_kind.values_mut() {
            tests.sort_unstable();
        }
        let mut groups = results;
        groups.sort_by(|a, b| (a.kind, &a.tests).cmp(&(b.kind, &b.tests)));
        unexpected_failures.sort_unstable();
        expected_failures.sort_unstable();
        flaky_failures.sort_unstable();
        unexpected_passes.sort_unstable();
        duplicates.sort_unstable();
        let mut excluded = excluded.to_vec();
        excluded.sort_unstable();

        Self {
            by_kind,
            groups,
            excluded,
            not_run,
            duplicates,
            unexpected_failures,
            expected_failures,
            flaky_failures,
            unexpected_passes,
            cancelled,
            elapsed,
            runtimes,
        }
    }

    /// Returns the number of tests that ended with `kind`.
    pub fn count(&self, kind: ResultKind) -> usize {
        self.by_kind.get(&kind).map_or(0, Vec::len)
    }

    /// Returns the tests that ended with `kind`, sorted by name.
    pub fn tests(&self, kind: ResultKind) -> &[String] {
        self.by_kind.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Returns the grouped results, sorted by kind.
    pub fn groups(&self) -> &[GroupedResult] {
        &self.groups
    }

    /// Returns the tests left out of the run by the expectations file.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// Returns the tests that were scheduled but never reached a terminal state, because the
    /// run was cancelled.
    pub fn not_run(&self) -> &[String] {
        &self.not_run
    }

    /// Returns tests that were reported more than once. This is always empty unless there is a
    /// bug in the runner.
    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    /// Returns failures that the expectations file did not predict.
    pub fn unexpected_failures(&self) -> &[TestFailure] {
        &self.unexpected_failures
    }

    /// Returns failures that the expectations file predicted.
    pub fn expected_failures(&self) -> &[TestFailure] {
        &self.expected_failures
    }

    /// Returns failures of tests marked flaky.
    pub fn flaky_failures(&self) -> &[TestFailure] {
        &self.flaky_failures
    }

    /// Returns tests that were expected to fail but passed.
    pub fn unexpected_passes(&self) -> &[String] {
        &self.unexpected_passes
    }

    /// Returns true if the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Returns the wall-clock time the run took.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Returns the cumulative runtime per command, across all workers.
    pub fn runtimes(&self) -> &BTreeMap<String, CommandRuntime> {
        &self.runtimes
    }

    /// Returns the total number of tests that reached a terminal state.
    pub fn finished_count(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    /// Returns true if the run is considered a success.
    ///
    /// A run fails if it was cancelled, or if any test failed in a way the expectations file
    /// didn't predict. Flaky failures, expected failures and unexpected passes don't fail a run.
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.unexpected_failures.is_empty()
    }

    /// Returns the process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            CaptureReplayExitCode::INTERRUPTED
        } else if !self.unexpected_failures.is_empty() {
            CaptureReplayExitCode::TEST_RUN_FAILED
        } else if self.finished_count() == 0 {
            CaptureReplayExitCode::NO_TESTS_RUN
        } else {
            CaptureReplayExitCode::OK
        }
    }
}
