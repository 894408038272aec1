// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Listing the tests in a capture binary, and deciding which of them run and how they're batched.

use crate::{
    batch::TestBatch,
    child_manager::ChildProcessesManager,
    config::RunSettings,
    errors::ListTestsError,
    expectations::{ExpectedResult, TestExpectations},
    test_command::CommandSpec,
};
use camino::Utf8Path;
use capture_replay_metadata::{TestListSummary, TestSummary};
use std::{collections::BTreeMap, fmt, io, num::NonZeroUsize};

const LIST_START: &str = "Tests list:";
const LIST_END: &str = "End tests list.";

/// The filesystem-safe name used for a test's trace files and as the replay binary's argument.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestLabel(String);

impl TestLabel {
    /// Derives the label from a full test name by replacing `.` and `/` with `_`.
    pub fn from_test_name(full_test_name: &str) -> Self {
        Self(full_test_name.replace(['.', '/'], "_"))
    }

    /// Returns the label as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// One parameterized gtest case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    full_test_name: String,
    label: TestLabel,
    context_id: Option<u32>,
    skipped_by_suite: bool,
}

impl TestCase {
    /// Creates a new test case from its full name, `Suite.Case/Param`.
    pub fn new(full_test_name: impl Into<String>) -> Self {
        let full_test_name = full_test_name.into();
        let label = TestLabel::from_test_name(&full_test_name);
        Self {
            full_test_name,
            label,
            context_id: None,
            skipped_by_suite: false,
        }
    }

    /// Returns the full test name.
    pub fn full_test_name(&self) -> &str {
        &self.full_test_name
    }

    /// Returns the label.
    pub fn label(&self) -> &TestLabel {
        &self.label
    }

    /// Returns the id of the context that produced this test's trace, once known.
    pub fn context_id(&self) -> Option<u32> {
        self.context_id
    }

    /// Returns true if the suite reported this test as skipped during capture.
    pub fn skipped_by_suite(&self) -> bool {
        self.skipped_by_suite
    }

    pub(crate) fn set_skipped_by_suite(&mut self, skipped: bool) {
        self.skipped_by_suite = skipped;
    }

    /// Returns true if `trace_files` contains a complete trace for this test: a first frame source
    /// (`_context<N>_001.cpp`), at least one context header, at least one context source
    /// (`_context<N>.cpp`) and exactly one manifest.
    ///
    /// Records the context id from the context header, if there is one.
    pub fn can_run_replay(&mut self, trace_files: &TraceFiles) -> bool {
        let mut frames = 0;
        let mut headers = 0;
        let mut sources = 0;
        let mut manifests = 0;
        let mut context_id = None;

        for file_name in trace_files.iter() {
            let Some(rest) = self.trace_file_suffix(file_name) else {
                continue;
            };
            match TraceFileKind::classify(rest) {
                Some(TraceFileKind::Manifest) => manifests += 1,
                Some(TraceFileKind::ContextHeader(id)) => {
                    headers += 1;
                    context_id = Some(id);
                }
                Some(TraceFileKind::ContextSource) => sources += 1,
                Some(TraceFileKind::Frame(1)) => frames += 1,
                Some(TraceFileKind::Frame(_)) | None => {}
            }
        }

        if context_id.is_some() {
            self.context_id = context_id;
        }

        let complete = frames >= 1 && headers >= 1 && sources >= 1 && manifests == 1;
        if !complete {
            tracing::debug!(
                "incomplete trace for {}: {frames} frame files, {headers} headers, \
                 {sources} sources, {manifests} manifests",
                self.full_test_name,
            );
        }
        complete
    }

    /// If `file_name` belongs to this test, returns the part after the label.
    fn trace_file_suffix<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let rest = file_name.strip_prefix(self.label.as_str())?;
        (rest.starts_with('.') || rest.starts_with("_context")).then_some(rest)
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.full_test_name)
    }
}

/// The kind of a trace file, given the part of its name after the test label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TraceFileKind {
    /// `.json` or `_context<N>.json`
    Manifest,
    /// `_context<N>.h`
    ContextHeader(u32),
    /// `_context<N>.cpp` or `_context<N>.c`
    ContextSource,
    /// `_context<N>_<frame>.cpp` or `_context<N>_<frame>.c`
    Frame(u32),
}

impl TraceFileKind {
    fn classify(rest: &str) -> Option<Self> {
        if rest.ends_with(".json") {
            return Some(Self::Manifest);
        }
        let rest = rest.strip_prefix("_context")?;
        if let Some(id) = rest.strip_suffix(".h") {
            return parse_digits(id).map(Self::ContextHeader);
        }
        let stem = rest
            .strip_suffix(".cpp")
            .or_else(|| rest.strip_suffix(".c"))?;
        match stem.split_once('_') {
            None => parse_digits(stem).map(|_| Self::ContextSource),
            Some((id, frame)) => {
                parse_digits(id)?;
                parse_digits(frame).map(Self::Frame)
            }
        }
    }
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// The file names in a trace directory.
#[derive(Clone, Debug, Default)]
pub struct TraceFiles {
    names: Vec<String>,
}

impl TraceFiles {
    /// Reads the names of the regular files in `dir`. A missing directory has no files.
    pub fn read(dir: &Utf8Path) -> io::Result<Self> {
        let entries = match dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => return Err(error),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_owned());
            }
        }
        names.sort_unstable();
        Ok(Self { names })
    }

    /// Creates a listing from file names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Iterates over the file names.
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.names.iter().map(String::as_str)
    }
}

/// Parses the output of `--list-tests`.
///
/// Returns `None` if the output is in neither the `Tests list:` format nor gtest's
/// `--gtest_list_tests` format.
pub fn parse_list_output(output: &str) -> Option<Vec<String>> {
    let mut lines = output.lines();
    if lines.any(|line| line.trim() == LIST_START) {
        let tests = lines
            .map(str::trim)
            .take_while(|line| *line != LIST_END)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect();
        return Some(tests);
    }

    parse_gtest_list(output)
}

/// Parses gtest's format: a line with `Suite.` followed by indented `Case` lines, each optionally
/// followed by a `# GetParam() = ...` comment.
fn parse_gtest_list(output: &str) -> Option<Vec<String>> {
    let mut tests = Vec::new();
    let mut suite: Option<&str> = None;
    let mut saw_content = false;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        saw_content = true;
        let without_comment = line.split_once('#').map_or(line, |(before, _)| before);
        if line.starts_with([' ', '\t']) {
            if let Some(suite) = suite {
                let case = without_comment.trim();
                if !case.is_empty() {
                    tests.push(format!("{suite}{case}"));
                }
            }
        } else {
            let candidate = without_comment.trim();
            suite = candidate.ends_with('.').then_some(candidate);
        }
    }

    (!saw_content || !tests.is_empty()).then_some(tests)
}

/// Runs the capture binary with `--list-tests` and returns the listed test names.
pub async fn list_tests(
    manager: &ChildProcessesManager,
    settings: &RunSettings,
    filter: &str,
) -> Result<Vec<String>, ListTestsError> {
    let spec = CommandSpec::new(settings.capture_exe.as_str())
        .arg("--list-tests")
        .arg(format!("--gtest_filter={filter}"))
        .current_dir(&settings.build_dir);
    let exit = manager
        .run_subprocess(&spec, settings.timeouts.list_tests)
        .await;
    if !exit.is_success() {
        return Err(ListTestsError::CommandFailed {
            command: spec.display(),
            exit,
        });
    }

    parse_list_output(&exit.output_str()).ok_or_else(|| ListTestsError::NoTestsListed {
        command: spec.display(),
    })
}

/// The listed tests after applying expectations.
#[derive(Clone, Debug)]
pub struct TestList {
    tests: Vec<TestCase>,
    listed: Vec<String>,
    excluded: Vec<String>,
    expected: BTreeMap<String, ExpectedResult>,
}

impl TestList {
    /// Applies `expectations` to the listed test names.
    ///
    /// Tests whose expectation excludes them from the run are left out unless
    /// `also_run_skipped_for_capture_tests` is set.
    pub fn new(
        listed: Vec<String>,
        expectations: &TestExpectations,
        also_run_skipped_for_capture_tests: bool,
    ) -> Self {
        let expected = expectations.filter(
            listed.iter().map(String::as_str),
            also_run_skipped_for_capture_tests,
        );

        let mut tests = Vec::new();
        let mut excluded = Vec::new();
        for name in &listed {
            if expected
                .get(name)
                .is_some_and(|result| result.excludes_from_run())
            {
                excluded.push(name.clone());
            } else {
                tests.push(TestCase::new(name.clone()));
            }
        }

        Self {
            tests,
            listed,
            excluded,
            expected,
        }
    }

    /// Returns the tests that will run.
    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    /// Returns the number of tests that will run.
    pub fn run_count(&self) -> usize {
        self.tests.len()
    }

    /// Returns the names of the tests the expectations file excludes.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// Returns the result forced by the expectations file, per test.
    pub fn expected_results(&self) -> &BTreeMap<String, ExpectedResult> {
        &self.expected
    }

    /// Returns the full names of the tests that will run.
    pub fn scheduled_names(&self) -> Vec<String> {
        self.tests
            .iter()
            .map(|test| test.full_test_name().to_owned())
            .collect()
    }

    fn runs_alone(&self, test: &TestCase) -> bool {
        self.expected
            .get(test.full_test_name())
            .is_some_and(|result| result.runs_alone())
    }

    /// Splits the tests into batches of at most `batch_count`, in listing order. Tests that must
    /// run alone get a batch each, after the shared batches.
    pub fn partition(&self, batch_count: NonZeroUsize) -> Vec<TestBatch> {
        let (alone, shared): (Vec<_>, Vec<_>) = self
            .tests
            .iter()
            .cloned()
            .partition(|test| self.runs_alone(test));

        let mut groups: Vec<Vec<TestCase>> = shared
            .chunks(batch_count.get())
            .map(<[TestCase]>::to_vec)
            .collect();
        groups.extend(alone.into_iter().map(|test| vec![test]));

        groups
            .into_iter()
            .enumerate()
            .map(|(batch_index, tests)| TestBatch::new(batch_index, tests))
            .collect()
    }

    /// Returns the machine-readable form of this list.
    pub fn to_summary(&self) -> TestListSummary {
        let tests = self
            .listed
            .iter()
            .map(|name| {
                let expectation = self.expected.get(name).copied();
                TestSummary {
                    name: name.clone(),
                    label: TestLabel::from_test_name(name).as_str().to_owned(),
                    expectation: expectation.map(|result| result.as_str().to_owned()),
                    excluded: expectation.is_some_and(ExpectedResult::excludes_from_run),
                    run_alone: expectation.is_some_and(ExpectedResult::runs_alone),
                }
            })
            .collect();
        TestListSummary {
            run_count: self.run_count(),
            tests,
        }
    }
}
