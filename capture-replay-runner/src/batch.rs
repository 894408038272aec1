// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capturing, building and replaying one batch of tests.
//!
//! A batch moves through three phases, in order: the capture binary runs once for every test in
//! the batch, a composite replay binary is built from the traces that capture produced, and the
//! replay binary runs once per test. Each phase sets aside the tests that reached a terminal state
//! as [`GroupedResult`]s and passes the rest on. Failures inside a batch never escape as errors.

use crate::{
    child_manager::ChildProcessesManager,
    config::{GnArgValue, RunSettings},
    errors::{ManifestWriteError, ResultsFileError, TraceDirError},
    result::{GroupedResult, ResultKind},
    test_command::{ChildExit, CommandSpec},
    test_list::{TestCase, TraceFiles},
};
use camino::{Utf8Path, Utf8PathBuf};
use capture_replay_metadata::TestResultsFile;
use itertools::Itertools;
use serde::Serialize;
use similar::TextDiff;
use std::{collections::BTreeMap, io, sync::Arc};
use swrite::{SWrite, swrite, swriteln};

/// The name of the names manifest written into each trace directory.
pub const NAMES_MANIFEST: &str = "test_names.json";

/// The replay result code for a test that matched.
const REPLAY_PASSED: i32 = 0;
/// The replay result code for a trace that failed to initialize.
const REPLAY_INIT_FAILED: i32 = -1;
/// The replay result code for a serialized state mismatch between capture and replay.
const REPLAY_STATE_MISMATCH: i32 = -2;

/// Per-worker state shared by every batch the worker runs.
#[derive(Debug)]
pub struct WorkerContext {
    worker_id: usize,
    manager: Arc<ChildProcessesManager>,
    settings: Arc<RunSettings>,
    trace_dir: Utf8PathBuf,
    results_file: Utf8PathBuf,
    replay_build_dir: Utf8PathBuf,
    gn_generated: bool,
}

impl WorkerContext {
    /// Creates the context for `worker_id`, with scratch files under `temp_dir`.
    pub fn new(
        worker_id: usize,
        manager: Arc<ChildProcessesManager>,
        settings: Arc<RunSettings>,
        temp_dir: &Utf8Path,
    ) -> Self {
        let replay_build_dir = settings.replay_build_dir(worker_id);
        Self {
            worker_id,
            manager,
            settings,
            trace_dir: temp_dir.join(format!("traces{worker_id}")),
            results_file: temp_dir.join(format!("results{worker_id}.json")),
            replay_build_dir,
            gn_generated: false,
        }
    }

    /// Returns the worker id.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Returns the directory the capture binary writes traces into.
    pub fn trace_dir(&self) -> &Utf8Path {
        &self.trace_dir
    }

    /// Returns the directory the replay binary is built in.
    pub fn replay_build_dir(&self) -> &Utf8Path {
        &self.replay_build_dir
    }

    /// Returns this worker's child process manager.
    pub fn manager(&self) -> &Arc<ChildProcessesManager> {
        &self.manager
    }

    async fn reset_trace_dir(&self) -> Result<(), TraceDirError> {
        match tokio::fs::remove_dir_all(&self.trace_dir).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(TraceDirError::new(&self.trace_dir, error)),
        }
        tokio::fs::create_dir_all(&self.trace_dir)
            .await
            .map_err(|error| TraceDirError::new(&self.trace_dir, error))
    }
}

/// Raised when the run is cancelled while a batch is in flight.
#[derive(Clone, Copy, Debug)]
struct Cancelled;

/// Whether a phase left tests for the next one.
type PhaseResult = Result<bool, Cancelled>;

/// How a batch ended.
#[derive(Clone, Debug)]
pub struct BatchOutcome {
    /// The index of the batch.
    pub batch_index: usize,
    /// Results for the tests that reached a terminal state.
    pub results: Vec<GroupedResult>,
    /// True if the run was cancelled before every test reached a terminal state.
    pub cancelled: bool,
}

/// A group of tests captured together and replayed from one composite binary.
#[derive(Clone, Debug)]
pub struct TestBatch {
    batch_index: usize,
    tests: Vec<TestCase>,
    results: Vec<GroupedResult>,
}

impl TestBatch {
    /// Creates a new batch.
    pub fn new(batch_index: usize, tests: Vec<TestCase>) -> Self {
        Self {
            batch_index,
            tests,
            results: Vec::new(),
        }
    }

    /// Returns the batch index.
    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    /// Returns the tests that have not yet reached a terminal state.
    pub fn tests(&self) -> &[TestCase] {
        &self.tests
    }

    /// Returns the results recorded so far.
    pub fn results(&self) -> &[GroupedResult] {
        &self.results
    }

    /// Runs every phase for this batch.
    pub async fn run(mut self, ctx: &mut WorkerContext) -> BatchOutcome {
        let cancelled = self.run_phases(ctx).await.is_err();
        if !cancelled {
            debug_assert!(self.tests.is_empty(), "every test reached a terminal state");
        }
        BatchOutcome {
            batch_index: self.batch_index,
            results: self.results,
            cancelled,
        }
    }

    async fn run_phases(&mut self, ctx: &mut WorkerContext) -> Result<(), Cancelled> {
        if !self.run_with_capture(ctx).await? {
            return Ok(());
        }
        if !self.remove_tests_that_do_not_produce_appropriate_trace_files(&ctx.trace_dir) {
            return Ok(());
        }
        if !self.build_replay(ctx).await? {
            return Ok(());
        }
        self.run_replay(ctx).await
    }

    /// Records a terminal state for every remaining test.
    fn finish_all(&mut self, kind: ResultKind, message: impl Into<String>, output: impl Into<String>) {
        let tests = std::mem::take(&mut self.tests)
            .into_iter()
            .map(|test| test.full_test_name().to_owned())
            .collect();
        self.push_result(GroupedResult::new(kind, message, output, tests));
    }

    fn push_result(&mut self, result: GroupedResult) {
        if !result.tests.is_empty() {
            self.results.push(result);
        }
    }

    /// Returns the command that captures every test in this batch.
    pub fn capture_command(&self, ctx: &WorkerContext) -> CommandSpec {
        let filter = self
            .tests
            .iter()
            .map(TestCase::full_test_name)
            .join(":");
        CommandSpec::new(ctx.settings.capture_exe.as_str())
            .arg(format!("--gtest_filter={filter}"))
            .arg("--angle-per-test-capture-label")
            .arg(format!("--results-file={}", ctx.results_file))
            .args(ctx.settings.capture.extra_args().iter().cloned())
            .envs(ctx.settings.capture.capture_env(&ctx.trace_dir))
            .current_dir(&ctx.settings.build_dir)
    }

    /// Runs the capture binary once for the whole batch.
    ///
    /// If capture fails or times out, every test in the batch gets the same result.
    async fn run_with_capture(&mut self, ctx: &WorkerContext) -> PhaseResult {
        if let Err(error) = ctx.reset_trace_dir().await {
            self.finish_all(
                ResultKind::CaptureFailed,
                "failed to prepare trace directory",
                error_chain(&error),
            );
            return Ok(false);
        }
        match tokio::fs::remove_file(&ctx.results_file).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => tracing::debug!("error removing stale `{}`: {error}", ctx.results_file),
        }

        let spec = self.capture_command(ctx);
        let exit = ctx
            .manager
            .run_subprocess(&spec, ctx.settings.timeouts.capture)
            .await;
        match &exit {
            ChildExit::Killed { .. } => return Err(Cancelled),
            ChildExit::TimedOut { .. } => {
                self.finish_all(
                    ResultKind::TimedOut,
                    "capture timed out",
                    exit.output_str(),
                );
                return Ok(false);
            }
            _ if !exit.is_success() => {
                self.finish_all(
                    ResultKind::CaptureFailed,
                    format!("capture {exit}"),
                    exit.output_str(),
                );
                return Ok(false);
            }
            _ => {}
        }

        match read_results_file(&ctx.results_file).await {
            Ok(results) => {
                self.apply_capture_results(&results);
                Ok(true)
            }
            Err(error) => {
                self.finish_all(
                    ResultKind::CaptureFailed,
                    "capture did not write a valid results file",
                    error_chain(&error),
                );
                Ok(false)
            }
        }
    }

    /// Marks the tests the suite reported as skipped.
    pub fn apply_capture_results(&mut self, results: &TestResultsFile) {
        for name in results.skipped_tests() {
            if let Some(test) = self
                .tests
                .iter_mut()
                .find(|test| test.full_test_name() == name)
            {
                test.set_skipped_by_suite(true);
            }
        }
    }

    /// Sets aside tests the suite skipped and tests that didn't leave a complete trace in
    /// `trace_dir`. Returns true if any tests remain.
    pub fn remove_tests_that_do_not_produce_appropriate_trace_files(
        &mut self,
        trace_dir: &Utf8Path,
    ) -> bool {
        let trace_files = match TraceFiles::read(trace_dir) {
            Ok(files) => files,
            Err(error) => {
                self.finish_all(
                    ResultKind::FailedToTrace,
                    format!("failed to read trace directory `{trace_dir}`"),
                    error.to_string(),
                );
                return false;
            }
        };

        let mut skipped = Vec::new();
        let mut failed_to_trace = Vec::new();
        let mut remaining = Vec::new();
        for mut test in std::mem::take(&mut self.tests) {
            if test.skipped_by_suite() {
                skipped.push(test.full_test_name().to_owned());
            } else if test.can_run_replay(&trace_files) {
                remaining.push(test);
            } else {
                failed_to_trace.push(test.full_test_name().to_owned());
            }
        }

        self.push_result(GroupedResult::new(
            ResultKind::Skipped,
            "skipped by the test suite",
            "",
            skipped,
        ));
        self.push_result(GroupedResult::new(
            ResultKind::FailedToTrace,
            "capture did not produce a complete trace",
            "",
            failed_to_trace,
        ));
        self.tests = remaining;
        !self.tests.is_empty()
    }

    /// Writes the names manifest listing the label of every remaining test.
    pub async fn write_names_manifest(
        &self,
        trace_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, ManifestWriteError> {
        #[derive(Serialize)]
        struct NamesManifest<'a> {
            traces: Vec<&'a str>,
        }

        let path = trace_dir.join(NAMES_MANIFEST);
        let manifest = NamesManifest {
            traces: self.tests.iter().map(|test| test.label().as_str()).collect(),
        };
        let contents = serde_json::to_string_pretty(&manifest)
            .map_err(|error| ManifestWriteError::new(&path, io::Error::other(error)))?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|error| ManifestWriteError::new(&path, error))?;
        Ok(path)
    }

    /// Builds the composite replay binary for the remaining tests.
    ///
    /// GN runs only the first time a worker builds. If either build step fails, every remaining
    /// test is marked [`ResultKind::CompileFailed`] with the build output attached.
    async fn build_replay(&mut self, ctx: &mut WorkerContext) -> PhaseResult {
        let manifest = match self.write_names_manifest(&ctx.trace_dir).await {
            Ok(path) => path,
            Err(error) => {
                self.finish_all(
                    ResultKind::CompileFailed,
                    "failed to write names manifest",
                    error_chain(&error),
                );
                return Ok(false);
            }
        };

        if !ctx.gn_generated {
            let mut args = vec![
                (
                    "angle_build_capture_replay_tests".to_owned(),
                    GnArgValue::Bool(true),
                ),
                (
                    "angle_capture_replay_test_trace_dir".to_owned(),
                    GnArgValue::string(ctx.trace_dir.as_str()),
                ),
                (
                    "angle_capture_replay_composite_file".to_owned(),
                    GnArgValue::string(manifest.as_str()),
                ),
            ];
            args.extend(ctx.settings.gn_args.iter().cloned());

            let (spec, exit) = ctx.manager.run_gn_gen(&ctx.replay_build_dir, &args).await;
            if !self.check_build_step(&spec, &exit)? {
                return Ok(false);
            }
            ctx.gn_generated = true;
        }

        let (spec, exit) = ctx
            .manager
            .run_autoninja(&ctx.replay_build_dir, &ctx.settings.replay_target)
            .await;
        self.check_build_step(&spec, &exit)
    }

    fn check_build_step(&mut self, spec: &CommandSpec, exit: &ChildExit) -> PhaseResult {
        if exit.is_killed() {
            return Err(Cancelled);
        }
        if exit.is_success() {
            return Ok(true);
        }
        self.finish_all(
            ResultKind::CompileFailed,
            format!("`{}` {exit}", spec.display()),
            exit.output_str(),
        );
        Ok(false)
    }

    /// Runs the replay binary once for each remaining test.
    async fn run_replay(&mut self, ctx: &WorkerContext) -> Result<(), Cancelled> {
        let replay_exe = ctx.settings.replay_exe(&ctx.replay_build_dir);
        let mut passed = Vec::new();

        while let Some(test) = self.tests.first().cloned() {
            let label = test.label().as_str();
            let spec = CommandSpec::new(replay_exe.as_str())
                .arg(label)
                .current_dir(&ctx.replay_build_dir);
            let exit = ctx
                .manager
                .run_subprocess(&spec, ctx.settings.timeouts.replay)
                .await;
            if exit.is_killed() {
                self.push_result(GroupedResult::new(
                    ResultKind::Passed,
                    "",
                    "",
                    std::mem::take(&mut passed),
                ));
                return Err(Cancelled);
            }
            self.tests.remove(0);

            let name = test.full_test_name().to_owned();
            if exit.is_timed_out() {
                self.push_result(GroupedResult::new(
                    ResultKind::TimedOut,
                    "replay timed out",
                    exit.output_str(),
                    vec![name],
                ));
                continue;
            }

            let output = exit.output_str();
            let code = parse_replay_results(&output).get(label).copied();
            match ReplayVerdict::new(code, &exit) {
                ReplayVerdict::Passed => passed.push(name),
                ReplayVerdict::StateMismatch => {
                    let mut message = output.into_owned();
                    let diff = context_diff(&ctx.replay_build_dir, label);
                    if !diff.is_empty() {
                        swriteln!(message, "\n{diff}");
                    }
                    self.push_result(GroupedResult::new(
                        ResultKind::Failed,
                        "captured and replayed state differ",
                        message,
                        vec![name],
                    ));
                }
                ReplayVerdict::ReplayFailed(reason) => {
                    tracing::debug!("replay of {name} failed: {reason}");
                    self.push_result(GroupedResult::new(
                        ResultKind::ReplayFailed,
                        reason,
                        output,
                        vec![name],
                    ));
                }
            }
        }

        self.push_result(GroupedResult::new(ResultKind::Passed, "", "", passed));
        Ok(())
    }
}

/// The outcome of replaying one test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayVerdict {
    /// The replay matched.
    Passed,
    /// Captured and replayed state differ.
    StateMismatch,
    /// Replay failed for the given reason.
    ReplayFailed(String),
}

impl ReplayVerdict {
    /// Interprets the result code the replay binary printed for a test, if any.
    pub fn new(code: Option<i32>, exit: &ChildExit) -> Self {
        match code {
            Some(REPLAY_PASSED) => Self::Passed,
            Some(REPLAY_STATE_MISMATCH) => Self::StateMismatch,
            Some(REPLAY_INIT_FAILED) => Self::ReplayFailed("replay failed to initialize".to_owned()),
            Some(code) => Self::ReplayFailed(format!("replay returned unknown result code {code}")),
            None => Self::ReplayFailed(format!("no result reported (replay {exit})")),
        }
    }
}

/// Parses `*RESULT <label> <code>` lines from replay output.
pub fn parse_replay_results(output: &str) -> BTreeMap<&str, i32> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().strip_prefix("*RESULT")?.split_whitespace();
            let label = parts.next()?;
            let code = parts.next()?.parse().ok()?;
            Some((label, code))
        })
        .collect()
}

/// Produces unified diffs of the captured and replayed context state for every frame that has
/// both snapshots in `replay_build_dir`.
///
/// Frames are checked from 1 until one is missing; frame 1 may be absent.
pub fn context_diff(replay_build_dir: &Utf8Path, label: &str) -> String {
    let mut out = String::new();
    for frame in 1.. {
        let captured_name = format!("{label}_ContextCaptured{frame}.json");
        let replayed_name = format!("{label}_ContextReplayed{frame}.json");
        let captured = std::fs::read_to_string(replay_build_dir.join(&captured_name));
        let replayed = std::fs::read_to_string(replay_build_dir.join(&replayed_name));
        match (captured, replayed) {
            (Ok(captured), Ok(replayed)) => {
                if captured != replayed {
                    let diff = TextDiff::from_lines(&captured, &replayed);
                    swrite!(
                        out,
                        "{}",
                        diff.unified_diff()
                            .context_radius(3)
                            .header(&captured_name, &replayed_name)
                    );
                }
            }
            (Err(_), Err(_)) if frame == 1 => continue,
            (Err(_), Err(_)) => break,
            (captured, _) => {
                let missing = if captured.is_err() {
                    captured_name
                } else {
                    replayed_name
                };
                swriteln!(out, "missing state snapshot `{missing}`");
                break;
            }
        }
    }
    out
}

async fn read_results_file(path: &Utf8Path) -> Result<TestResultsFile, ResultsFileError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| ResultsFileError::Read {
            path: path.to_owned(),
            err,
        })?;
    TestResultsFile::parse(&contents).map_err(|err| ResultsFileError::Parse {
        path: path.to_owned(),
        err,
    })
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        swrite!(out, "\n  caused by: {err}");
        source = err.source();
    }
    out
}
