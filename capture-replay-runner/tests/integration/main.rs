// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests that drive a whole run against fake build tools and test binaries.

#![cfg(unix)]

use capture_replay_metadata::CaptureReplayExitCode;
use capture_replay_runner::{
    config::CaptureReplayConfig,
    expectations::TestExpectations,
    result::{ResultKind, RunSummary, TestFailure},
    runner::{RunEvent, TestRunnerBuilder},
    signal::SignalHandlerKind,
    test_list::TestList,
};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;

mod fake_tools;

use fake_tools::{FakeCheckout, LISTED_TESTS};

fn load_config(checkout: &FakeCheckout) -> CaptureReplayConfig {
    CaptureReplayConfig::from_sources(checkout.root(), None, |path, unknown| {
        panic!("unknown keys in {path}: {unknown:?}")
    })
    .expect("config is valid")
}

fn load_expectations(checkout: &FakeCheckout, config: &CaptureReplayConfig) -> TestExpectations {
    let path = checkout.root().join(
        config
            .expectations_file()
            .expect("expectations file is configured"),
    );
    TestExpectations::from_path(&path, config.config_tags()).expect("expectations are valid")
}

#[test]
fn full_run() {
    let checkout = FakeCheckout::new();
    let config = load_config(&checkout);
    let expectations = load_expectations(&checkout, &config);
    let settings = config.resolve(checkout.root());

    let mut builder = TestRunnerBuilder::default();
    builder.set_worker_count(2);
    let mut runner = builder
        .build(settings, SignalHandlerKind::Noop)
        .expect("runner created");
    runner.build_test_suite().expect("test suite built");
    let trace_root = runner.temp_dir().to_owned();
    let build_dir = runner.settings().build_dir.clone();

    let listed = runner.list_tests("*").expect("tests listed");
    assert_eq!(listed, LISTED_TESTS);

    let test_list = TestList::new(listed, &expectations, false);
    assert_eq!(test_list.excluded(), ["Suite.Excluded"]);
    assert_eq!(test_list.run_count(), 6);

    let batches = test_list.partition(config.batch_count());
    assert_eq!(batches.len(), 3);

    let mut finished_batches = 0;
    let mut started = None;
    let finished = runner.execute(batches, |event| match event {
        RunEvent::RunStarted {
            batch_count,
            test_count,
            worker_count,
            ..
        } => started = Some((*batch_count, *test_count, *worker_count)),
        RunEvent::BatchFinished { .. } => finished_batches += 1,
        _ => {}
    });
    assert_eq!(started, Some((3, 6, 2)));
    assert_eq!(finished_batches, 3);

    let summary = RunSummary::new(
        &test_list.scheduled_names(),
        test_list.excluded(),
        test_list.expected_results(),
        finished,
    );

    assert_eq!(summary.tests(ResultKind::Passed), ["Suite.A", "Suite.B"]);
    assert_eq!(summary.tests(ResultKind::Failed), ["Suite.Mismatch"]);
    assert_eq!(summary.tests(ResultKind::ReplayFailed), ["Suite.NoResult"]);
    assert_eq!(summary.tests(ResultKind::Skipped), ["Suite.Skipped"]);
    assert_eq!(summary.tests(ResultKind::FailedToTrace), ["Suite.NoTrace"]);
    assert!(summary.not_run().is_empty());
    assert!(summary.duplicates().is_empty());
    assert_eq!(summary.excluded(), ["Suite.Excluded"]);

    assert_eq!(
        summary.expected_failures(),
        [TestFailure {
            name: "Suite.Mismatch".to_owned(),
            kind: ResultKind::Failed,
        }]
    );
    assert_eq!(
        summary.unexpected_failures(),
        [
            TestFailure {
                name: "Suite.NoResult".to_owned(),
                kind: ResultKind::ReplayFailed,
            },
            TestFailure {
                name: "Suite.NoTrace".to_owned(),
                kind: ResultKind::FailedToTrace,
            },
        ]
    );
    assert_eq!(summary.exit_code(), CaptureReplayExitCode::TEST_RUN_FAILED);

    let mismatch = summary
        .groups()
        .iter()
        .find(|group| group.kind == ResultKind::Failed)
        .expect("mismatch group exists");
    assert!(
        mismatch.output.contains("-red 1\n+red 0"),
        "output contains the state diff: {}",
        mismatch.output
    );

    let runtimes: BTreeSet<_> = summary.runtimes().keys().map(String::as_str).collect();
    for command in ["angle_end2end_tests", "capture_replay_tests", "gn", "ninja"] {
        assert!(runtimes.contains(command), "{command} in {runtimes:?}");
    }

    // Traces are removed, replay build directories are kept.
    let leftovers: Vec<_> = trace_root
        .read_dir_utf8()
        .expect("trace root readable")
        .map(|entry| entry.expect("entry readable").file_name().to_owned())
        .collect();
    assert!(leftovers.is_empty(), "leftover trace files: {leftovers:?}");
    assert!(
        build_dir
            .read_dir_utf8()
            .expect("build dir readable")
            .any(|entry| entry.expect("entry readable").file_name().starts_with("Replay")),
        "a replay build directory exists"
    );
}

#[test]
fn also_run_skipped_for_capture_tests() {
    let checkout = FakeCheckout::new();
    let config = load_config(&checkout);
    let expectations = load_expectations(&checkout, &config);

    let listed: Vec<String> = LISTED_TESTS.iter().map(|name| (*name).to_owned()).collect();
    let test_list = TestList::new(listed, &expectations, true);
    assert!(test_list.excluded().is_empty());
    assert_eq!(test_list.run_count(), LISTED_TESTS.len());

    let summary = test_list.to_summary();
    let excluded = summary
        .tests
        .iter()
        .find(|test| test.name == "Suite.Excluded")
        .expect("Suite.Excluded is listed");
    assert!(!excluded.excluded);
    assert_eq!(excluded.expectation, None);
}

#[test]
fn failing_test_suite_build() {
    let checkout = FakeCheckout::new();
    let config = load_config(&checkout);
    let mut settings = config.resolve(checkout.root());
    settings.test_suite = "missing_target".to_owned();

    let mut runner = TestRunnerBuilder::default()
        .build(settings, SignalHandlerKind::Noop)
        .expect("runner created");
    let error = runner
        .build_test_suite()
        .expect_err("building a missing target fails");
    assert!(
        error.to_string().contains("missing_target"),
        "error names the command: {error}"
    );
}
