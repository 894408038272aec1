// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `capture-replay` failures.
///
/// `capture-replay` runs may fail for a variety of reasons. This structure documents the exit codes
/// that may occur in case of expected failures.
///
/// Unknown/unexpected failures will always result in exit code 1.
pub enum CaptureReplayExitCode {}

impl CaptureReplayExitCode {
    /// No errors occurred and capture-replay exited normally.
    pub const OK: i32 = 0;

    /// No tests were selected to run, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 4;

    /// One or more tests failed in a way the expectations file did not predict.
    pub const TEST_RUN_FAILED: i32 = 100;

    /// Building the test suite produced an error.
    ///
    /// Failing to build a replay binary for a batch is not reported through this code: such
    /// failures are attributed to the tests in the batch.
    pub const BUILD_FAILED: i32 = 101;

    /// Listing the tests in the capture binary produced an error.
    pub const TEST_LIST_CREATION_FAILED: i32 = 104;

    /// Writing data to stdout, stderr or the output file produced an error.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// A user issue happened while setting up a run, for example an invalid config or
    /// expectations file.
    pub const SETUP_ERROR: i32 = 96;

    /// The run was interrupted by a signal before all batches completed.
    pub const INTERRUPTED: i32 = 130;
}
