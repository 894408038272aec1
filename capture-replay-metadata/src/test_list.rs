// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

/// The machine-readable form of `capture-replay list`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TestListSummary {
    /// The number of tests that will be run.
    pub run_count: usize,

    /// Every test the capture binary listed, in listing order.
    pub tests: Vec<TestSummary>,
}

/// Information about a single listed test.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TestSummary {
    /// The full gtest name, in the form `Suite.Case/Param`.
    pub name: String,

    /// The filesystem-safe label used to name the test's trace files.
    pub label: String,

    /// The result forced by the expectations file, if any (for example `COMPILE_FAIL`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expectation: Option<String>,

    /// True if the expectations file excludes this test from the run.
    pub excluded: bool,

    /// True if this test is captured and replayed in a batch of its own.
    pub run_alone: bool,
}
