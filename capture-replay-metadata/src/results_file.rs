// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// The results document written by a capture binary invoked with `--results-file=<path>`.
///
/// Only the parts of the document that capture-replay consumes are modeled; other keys are
/// ignored.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TestResultsFile {
    /// A map of full test names (`Suite.Case/Param`) to their results.
    #[serde(default)]
    pub tests: BTreeMap<String, TestResultEntry>,
}

impl TestResultsFile {
    /// Parses a results document from a string.
    pub fn parse(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    /// Returns the names of the tests that the suite reported as skipped.
    pub fn skipped_tests(&self) -> impl Iterator<Item = &str> + '_ {
        self.tests
            .iter()
            .filter(|(_, entry)| entry.actual == ActualResult::Skip)
            .map(|(name, _)| name.as_str())
    }
}

/// An individual entry in [`TestResultsFile::tests`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TestResultEntry {
    /// The result the test actually produced.
    pub actual: ActualResult,

    /// The result the suite expected, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

/// The result a test produced, as reported by the capture binary.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActualResult {
    /// The test passed.
    Pass,
    /// The test failed.
    Fail,
    /// The test was skipped by the suite itself.
    Skip,
    /// The test timed out.
    Timeout,
    /// The test crashed.
    Crash,
    /// A result this version of capture-replay does not know about.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ActualResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.pad("PASS"),
            Self::Fail => f.pad("FAIL"),
            Self::Skip => f.pad("SKIP"),
            Self::Timeout => f.pad("TIMEOUT"),
            Self::Crash => f.pad("CRASH"),
            Self::Unknown => f.pad("UNKNOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_results_file() {
        let input = indoc! {r#"
            {
                "interrupted": false,
                "tests": {
                    "ClearTest.RGBA8/ES2_Vulkan": {"actual": "PASS", "expected": "PASS"},
                    "ClearTest.Depth/ES3_Vulkan": {"actual": "SKIP"},
                    "DrawTest.Lines/ES2_Vulkan": {"actual": "NOTRUN"}
                },
                "version": 3
            }
        "#};

        let file = TestResultsFile::parse(input).expect("results file is valid");
        assert_eq!(file.tests.len(), 3);
        assert_eq!(
            file.tests["DrawTest.Lines/ES2_Vulkan"].actual,
            ActualResult::Unknown,
            "unrecognized results are mapped to Unknown"
        );
        assert_eq!(
            file.skipped_tests().collect::<Vec<_>>(),
            vec!["ClearTest.Depth/ES3_Vulkan"]
        );
    }

    #[test]
    fn missing_tests_key() {
        let file = TestResultsFile::parse("{}").expect("empty document is valid");
        assert_eq!(file, TestResultsFile::default());
    }
}
