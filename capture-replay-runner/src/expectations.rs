// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test expectations: which tests are skipped, isolated, flaky or expected to fail.
//!
//! An expectations file has one rule per line:
//!
//! ```text
//! # comment
//! 1234 WIN DEBUG : ClearTest.* = SKIP_FOR_CAPTURE
//! LINUX : DrawTest.Lines/* = COMPILE_FAIL
//! ```
//!
//! Tokens before the `:` are tags. A rule applies only if every one of its tags is part of the
//! run's [`ConfigTags`]. Bug references (such as `1234` or `b/5678`) may be mixed in with the tags
//! and are ignored. The pattern is a glob matched against the full test name.
//!
//! Rules are evaluated in file order and the first applicable rule that matches a test wins.

use crate::{
    errors::{
        ExpectationsParseError, ExpectationsParseErrorKind, ExpectationsReadError,
        ExpectedResultParseError,
    },
    platform::ConfigTags,
    result::ResultKind,
};
use camino::Utf8Path;
use globset::{Glob, GlobMatcher};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// The result an expectations rule forces for the tests it matches.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ExpectedResult {
    /// The test is expected to pass.
    Pass,
    /// The test is expected to fail.
    Fail,
    /// The test is expected to crash.
    Crash,
    /// The test is skipped.
    Skip,
    /// The test is known to time out, and is skipped.
    Timeout,
    /// The test sometimes fails; failures are logged but don't fail the run.
    Flaky,
    /// The test doesn't work with capture, and is skipped.
    SkipForCapture,
    /// The test's replay doesn't compile. It runs in a batch of its own so that the build failure
    /// doesn't affect other tests.
    CompileFail,
}

impl ExpectedResult {
    /// Returns all the variants, in the order they are spelled in expectations files.
    pub fn variants() -> &'static [&'static str] {
        &[
            "PASS",
            "FAIL",
            "CRASH",
            "SKIP",
            "TIMEOUT",
            "FLAKY",
            "SKIP_FOR_CAPTURE",
            "COMPILE_FAIL",
        ]
    }

    /// Returns the spelling of this result in expectations files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Crash => "CRASH",
            Self::Skip => "SKIP",
            Self::Timeout => "TIMEOUT",
            Self::Flaky => "FLAKY",
            Self::SkipForCapture => "SKIP_FOR_CAPTURE",
            Self::CompileFail => "COMPILE_FAIL",
        }
    }

    /// Returns true if tests with this result are left out of the run, unless the run
    /// explicitly includes normally-skipped tests.
    pub fn excludes_from_run(self) -> bool {
        matches!(self, Self::Skip | Self::Timeout | Self::SkipForCapture)
    }

    /// Returns true if tests with this result are run in a batch of their own.
    pub fn runs_alone(self) -> bool {
        matches!(self, Self::CompileFail)
    }

    /// Returns true if a test with this expectation ending with `kind` was predicted.
    ///
    /// Flaky tests are handled separately and never match here. Results that exclude a test from
    /// the run don't predict anything: such a test only runs once [`TestExpectations::filter`]
    /// has dropped its expectation.
    pub fn predicts(self, kind: ResultKind) -> bool {
        match self {
            Self::Pass | Self::Flaky | Self::Skip | Self::SkipForCapture | Self::Timeout => false,
            Self::Fail => matches!(
                kind,
                ResultKind::Failed
                    | ResultKind::ReplayFailed
                    | ResultKind::CaptureFailed
                    | ResultKind::FailedToTrace
            ),
            Self::Crash => matches!(
                kind,
                ResultKind::CaptureFailed | ResultKind::ReplayFailed | ResultKind::FailedToTrace
            ),
            Self::CompileFail => kind == ResultKind::CompileFailed,
        }
    }

    /// Returns true if this result predicts a failure of some kind.
    pub fn expects_failure(self) -> bool {
        !matches!(self, Self::Pass | Self::Flaky)
    }
}

impl FromStr for ExpectedResult {
    type Err = ExpectedResultParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let val = match s {
            "PASS" => Self::Pass,
            "FAIL" => Self::Fail,
            "CRASH" => Self::Crash,
            "SKIP" => Self::Skip,
            "TIMEOUT" => Self::Timeout,
            "FLAKY" => Self::Flaky,
            "SKIP_FOR_CAPTURE" => Self::SkipForCapture,
            "COMPILE_FAIL" => Self::CompileFail,
            other => return Err(ExpectedResultParseError::new(other)),
        };
        Ok(val)
    }
}

impl fmt::Display for ExpectedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A single parsed rule.
#[derive(Clone, Debug)]
pub struct ExpectationRule {
    line_number: usize,
    tags: ConfigTags,
    pattern: String,
    matcher: GlobMatcher,
    result: ExpectedResult,
}

impl ExpectationRule {
    /// The 1-based line number this rule was read from.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// The tags this rule is gated on.
    pub fn tags(&self) -> ConfigTags {
        self.tags
    }

    /// The glob pattern, as written.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The forced result.
    pub fn result(&self) -> ExpectedResult {
        self.result
    }

    /// Returns true if this rule applies to a run with the given tags.
    pub fn applies_to(&self, config_tags: ConfigTags) -> bool {
        config_tags.contains(self.tags)
    }

    /// Returns true if the pattern matches the test name.
    pub fn is_match(&self, test_name: &str) -> bool {
        self.matcher.is_match(test_name)
    }
}

/// Parsed expectations, specialized to one run configuration.
#[derive(Clone, Debug)]
pub struct TestExpectations {
    config_tags: ConfigTags,
    rules: Vec<ExpectationRule>,
}

impl TestExpectations {
    /// Creates expectations with no rules.
    pub fn empty(config_tags: ConfigTags) -> Self {
        Self {
            config_tags,
            rules: Vec::new(),
        }
    }

    /// Reads expectations from a file.
    pub fn from_path(
        path: &Utf8Path,
        config_tags: ConfigTags,
    ) -> Result<Self, ExpectationsReadError> {
        let input = std::fs::read_to_string(path).map_err(|err| ExpectationsReadError::Read {
            path: path.to_owned(),
            err,
        })?;
        Self::parse(&input, config_tags).map_err(|err| ExpectationsReadError::Parse {
            path: path.to_owned(),
            err,
        })
    }

    /// Parses expectations from a string.
    ///
    /// Rules whose tags don't apply to `config_tags` are still parsed and validated, but are
    /// never consulted.
    pub fn parse(input: &str, config_tags: ConfigTags) -> Result<Self, ExpectationsParseError> {
        let mut rules = Vec::new();
        for (idx, line) in input.lines().enumerate() {
            if let Some(rule) = parse_line(idx + 1, line)? {
                rules.push(rule);
            }
        }
        Ok(Self { config_tags, rules })
    }

    /// Returns the tags expectations are evaluated against.
    pub fn config_tags(&self) -> ConfigTags {
        self.config_tags
    }

    /// Returns all parsed rules, in file order.
    pub fn rules(&self) -> &[ExpectationRule] {
        &self.rules
    }

    /// Returns the first applicable rule matching `test_name`.
    pub fn lookup(&self, test_name: &str) -> Option<&ExpectationRule> {
        self.rules
            .iter()
            .find(|rule| rule.applies_to(self.config_tags) && rule.is_match(test_name))
    }

    /// Returns the forced result for every test in `test_names` that an applicable rule matches.
    ///
    /// If `include_normally_skipped` is true, results that would exclude a test from the run
    /// (`SKIP`, `SKIP_FOR_CAPTURE`, `TIMEOUT`) are overridden and left out of the map, so those
    /// tests run like any other.
    ///
    /// This is a pure function of the rules, the config tags and its arguments.
    pub fn filter<'a>(
        &self,
        test_names: impl IntoIterator<Item = &'a str>,
        include_normally_skipped: bool,
    ) -> BTreeMap<String, ExpectedResult> {
        test_names
            .into_iter()
            .filter_map(|name| {
                let rule = self.lookup(name)?;
                if include_normally_skipped && rule.result.excludes_from_run() {
                    None
                } else {
                    Some((name.to_owned(), rule.result))
                }
            })
            .collect()
    }
}

fn parse_line(
    line_number: usize,
    line: &str,
) -> Result<Option<ExpectationRule>, ExpectationsParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
        return Ok(None);
    }

    let err = |kind| ExpectationsParseError::new(line_number, line, kind);

    // Bug references may contain `:`, so split from the right.
    let (rest, result_str) = trimmed
        .rsplit_once('=')
        .ok_or_else(|| err(ExpectationsParseErrorKind::MissingEquals))?;
    let (tags_str, pattern) = rest
        .rsplit_once(':')
        .ok_or_else(|| err(ExpectationsParseErrorKind::MissingColon))?;

    let mut tags = ConfigTags::empty();
    for token in tags_str.split_whitespace() {
        if is_bug_reference(token) {
            continue;
        }
        let tag = ConfigTags::from_tag_name(token)
            .ok_or_else(|| err(ExpectationsParseErrorKind::UnknownTag(token.to_owned())))?;
        tags |= tag;
    }

    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(err(ExpectationsParseErrorKind::EmptyPattern));
    }
    let matcher = Glob::new(pattern)
        .map_err(|error| err(ExpectationsParseErrorKind::InvalidGlob(error)))?
        .compile_matcher();

    let result_str = result_str.trim();
    let result = result_str
        .parse()
        .map_err(|_| err(ExpectationsParseErrorKind::UnknownResult(result_str.to_owned())))?;

    Ok(Some(ExpectationRule {
        line_number,
        tags,
        pattern: pattern.to_owned(),
        matcher,
        result,
    }))
}

fn is_bug_reference(token: &str) -> bool {
    token.chars().all(|c| c.is_ascii_digit())
        || ["b/", "anglebug:", "angleproject:", "crbug.com/", "http://", "https://"]
            .iter()
            .any(|prefix| token.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use test_case::test_case;

    static EXPECTATIONS: &str = indoc! {"
        # Capture-replay expectations.

        anglebug:1234 : ClearTest.RGBA8/* = SKIP_FOR_CAPTURE
        b/5678 LINUX : DrawTest.Lines/* = COMPILE_FAIL
        WIN : DrawTest.* = FLAKY
        // Later rules lose to earlier ones.
        : DrawTest.Lines/ES2_Vulkan = FAIL
        DEBUG ASAN : BlitTest.* = TIMEOUT
        : FenceTest.* = CRASH
    "};

    fn linux_release() -> ConfigTags {
        ConfigTags::LINUX | ConfigTags::RELEASE
    }

    #[test]
    fn parse_rules() {
        let expectations =
            TestExpectations::parse(EXPECTATIONS, linux_release()).expect("file is valid");
        let summary: Vec<_> = expectations
            .rules()
            .iter()
            .map(|rule| (rule.line_number(), rule.tags(), rule.pattern(), rule.result()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (
                    3,
                    ConfigTags::empty(),
                    "ClearTest.RGBA8/*",
                    ExpectedResult::SkipForCapture
                ),
                (
                    4,
                    ConfigTags::LINUX,
                    "DrawTest.Lines/*",
                    ExpectedResult::CompileFail
                ),
                (5, ConfigTags::WIN, "DrawTest.*", ExpectedResult::Flaky),
                (
                    7,
                    ConfigTags::empty(),
                    "DrawTest.Lines/ES2_Vulkan",
                    ExpectedResult::Fail
                ),
                (
                    8,
                    ConfigTags::DEBUG | ConfigTags::ASAN,
                    "BlitTest.*",
                    ExpectedResult::Timeout
                ),
                (9, ConfigTags::empty(), "FenceTest.*", ExpectedResult::Crash),
            ]
        );
    }

    #[test]
    fn lookup_first_match_wins() {
        let expectations =
            TestExpectations::parse(EXPECTATIONS, linux_release()).expect("file is valid");
        assert_eq!(
            expectations
                .lookup("DrawTest.Lines/ES2_Vulkan")
                .map(|rule| rule.result()),
            Some(ExpectedResult::CompileFail),
            "the LINUX rule on line 4 shadows the rule on line 7"
        );

        let expectations = TestExpectations::parse(EXPECTATIONS, ConfigTags::WIN)
            .expect("file is valid");
        assert_eq!(
            expectations
                .lookup("DrawTest.Lines/ES2_Vulkan")
                .map(|rule| rule.result()),
            Some(ExpectedResult::Flaky),
            "on Windows the LINUX rule doesn't apply"
        );
    }

    #[test]
    fn tags_are_conjunctive() {
        let debug_only = ConfigTags::LINUX | ConfigTags::DEBUG;
        let expectations = TestExpectations::parse(EXPECTATIONS, debug_only).unwrap();
        assert!(
            expectations.lookup("BlitTest.Copy/ES3_GL").is_none(),
            "DEBUG ASAN requires both tags"
        );

        let debug_asan = debug_only | ConfigTags::ASAN;
        let expectations = TestExpectations::parse(EXPECTATIONS, debug_asan).unwrap();
        assert_eq!(
            expectations
                .lookup("BlitTest.Copy/ES3_GL")
                .map(|rule| rule.result()),
            Some(ExpectedResult::Timeout)
        );
    }

    #[test]
    fn filter_excluded_tests() {
        let expectations = TestExpectations::parse(EXPECTATIONS, linux_release()).unwrap();
        let names = [
            "ClearTest.RGBA8/ES2_Vulkan",
            "DrawTest.Lines/ES2_Vulkan",
            "FenceTest.Wait/ES3_Vulkan",
            "SimpleTest.Basic/ES2_Vulkan",
        ];

        let filtered = expectations.filter(names, false);
        assert_eq!(
            filtered,
            BTreeMap::from([
                (
                    "ClearTest.RGBA8/ES2_Vulkan".to_owned(),
                    ExpectedResult::SkipForCapture
                ),
                (
                    "DrawTest.Lines/ES2_Vulkan".to_owned(),
                    ExpectedResult::CompileFail
                ),
                (
                    "FenceTest.Wait/ES3_Vulkan".to_owned(),
                    ExpectedResult::Crash
                ),
            ])
        );

        let filtered = expectations.filter(names, true);
        assert!(
            !filtered.contains_key("ClearTest.RGBA8/ES2_Vulkan"),
            "skipped tests are overridden when including normally skipped tests"
        );
        assert_eq!(filtered.len(), 2);
    }

    #[test_case("WIN ClearTest.* = FAIL", ExpectationsParseErrorKind::MissingColon; "missing colon")]
    #[test_case("WIN : ClearTest.* FAIL", ExpectationsParseErrorKind::MissingEquals; "missing equals")]
    #[test_case("WIN :  = FAIL", ExpectationsParseErrorKind::EmptyPattern; "empty pattern")]
    #[test_case("SWIFTSHADER : ClearTest.* = FAIL", ExpectationsParseErrorKind::UnknownTag("SWIFTSHADER".to_owned()); "unknown tag")]
    #[test_case("WIN : ClearTest.* = BROKEN", ExpectationsParseErrorKind::UnknownResult("BROKEN".to_owned()); "unknown result")]
    fn parse_errors(line: &str, expected: ExpectationsParseErrorKind) {
        let input = format!("# header\n{line}\n");
        let error = TestExpectations::parse(&input, linux_release()).expect_err("line is invalid");
        assert_eq!(error.line_number(), 2);
        assert_eq!(error.kind().to_string(), expected.to_string());
    }

    #[test]
    fn invalid_glob() {
        let error = TestExpectations::parse(": ClearTest.[ = FAIL", linux_release())
            .expect_err("unclosed class is invalid");
        assert!(matches!(
            error.kind(),
            ExpectationsParseErrorKind::InvalidGlob(_)
        ));
    }

    #[test_case(ExpectedResult::Fail, ResultKind::Failed, true)]
    #[test_case(ExpectedResult::Fail, ResultKind::CompileFailed, false)]
    #[test_case(ExpectedResult::Crash, ResultKind::CaptureFailed, true)]
    #[test_case(ExpectedResult::Crash, ResultKind::Failed, false)]
    #[test_case(ExpectedResult::CompileFail, ResultKind::CompileFailed, true)]
    #[test_case(ExpectedResult::CompileFail, ResultKind::ReplayFailed, false)]
    #[test_case(ExpectedResult::Timeout, ResultKind::TimedOut, false)]
    #[test_case(ExpectedResult::SkipForCapture, ResultKind::FailedToTrace, false)]
    #[test_case(ExpectedResult::Flaky, ResultKind::Failed, false)]
    #[test_case(ExpectedResult::Pass, ResultKind::Failed, false)]
    fn predicts(expected: ExpectedResult, kind: ResultKind, predicted: bool) {
        assert_eq!(expected.predicts(kind), predicted);
    }

    #[test]
    fn expected_result_round_trip() {
        for &variant in ExpectedResult::variants() {
            let parsed: ExpectedResult = variant.parse().expect("variant is valid");
            assert_eq!(parsed.as_str(), variant);
        }
    }

    proptest! {
        #[test]
        fn filter_is_idempotent(
            names in prop::collection::vec("(ClearTest|DrawTest|BlitTest|FenceTest)\\.[A-Za-z]{1,6}/ES[23]_(Vulkan|GL)", 0..16),
            include_normally_skipped in any::<bool>(),
            debug in any::<bool>(),
            asan in any::<bool>(),
        ) {
            let tags = ConfigTags::LINUX | ConfigTags::current(debug, asan);
            let expectations = TestExpectations::parse(EXPECTATIONS, tags).unwrap();
            let first = expectations.filter(names.iter().map(String::as_str), include_normally_skipped);
            let second = expectations.filter(names.iter().map(String::as_str), include_normally_skipped);
            prop_assert_eq!(first, second);
        }
    }
}
