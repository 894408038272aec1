// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by capture-replay.
//!
//! Failures that happen while processing an individual batch are not errors: they are turned
//! into [`GroupedResult`](crate::result::GroupedResult)s so that one bad batch can't stop a
//! worker. The types here cover setup and whole-run failures.

use crate::test_command::ChildExit;
use camino::Utf8PathBuf;
use config::ConfigError;
use std::fmt;
use thiserror::Error;

/// An error that occurred while parsing the config.
#[derive(Debug, Error)]
#[error("failed to parse capture-replay config at `{config_file}`")]
#[non_exhaustive]
pub struct ConfigParseError {
    config_file: Utf8PathBuf,
    #[source]
    err: Box<ConfigError>,
}

impl ConfigParseError {
    pub(crate) fn new(config_file: impl Into<Utf8PathBuf>, err: ConfigError) -> Self {
        Self {
            config_file: config_file.into(),
            err: Box::new(err),
        }
    }

    /// Returns the config file for this error.
    pub fn config_file(&self) -> &Utf8PathBuf {
        &self.config_file
    }
}

/// An error that occurred while reading or parsing an expectations file.
#[derive(Debug, Error)]
pub enum ExpectationsReadError {
    /// The file could not be read.
    #[error("failed to read expectations file `{path}`")]
    Read {
        /// The path that was read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The file was read but a line could not be parsed.
    #[error("failed to parse expectations file `{path}`")]
    Parse {
        /// The path that was read.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: ExpectationsParseError,
    },
}

/// An error that occurred while parsing a single expectations line.
#[derive(Debug, Error)]
#[error("invalid rule on line {line_number}: `{line}`")]
pub struct ExpectationsParseError {
    line_number: usize,
    line: String,
    #[source]
    kind: ExpectationsParseErrorKind,
}

impl ExpectationsParseError {
    pub(crate) fn new(
        line_number: usize,
        line: impl Into<String>,
        kind: ExpectationsParseErrorKind,
    ) -> Self {
        Self {
            line_number,
            line: line.into(),
            kind,
        }
    }

    /// The 1-based line number the error occurred on.
    pub fn line_number(&self) -> usize {
        self.line_number
    }

    /// The kind of error.
    pub fn kind(&self) -> &ExpectationsParseErrorKind {
        &self.kind
    }
}

/// The kind of error encountered while parsing an expectations line.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExpectationsParseErrorKind {
    /// The line is missing the `:` separating tags from the pattern.
    #[error("missing `:` after tags")]
    MissingColon,

    /// The line is missing the `=` separating the pattern from the result.
    #[error("missing `=` before result")]
    MissingEquals,

    /// The pattern is empty.
    #[error("empty test name pattern")]
    EmptyPattern,

    /// An unrecognized tag was found.
    #[error("unknown tag `{0}`")]
    UnknownTag(String),

    /// An unrecognized result was found.
    #[error("unknown result `{0}`")]
    UnknownResult(String),

    /// The pattern is not a valid glob.
    #[error("invalid test name pattern")]
    InvalidGlob(#[source] globset::Error),
}

/// Error returned while parsing an [`ExpectedResult`](crate::expectations::ExpectedResult).
#[derive(Clone, Debug, Error)]
#[error("unrecognized expectation result: {input}")]
pub struct ExpectedResultParseError {
    input: String,
}

impl ExpectedResultParseError {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }
}

/// An error that occurred while building the test suite before listing.
#[derive(Debug, Error)]
pub struct BuildTestSuiteError {
    command: String,
    exit: ChildExit,
}

impl BuildTestSuiteError {
    pub(crate) fn new(command: impl Into<String>, exit: ChildExit) -> Self {
        Self {
            command: command.into(),
            exit,
        }
    }

    /// The command that failed.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// How the command exited.
    pub fn exit(&self) -> &ChildExit {
        &self.exit
    }

    /// The combined output of the failed command.
    pub fn output(&self) -> std::borrow::Cow<'_, str> {
        self.exit.output_str()
    }
}

impl fmt::Display for BuildTestSuiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` {}", self.command, self.exit)
    }
}

/// An error that occurred while listing the tests in the capture binary.
#[derive(Debug, Error)]
pub enum ListTestsError {
    /// The capture binary didn't list tests successfully.
    #[error("`{command}` {exit}")]
    CommandFailed {
        /// The command that was run.
        command: String,
        /// How the command exited.
        exit: ChildExit,
    },

    /// The output was not recognized as a test list.
    #[error("`{command}` did not produce a recognizable test list")]
    NoTestsListed {
        /// The command that was run.
        command: String,
    },
}

/// An error that occurred while reading a capture results file.
#[derive(Debug, Error)]
pub enum ResultsFileError {
    /// The file could not be read.
    #[error("failed to read results file `{path}`")]
    Read {
        /// The path to the file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: std::io::Error,
    },

    /// The file could not be parsed.
    #[error("failed to parse results file `{path}`")]
    Parse {
        /// The path to the file.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        err: serde_json::Error,
    },
}

/// An error that occurred while writing the names manifest for a replay build.
#[derive(Debug, Error)]
#[error("failed to write names manifest `{path}`")]
pub struct ManifestWriteError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

impl ManifestWriteError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Self {
            path: path.into(),
            err,
        }
    }
}

/// An error that occurred while preparing a worker's trace or build directory.
#[derive(Debug, Error)]
#[error("failed to prepare directory `{path}`")]
pub struct TraceDirError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

impl TraceDirError {
    pub(crate) fn new(path: impl Into<Utf8PathBuf>, err: std::io::Error) -> Self {
        Self {
            path: path.into(),
            err,
        }
    }
}

/// An error that occurred while creating a [`TestRunner`](crate::runner::TestRunner).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TestRunnerBuildError {
    /// An error occurred while creating the Tokio runtime.
    #[error("error creating Tokio runtime")]
    TokioRuntimeCreate(#[source] std::io::Error),

    /// An error occurred while creating the temporary directory.
    #[error("error creating temporary directory")]
    TempDirCreate(#[source] std::io::Error),

    /// An error occurred while setting up the signal handler.
    #[error(transparent)]
    SignalHandlerSetup(#[from] SignalHandlerSetupError),

    /// An error occurred while creating a per-worker directory.
    #[error(transparent)]
    TraceDir(#[from] TraceDirError),
}

/// An error occurred while setting up the signal handler.
#[derive(Debug, Error)]
#[error("error setting up signal handler")]
pub struct SignalHandlerSetupError(#[from] std::io::Error);
