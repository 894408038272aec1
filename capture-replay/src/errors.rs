// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{NO_HEADING_TARGET, StderrStyles};
use camino::Utf8PathBuf;
use capture_replay_metadata::CaptureReplayExitCode;
use capture_replay_runner::errors::*;
use owo_colors::OwoColorize;
use std::{error::Error, path::PathBuf};
use thiserror::Error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

// Note that the #[error()] strings are mostly placeholder messages -- the expected way to print out
// errors is with the display_to_stderr method, which colorizes errors.

/// An error occurred in a program that capture-replay ran, or in its setup.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("could not determine the current directory")]
    CurrentDirFailed {
        #[source]
        err: std::io::Error,
    },
    #[error("root directory is not valid UTF-8")]
    RootNotUtf8 { path: PathBuf },
    #[error("config parse error")]
    ConfigParseError {
        #[from]
        err: ConfigParseError,
    },
    #[error("expectations read error")]
    ExpectationsReadError {
        #[from]
        err: ExpectationsReadError,
    },
    #[error("test runner build error")]
    TestRunnerBuildError {
        #[from]
        err: TestRunnerBuildError,
    },
    #[error("test suite build failed")]
    BuildTestSuiteError {
        #[from]
        err: BuildTestSuiteError,
    },
    #[error("error listing tests")]
    ListTestsError {
        #[from]
        err: ListTestsError,
    },
    #[error("error writing test list")]
    WriteTestListError {
        #[source]
        err: std::io::Error,
    },
    #[error("error serializing test list")]
    SerializeTestListError {
        #[source]
        err: serde_json::Error,
    },
    #[error("error writing event")]
    WriteEventError {
        #[source]
        err: std::io::Error,
    },
    #[error("error writing output file")]
    OutputFileWriteError {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::CurrentDirFailed { .. }
            | Self::RootNotUtf8 { .. }
            | Self::ConfigParseError { .. }
            | Self::ExpectationsReadError { .. }
            | Self::TestRunnerBuildError { .. } => CaptureReplayExitCode::SETUP_ERROR,
            Self::BuildTestSuiteError { err } => {
                if err.exit().is_killed() {
                    CaptureReplayExitCode::INTERRUPTED
                } else {
                    CaptureReplayExitCode::BUILD_FAILED
                }
            }
            Self::ListTestsError { err } => match err {
                ListTestsError::CommandFailed { exit, .. } if exit.is_killed() => {
                    CaptureReplayExitCode::INTERRUPTED
                }
                _ => CaptureReplayExitCode::TEST_LIST_CREATION_FAILED,
            },
            Self::WriteTestListError { .. }
            | Self::SerializeTestListError { .. }
            | Self::WriteEventError { .. }
            | Self::OutputFileWriteError { .. } => CaptureReplayExitCode::WRITE_OUTPUT_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match self {
            Self::CurrentDirFailed { err } => {
                tracing::error!("could not determine the current directory");
                Some(err as &dyn Error)
            }
            Self::RootNotUtf8 { path } => {
                tracing::error!(
                    "root directory `{}` is not valid UTF-8",
                    path.display().style(styles.bold)
                );
                None
            }
            Self::ConfigParseError { err } => {
                tracing::error!(
                    "failed to parse config at `{}`",
                    err.config_file().style(styles.bold)
                );
                err.source()
            }
            Self::ExpectationsReadError { err } => {
                tracing::error!("{err}");
                err.source()
            }
            Self::TestRunnerBuildError { err } => {
                tracing::error!("failed to set up the test run");
                Some(err as &dyn Error)
            }
            Self::BuildTestSuiteError { err } => {
                tracing::error!("failed to build the test suite");
                let output = err.output();
                if !output.is_empty() {
                    tracing::error!(target: NO_HEADING_TARGET, "{}", output.trim_end());
                }
                tracing::error!(
                    "`{}` {}",
                    err.command().style(styles.bold),
                    err.exit()
                );
                None
            }
            Self::ListTestsError { err } => {
                match err {
                    ListTestsError::CommandFailed { command, exit } => {
                        let output = exit.output_str();
                        if !output.is_empty() {
                            tracing::error!(target: NO_HEADING_TARGET, "{}", output.trim_end());
                        }
                        tracing::error!(
                            "failed to list tests: `{}` {exit}",
                            command.style(styles.bold)
                        );
                    }
                    ListTestsError::NoTestsListed { command } => {
                        tracing::error!(
                            "failed to list tests: output of `{}` is not a test list",
                            command.style(styles.bold)
                        );
                    }
                }
                None
            }
            Self::WriteTestListError { err } => {
                tracing::error!("failed to write test list to output");
                Some(err as &dyn Error)
            }
            Self::SerializeTestListError { err } => {
                tracing::error!("failed to serialize test list");
                Some(err as &dyn Error)
            }
            Self::WriteEventError { err } => {
                tracing::error!("failed to write event to output");
                Some(err as &dyn Error)
            }
            Self::OutputFileWriteError { path, err } => {
                tracing::error!(
                    "failed to write report to `{}`",
                    path.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            tracing::error!(target: NO_HEADING_TARGET, "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
