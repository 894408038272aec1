// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Machine-readable data exchanged between `capture-replay` and the programs around it.
//!
//! This crate contains:
//!
//! * the documented exit codes of the `capture-replay` binary, in [`CaptureReplayExitCode`]
//! * the schema of the JSON results file written by the capture binary through `--results-file`,
//!   in [`TestResultsFile`]
//! * the summary printed by `capture-replay list --message-format json`, in [`TestListSummary`]

mod exit_codes;
mod results_file;
mod test_list;

pub use exit_codes::*;
pub use results_file::*;
pub use test_list::*;
