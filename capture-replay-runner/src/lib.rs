// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for `capture-replay`, which checks that ANGLE's frame capture reproduces
//! the GL state of a test when the captured trace is compiled and replayed.
//!
//! The basic flow of a run:
//!
//! 1. Load [`config::CaptureReplayConfig`] and resolve it into [`config::RunSettings`].
//! 2. List the tests in the capture binary, and apply the
//!    [`expectations::TestExpectations`] file to get a [`test_list::TestList`].
//! 3. Partition the list into [`batch::TestBatch`]es and run them on the worker pool with
//!    [`runner::TestRunner::execute`].
//! 4. Aggregate the grouped results into a [`result::RunSummary`] and report it with
//!    [`reporter::Reporter`].

pub mod batch;
pub mod child_manager;
pub mod config;
pub mod errors;
pub mod expectations;
pub mod platform;
pub mod reporter;
pub mod result;
pub mod runner;
pub mod signal;
mod stopwatch;
pub mod test_command;
pub mod test_list;
