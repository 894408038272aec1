// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `capture-replay` command-line interface.
//!
//! `capture-replay run` captures ANGLE end-to-end tests in batches, builds each batch's traces into
//! a replay binary and checks that replaying reproduces the captured state. `capture-replay list`
//! shows which tests would run after the expectations file is applied.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::OutputWriter;
