// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-readable progress and the final report.

use crate::{
    result::{ResultKind, RunSummary, TestFailure},
    runner::RunEvent,
};
use owo_colors::{OwoColorize, Style};
use std::{
    io::{self, Write},
    time::Duration,
};
use swrite::{SWrite, swrite};

/// Reporter options.
#[derive(Debug, Default)]
pub struct ReporterBuilder {
    verbose: bool,
    colorize: bool,
}

impl ReporterBuilder {
    /// Shows batch starts, the output of every failed group and per-command runtimes.
    pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
        self.verbose = verbose;
        self
    }

    /// Colorizes output.
    pub fn set_colorize(&mut self, colorize: bool) -> &mut Self {
        self.colorize = colorize;
        self
    }

    /// Creates a new reporter.
    pub fn build(&self) -> Reporter {
        let mut styles = Styles::default();
        if self.colorize {
            styles.colorize();
        }
        Reporter {
            styles,
            verbose: self.verbose,
            total_batches: 0,
            finished_batches: 0,
        }
    }
}

/// Writes progress and the final report.
#[derive(Debug)]
pub struct Reporter {
    styles: Styles,
    verbose: bool,
    total_batches: usize,
    finished_batches: usize,
}

impl Reporter {
    /// Writes a line for `event`, if it warrants one.
    pub fn report_event(&mut self, event: &RunEvent, writer: &mut dyn Write) -> io::Result<()> {
        match event {
            RunEvent::RunStarted {
                start_time,
                batch_count,
                test_count,
                worker_count,
            } => {
                self.total_batches = *batch_count;
                writeln!(writer, "------------")?;
                writeln!(
                    writer,
                    "{:>12} {} {} in {} {} across {} {} at {}",
                    "Starting".style(self.styles.pass),
                    test_count.style(self.styles.count),
                    plural::tests_str(*test_count),
                    batch_count.style(self.styles.count),
                    plural::batches_str(*batch_count),
                    worker_count.style(self.styles.count),
                    plural::workers_str(*worker_count),
                    start_time.format("%Y-%m-%d %H:%M:%S"),
                )?;
            }
            RunEvent::BatchStarted {
                worker_id,
                batch_index,
                test_count,
            } => {
                if self.verbose {
                    writeln!(
                        writer,
                        "{:>12} batch {} ({} {}) on worker {}",
                        "START".style(self.styles.pass),
                        batch_index.style(self.styles.count),
                        test_count,
                        plural::tests_str(*test_count),
                        worker_id,
                    )?;
                }
            }
            RunEvent::BatchFinished {
                worker_id,
                outcome,
                elapsed,
            } => {
                self.finished_batches += 1;
                let failed = outcome
                    .results
                    .iter()
                    .any(|result| result.kind.is_failure());
                let status = if outcome.cancelled {
                    "CANCELLED".style(self.styles.skip)
                } else if failed {
                    "FAIL".style(self.styles.fail)
                } else {
                    "PASS".style(self.styles.pass)
                };

                let mut counts = Vec::new();
                for kind in ResultKind::ALL {
                    let count: usize = outcome
                        .results
                        .iter()
                        .filter(|result| result.kind == kind)
                        .map(|result| result.tests.len())
                        .sum();
                    if count > 0 {
                        counts.push(format!(
                            "{} {}",
                            count.style(self.styles.count),
                            kind.style(self.styles.for_kind(kind))
                        ));
                    }
                }

                writeln!(
                    writer,
                    "{:>12} {}batch {} on worker {} [{}/{}]: {}",
                    status,
                    format_duration(*elapsed),
                    outcome.batch_index,
                    worker_id,
                    self.finished_batches,
                    self.total_batches,
                    counts.join(", "),
                )?;
            }
            RunEvent::CancelStarted { reason } => {
                writeln!(
                    writer,
                    "{:>12} due to {}, killing subprocesses",
                    "Canceling".style(self.styles.fail),
                    reason.style(self.styles.skip),
                )?;
            }
        }
        Ok(())
    }

    /// Writes the final report.
    pub fn write_summary(&self, summary: &RunSummary, writer: &mut dyn Write) -> io::Result<()> {
        for group in summary.groups() {
            if !group.kind.is_failure() {
                continue;
            }
            self.write_group_header(group.kind, &group.message, writer)?;
            for test in &group.tests {
                writeln!(writer, "    {test}")?;
            }
            // State mismatches carry a diff, which is the point of the report.
            if !group.output.is_empty() && (self.verbose || group.kind == ResultKind::Failed) {
                writeln!(writer, "{}", "  output:".style(self.styles.fail_output))?;
                writer.write_all(group.output.as_bytes())?;
                if !group.output.ends_with('\n') {
                    writeln!(writer)?;
                }
            }
        }

        writeln!(writer, "------------")?;
        let summary_style = if summary.is_success() {
            self.styles.pass
        } else {
            self.styles.fail
        };
        writeln!(
            writer,
            "{:>12} {}{} {} run: {}",
            "Summary".style(summary_style),
            format_duration(summary.elapsed()),
            summary.finished_count().style(self.styles.count),
            plural::tests_str(summary.finished_count()),
            self.summary_str(summary),
        )?;

        self.write_failure_list(
            "Unexpected failures",
            summary.unexpected_failures(),
            self.styles.fail,
            writer,
        )?;
        self.write_failure_list(
            "Expected failures",
            summary.expected_failures(),
            self.styles.skip,
            writer,
        )?;
        self.write_failure_list(
            "Flaky failures",
            summary.flaky_failures(),
            self.styles.skip,
            writer,
        )?;
        if !summary.unexpected_passes().is_empty() {
            writeln!(
                writer,
                "{:>12} expected to fail but passed:",
                "Passed".style(self.styles.skip)
            )?;
            for test in summary.unexpected_passes() {
                writeln!(writer, "    {test}")?;
            }
        }

        if !summary.excluded().is_empty() {
            let count = summary.excluded().len();
            writeln!(
                writer,
                "{:>12} {} {} excluded by the expectations file",
                "Excluded".style(self.styles.skip),
                count.style(self.styles.count),
                plural::tests_str(count),
            )?;
        }

        if self.verbose {
            self.write_runtimes(summary, writer)?;
        }

        if !summary.not_run().is_empty() {
            let not_run = summary.not_run().len();
            let total = not_run + summary.finished_count();
            writeln!(
                writer,
                "{}: {}/{} {} {} not run{}",
                "warning".style(self.styles.skip),
                not_run.style(self.styles.count),
                total.style(self.styles.count),
                plural::tests_plural_if(total != 1 || not_run != 1),
                plural::were_plural_if(total != 1 || not_run != 1),
                if summary.is_cancelled() {
                    " due to cancellation"
                } else {
                    ""
                },
            )?;
        }

        if !summary.duplicates().is_empty() {
            writeln!(
                writer,
                "{}: results were reported more than once for: {}",
                "warning".style(self.styles.skip),
                summary.duplicates().join(", "),
            )?;
        }

        Ok(())
    }

    fn summary_str(&self, summary: &RunSummary) -> String {
        let mut out = String::new();
        swrite!(
            out,
            "{} {}",
            summary.count(ResultKind::Passed).style(self.styles.count),
            "passed".style(self.styles.pass),
        );
        for kind in ResultKind::ALL {
            if kind == ResultKind::Passed {
                continue;
            }
            let count = summary.count(kind);
            if count > 0 {
                swrite!(
                    out,
                    ", {} {}",
                    count.style(self.styles.count),
                    kind_summary_str(kind).style(self.styles.for_kind(kind)),
                );
            }
        }
        out
    }

    fn write_group_header(
        &self,
        kind: ResultKind,
        message: &str,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        let header_style = self.styles.for_kind(kind);
        write!(writer, "\n{}", "--- ".style(header_style))?;
        write!(writer, "{}", kind.style(header_style))?;
        if !message.is_empty() {
            write!(writer, ": {message}")?;
        }
        writeln!(writer, "{}", " ---".style(header_style))
    }

    fn write_failure_list(
        &self,
        heading: &str,
        failures: &[TestFailure],
        style: Style,
        writer: &mut dyn Write,
    ) -> io::Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        writeln!(
            writer,
            "{} ({}):",
            heading.style(style),
            failures.len().style(self.styles.count)
        )?;
        for failure in failures {
            writeln!(
                writer,
                "{:>16} {}",
                failure.kind.style(self.styles.for_kind(failure.kind)),
                failure.name
            )?;
        }
        Ok(())
    }

    fn write_runtimes(&self, summary: &RunSummary, writer: &mut dyn Write) -> io::Result<()> {
        if summary.runtimes().is_empty() {
            return Ok(());
        }
        writeln!(writer, "{}", "Runtimes:".style(self.styles.count))?;
        for (command, runtime) in summary.runtimes() {
            writeln!(
                writer,
                "{:>20} {}{} {}",
                command,
                format_duration(runtime.total),
                runtime.invocations.style(self.styles.count),
                plural::invocations_str(runtime.invocations),
            )?;
        }
        Ok(())
    }
}

fn kind_summary_str(kind: ResultKind) -> &'static str {
    match kind {
        ResultKind::Passed => "passed",
        ResultKind::Failed => "failed",
        ResultKind::TimedOut => "timed out",
        ResultKind::CompileFailed => "failed to compile",
        ResultKind::CaptureFailed => "failed to capture",
        ResultKind::ReplayFailed => "failed to replay",
        ResultKind::Skipped => "skipped",
        ResultKind::FailedToTrace => "failed to trace",
    }
}

fn format_duration(duration: Duration) -> String {
    // * > means right-align.
    // * 8 is the number of characters to pad to.
    // * .3 means print three digits after the decimal point.
    format!("[{:>8.3?}s] ", duration.as_secs_f64())
}

#[derive(Clone, Debug, Default)]
struct Styles {
    count: Style,
    pass: Style,
    fail: Style,
    fail_output: Style,
    skip: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.count = Style::new().bold();
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.fail_output = Style::new().magenta();
        self.skip = Style::new().yellow().bold();
    }

    fn for_kind(&self, kind: ResultKind) -> Style {
        match kind {
            ResultKind::Passed => self.pass,
            ResultKind::Skipped => self.skip,
            _ => self.fail,
        }
    }
}

mod plural {
    pub(super) fn tests_str(count: usize) -> &'static str {
        tests_plural_if(count != 1)
    }

    pub(super) fn tests_plural_if(plural: bool) -> &'static str {
        if plural { "tests" } else { "test" }
    }

    pub(super) fn were_plural_if(plural: bool) -> &'static str {
        if plural { "were" } else { "was" }
    }

    pub(super) fn batches_str(count: usize) -> &'static str {
        if count == 1 { "batch" } else { "batches" }
    }

    pub(super) fn workers_str(count: usize) -> &'static str {
        if count == 1 { "worker" } else { "workers" }
    }

    pub(super) fn invocations_str(count: usize) -> &'static str {
        if count == 1 {
            "invocation"
        } else {
            "invocations"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        batch::BatchOutcome, child_manager::CommandRuntime, expectations::ExpectedResult,
        result::GroupedResult, runner::RunFinished,
    };
    use std::collections::BTreeMap;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    fn summary(cancelled: bool) -> RunSummary {
        let scheduled = names(&["A.a", "A.b", "A.c", "A.d", "A.e"]);
        let expected = BTreeMap::from([("A.c".to_owned(), ExpectedResult::Flaky)]);
        let results = vec![
            GroupedResult::new(ResultKind::Passed, "", "", names(&["A.a"])),
            GroupedResult::new(
                ResultKind::Failed,
                "captured and replayed state differ",
                "--- A_b_ContextCaptured1.json\n+++ A_b_ContextReplayed1.json\n",
                names(&["A.b"]),
            ),
            GroupedResult::new(
                ResultKind::CompileFailed,
                "`autoninja -C out/Replay1 capture_replay_tests` exited with code 1",
                "link error",
                names(&["A.c", "A.d"]),
            ),
        ];
        RunSummary::new(
            &scheduled,
            &names(&["Z.z"]),
            &expected,
            RunFinished {
                results,
                cancelled,
                elapsed: Duration::from_millis(1500),
                runtimes: BTreeMap::from([(
                    "autoninja".to_owned(),
                    CommandRuntime {
                        invocations: 2,
                        total: Duration::from_secs(3),
                    },
                )]),
            },
        )
    }

    fn render(verbose: bool, summary: &RunSummary) -> String {
        let reporter = ReporterBuilder::default().set_verbose(verbose).build();
        let mut out = Vec::new();
        reporter
            .write_summary(summary, &mut out)
            .expect("writing to a Vec succeeds");
        String::from_utf8(out).expect("valid UTF-8")
    }

    #[test]
    fn summary_lists_every_failure() {
        let summary = summary(false);
        let out = render(false, &summary);

        assert!(out.contains("--- Failed: captured and replayed state differ ---"), "{out}");
        assert!(out.contains("+++ A_b_ContextReplayed1.json"), "diffs always shown: {out}");
        assert!(!out.contains("link error"), "build output only shown when verbose: {out}");
        assert!(
            out.contains("4 tests run: 1 passed, 1 failed, 2 failed to compile"),
            "{out}"
        );
        assert!(out.contains("Unexpected failures (2):"), "{out}");
        assert!(out.contains("Flaky failures (1):"), "{out}");
        assert!(out.contains("1 test excluded by the expectations file"), "{out}");
        assert!(out.contains("warning: 1/5 tests were not run\n"), "{out}");
        assert!(!out.contains("Runtimes:"), "{out}");
    }

    #[test]
    fn verbose_summary() {
        let summary = summary(true);
        let out = render(true, &summary);
        assert!(out.contains("link error\n"), "{out}");
        assert!(out.contains("Runtimes:"), "{out}");
        assert!(out.contains("2 invocations"), "{out}");
        assert!(out.contains("not run due to cancellation"), "{out}");
    }

    #[test]
    fn batch_progress_line() {
        let mut reporter = ReporterBuilder::default().build();
        let mut out = Vec::new();
        reporter
            .report_event(
                &RunEvent::BatchFinished {
                    worker_id: 2,
                    outcome: BatchOutcome {
                        batch_index: 4,
                        results: vec![
                            GroupedResult::new(ResultKind::Passed, "", "", names(&["A.a", "A.b"])),
                            GroupedResult::new(ResultKind::Skipped, "", "", names(&["A.c"])),
                        ],
                        cancelled: false,
                    },
                    elapsed: Duration::from_secs(2),
                },
                &mut out,
            )
            .expect("writing to a Vec succeeds");
        let out = String::from_utf8(out).expect("valid UTF-8");
        assert_eq!(
            out,
            "        PASS [   2.000s] batch 4 on worker 2 [1/0]: 2 Passed, 1 Skipped\n"
        );
    }
}
