// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::Result,
    output::{OutputContext, OutputOpts, OutputWriter, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use capture_replay_runner::{
    config::{CaptureConfig, CaptureReplayConfig, ConfigOverrides},
    expectations::TestExpectations,
    reporter::ReporterBuilder,
    result::RunSummary,
    runner::{TestRunner, TestRunnerBuilder},
    signal::SignalHandlerKind,
    test_list::TestList,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use itertools::Itertools;
use owo_colors::{OwoColorize, Style, style};
use std::{io::Write, num::NonZeroUsize};
use supports_color::Stream;

/// Checks that ANGLE's frame capture reproduces the state of end-to-end tests.
///
/// Tests are captured in batches; each batch's traces are compiled into a replay binary, and
/// every test is replayed and compared against the state serialized during capture.
#[derive(Debug, Parser)]
#[command(version, name = "capture-replay", styles = clap_styles::style())]
pub struct CaptureReplayApp {
    /// Root directory of the checkout [default: current directory]
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<Utf8PathBuf>,

    #[command(flatten)]
    output: OutputOpts,

    #[command(flatten)]
    config_opts: ConfigOpts,

    #[command(subcommand)]
    command: Command,
}

impl CaptureReplayApp {
    /// Initializes logging and returns the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext, output_writer: &mut OutputWriter) -> Result<i32> {
        let root = match self.root {
            Some(root) => root,
            None => current_dir()?,
        };
        let config = self.config_opts.make_config(&root)?;

        match self.command {
            Command::List {
                selection,
                message_format,
            } => {
                let app = App::new(root, config, selection, ConfigOverrides::default())?;
                app.exec_list(message_format, output, output_writer)
            }
            Command::Run {
                selection,
                run_opts,
            } => {
                let overrides = run_opts.to_overrides();
                let app = App::new(root, config, selection, overrides)?;
                app.exec_run(&run_opts, output, output_writer)
            }
        }
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let dir = std::env::current_dir().map_err(|err| ExpectedError::CurrentDirFailed { err })?;
    Utf8PathBuf::try_from(dir).map_err(|err| ExpectedError::RootNotUtf8 {
        path: err.into_path_buf(),
    })
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Config file [default: <root>/.config/capture-replay.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,
}

impl ConfigOpts {
    fn make_config(&self, root: &Utf8Path) -> Result<CaptureReplayConfig> {
        let config =
            CaptureReplayConfig::from_sources(root, self.config_file.as_deref(), |path, unknown| {
                tracing::warn!(
                    "ignoring unknown configuration keys in `{path}`: {}",
                    unknown.iter().join(", ")
                );
            })?;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the tests that would be captured and replayed
    ///
    /// This command optionally builds the test suite, queries it for tests matching the filter and
    /// applies the expectations file. Use --message-format json to get machine-readable output.
    List {
        #[command(flatten)]
        selection: TestSelectionOpts,

        /// Output format
        #[arg(
            short = 'T',
            long,
            value_enum,
            default_value_t,
            help_heading = "OUTPUT OPTIONS",
            value_name = "FMT"
        )]
        message_format: MessageFormatOpts,
    },

    /// Capture, build and replay tests
    ///
    /// Tests are partitioned into batches that run on a pool of workers. Each worker captures its
    /// batch, builds a replay binary from the traces and replays every test in it.
    Run {
        #[command(flatten)]
        selection: TestSelectionOpts,

        #[command(flatten)]
        run_opts: RunOpts,
    },
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum MessageFormatOpts {
    #[default]
    Human,
    Json,
    JsonPretty,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "TEST SELECTION")]
struct TestSelectionOpts {
    /// Only run tests matching this gtest filter
    #[arg(long, default_value = "*", value_name = "FILTER")]
    gtest_filter: String,

    /// Expectations file, relative to the root [default: from config]
    #[arg(long, value_name = "PATH")]
    expectations_file: Option<Utf8PathBuf>,

    /// Also run tests that the expectations file skips
    #[arg(long)]
    also_run_skipped_for_capture_tests: bool,

    /// Build directory, relative to the root [default: from config]
    #[arg(long, value_name = "DIR", help_heading = "BUILD OPTIONS")]
    build_dir: Option<Utf8PathBuf>,

    /// Test suite to capture [default: from config]
    #[arg(long, value_name = "TARGET", help_heading = "BUILD OPTIONS")]
    test_suite: Option<String>,

    /// Don't build the test suite before listing tests
    #[arg(long, help_heading = "BUILD OPTIONS")]
    no_build: bool,

    /// Use a debug build
    #[arg(long, help_heading = "BUILD OPTIONS")]
    debug: bool,

    /// Use an ASan build
    #[arg(long, help_heading = "BUILD OPTIONS")]
    asan: bool,
}

impl TestSelectionOpts {
    fn apply_to(&self, overrides: &mut ConfigOverrides) {
        overrides.build_dir.clone_from(&self.build_dir);
        overrides.test_suite.clone_from(&self.test_suite);
        overrides
            .expectations_file
            .clone_from(&self.expectations_file);
        overrides.debug = self.debug;
        overrides.asan = self.asan;
    }
}

#[derive(Debug, Args)]
#[command(next_help_heading = "RUNNER OPTIONS")]
struct RunOpts {
    /// Maximum number of tests in a batch [default: from config]
    #[arg(long, value_name = "N")]
    batch_count: Option<NonZeroUsize>,

    /// Maximum number of workers [default: from config, capped at the CPU count]
    #[arg(long, short = 'j', value_name = "N")]
    max_jobs: Option<NonZeroUsize>,

    /// Maximum number of concurrent builds across workers [default: from config]
    #[arg(long, value_name = "N")]
    max_ninja_jobs: Option<NonZeroUsize>,

    /// Capture only frame N, starting mid-execution (0 disables)
    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u32)
            .range(..=i64::from(CaptureConfig::MAX_MID_EXECUTION_CAPTURE)),
    )]
    mec: Option<u32>,

    /// Directory for trace files [default: a fresh temporary directory]
    #[arg(long, value_name = "DIR")]
    temp_dir: Option<Utf8PathBuf>,

    /// Keep trace files after the run
    #[arg(long)]
    keep_temp_files: bool,

    /// Delete the per-worker replay build directories after the run
    #[arg(long)]
    purge: bool,

    /// Also write the final report to this file
    #[arg(long, value_name = "PATH", help_heading = "REPORTER OPTIONS")]
    output_to_file: Option<Utf8PathBuf>,
}

impl RunOpts {
    fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            temp_dir: self.temp_dir.clone(),
            batch_count: self.batch_count,
            max_jobs: self.max_jobs,
            max_ninja_jobs: self.max_ninja_jobs,
            mid_execution_capture: self.mec,
            keep_temp_files: self.keep_temp_files,
            purge: self.purge,
            ..ConfigOverrides::default()
        }
    }
}

struct App {
    root: Utf8PathBuf,
    config: CaptureReplayConfig,
    expectations: TestExpectations,
    selection: TestSelectionOpts,
}

impl App {
    fn new(
        root: Utf8PathBuf,
        mut config: CaptureReplayConfig,
        selection: TestSelectionOpts,
        mut overrides: ConfigOverrides,
    ) -> Result<Self> {
        selection.apply_to(&mut overrides);
        config.apply_overrides(overrides);

        let expectations = match config.expectations_file() {
            Some(path) => TestExpectations::from_path(&root.join(path), config.config_tags())?,
            None => TestExpectations::empty(config.config_tags()),
        };
        tracing::debug!(
            "{} expectation rules, config tags {}",
            expectations.rules().len(),
            expectations.config_tags()
        );

        Ok(Self {
            root,
            config,
            expectations,
            selection,
        })
    }

    /// Creates the runner, optionally builds the test suite and lists tests.
    fn build_test_list(&self) -> Result<(TestRunner, TestList)> {
        let settings = self.config.resolve(&self.root);
        let mut runner =
            TestRunnerBuilder::default().build(settings, SignalHandlerKind::Standard)?;

        if self.selection.no_build {
            tracing::debug!("skipping the test suite build");
        } else {
            runner.build_test_suite()?;
        }

        let listed = runner.list_tests(&self.selection.gtest_filter)?;
        let test_list = TestList::new(
            listed,
            &self.expectations,
            self.selection.also_run_skipped_for_capture_tests,
        );
        Ok((runner, test_list))
    }

    fn exec_list(
        &self,
        message_format: MessageFormatOpts,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let (_runner, test_list) = self.build_test_list()?;

        let mut writer = output_writer.stdout_writer();
        match message_format {
            MessageFormatOpts::Human => {
                let colorize = output.color.should_colorize(Stream::Stdout);
                write_human_list(&test_list, colorize, &mut writer)
                    .map_err(|err| ExpectedError::WriteTestListError { err })?;
            }
            MessageFormatOpts::Json => {
                serde_json::to_writer(&mut writer, &test_list.to_summary())
                    .map_err(|err| ExpectedError::SerializeTestListError { err })?;
                writeln!(writer).map_err(|err| ExpectedError::WriteTestListError { err })?;
            }
            MessageFormatOpts::JsonPretty => {
                serde_json::to_writer_pretty(&mut writer, &test_list.to_summary())
                    .map_err(|err| ExpectedError::SerializeTestListError { err })?;
                writeln!(writer).map_err(|err| ExpectedError::WriteTestListError { err })?;
            }
        }
        writer
            .flush()
            .map_err(|err| ExpectedError::WriteTestListError { err })?;

        Ok(0)
    }

    fn exec_run(
        &self,
        run_opts: &RunOpts,
        output: OutputContext,
        output_writer: &mut OutputWriter,
    ) -> Result<i32> {
        let (runner, test_list) = self.build_test_list()?;
        if !test_list.excluded().is_empty() {
            tracing::info!(
                "{} tests excluded by the expectations file",
                test_list.excluded().len()
            );
        }

        let batches = test_list.partition(self.config.batch_count());
        let mut reporter = ReporterBuilder::default()
            .set_verbose(output.verbose)
            .set_colorize(output.color.should_colorize(Stream::Stderr))
            .build();

        let mut stderr = output_writer.stderr_writer();
        let mut write_error = None;
        let finished = runner.execute(batches, |event| {
            if write_error.is_some() {
                return;
            }
            if let Err(err) = reporter
                .report_event(event, &mut stderr)
                .and_then(|()| stderr.flush())
            {
                write_error = Some(err);
            }
        });
        drop(stderr);
        if let Some(err) = write_error {
            return Err(ExpectedError::WriteEventError { err });
        }

        let summary = RunSummary::new(
            &test_list.scheduled_names(),
            test_list.excluded(),
            test_list.expected_results(),
            finished,
        );

        let mut stdout = output_writer.stdout_writer();
        ReporterBuilder::default()
            .set_verbose(output.verbose)
            .set_colorize(output.color.should_colorize(Stream::Stdout))
            .build()
            .write_summary(&summary, &mut stdout)
            .and_then(|()| stdout.flush())
            .map_err(|err| ExpectedError::WriteEventError { err })?;

        if let Some(path) = &run_opts.output_to_file {
            let mut report = Vec::new();
            ReporterBuilder::default()
                .set_verbose(output.verbose)
                .build()
                .write_summary(&summary, &mut report)
                .and_then(|()| std::fs::write(path, report))
                .map_err(|err| ExpectedError::OutputFileWriteError {
                    path: path.clone(),
                    err,
                })?;
            tracing::debug!("wrote report to `{path}`");
        }

        Ok(summary.exit_code())
    }
}

#[derive(Debug, Default)]
struct ListStyles {
    name: Style,
    expectation: Style,
    excluded: Style,
    count: Style,
}

impl ListStyles {
    fn colorize(&mut self) {
        self.name = style().bold();
        self.expectation = style().magenta();
        self.excluded = style().yellow();
        self.count = style().bold();
    }
}

fn write_human_list(
    test_list: &TestList,
    colorize: bool,
    writer: &mut dyn Write,
) -> std::io::Result<()> {
    let mut styles = ListStyles::default();
    if colorize {
        styles.colorize();
    }

    let summary = test_list.to_summary();
    for test in &summary.tests {
        write!(writer, "{}", test.name.style(styles.name))?;
        if let Some(expectation) = &test.expectation {
            write!(writer, " [{}]", expectation.style(styles.expectation))?;
        }
        if test.excluded {
            write!(writer, " {}", "(excluded)".style(styles.excluded))?;
        } else if test.run_alone {
            write!(writer, " {}", "(runs alone)".style(styles.excluded))?;
        }
        writeln!(writer)?;
    }

    writeln!(
        writer,
        "{} tests listed, {} will run",
        summary.tests.len().style(styles.count),
        summary.run_count.style(styles.count),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Color;
    use capture_replay_metadata::TestListSummary;
    use capture_replay_runner::platform::ConfigTags;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn verify_app() {
        CaptureReplayApp::command().debug_assert();
    }

    #[test]
    fn run_options() {
        let app = CaptureReplayApp::try_parse_from([
            "capture-replay",
            "run",
            "--gtest-filter",
            "ClearTest.*",
            "--batch-count",
            "4",
            "-j",
            "2",
            "--mec",
            "3",
            "--keep-temp-files",
            "--debug",
        ])
        .expect("arguments are valid");

        let Command::Run {
            selection,
            run_opts,
        } = app.command
        else {
            panic!("expected run command");
        };
        assert_eq!(selection.gtest_filter, "ClearTest.*");
        assert!(selection.debug);

        let mut overrides = run_opts.to_overrides();
        selection.apply_to(&mut overrides);
        assert_eq!(overrides.batch_count, NonZeroUsize::new(4));
        assert_eq!(overrides.max_jobs, NonZeroUsize::new(2));
        assert_eq!(overrides.mid_execution_capture, Some(3));
        assert!(overrides.keep_temp_files);
        assert!(overrides.debug);
        assert!(!overrides.purge);
    }

    #[test]
    fn zero_batch_count_is_rejected() {
        CaptureReplayApp::try_parse_from(["capture-replay", "run", "--batch-count", "0"])
            .expect_err("batch count must be nonzero");
    }

    #[test]
    fn last_frame_mec_is_rejected() {
        CaptureReplayApp::try_parse_from(["capture-replay", "run", "--mec", "4294967295"])
            .expect_err("capture would end past the last frame");
        CaptureReplayApp::try_parse_from(["capture-replay", "run", "--mec", "4294967294"])
            .expect("largest frame is accepted");
    }

    #[test]
    fn list_defaults() {
        let app = CaptureReplayApp::try_parse_from(["capture-replay", "list"])
            .expect("arguments are valid");
        let Command::List {
            selection,
            message_format,
        } = app.command
        else {
            panic!("expected list command");
        };
        assert_eq!(selection.gtest_filter, "*");
        assert!(!selection.also_run_skipped_for_capture_tests);
        assert!(matches!(message_format, MessageFormatOpts::Human));
    }

    #[test]
    fn human_list() {
        let expectations = TestExpectations::parse(
            ": Suite.Skipped = SKIP\n: Suite.Broken = COMPILE_FAIL\n",
            ConfigTags::empty(),
        )
        .expect("expectations are valid");
        let listed = ["Suite.A", "Suite.Skipped", "Suite.Broken"]
            .map(str::to_owned)
            .to_vec();
        let test_list = TestList::new(listed, &expectations, false);

        let mut out = Vec::new();
        write_human_list(&test_list, false, &mut out).expect("writing to a Vec succeeds");
        assert_eq!(
            String::from_utf8(out).expect("output is UTF-8"),
            "Suite.A\n\
             Suite.Skipped [SKIP] (excluded)\n\
             Suite.Broken [COMPILE_FAIL] (runs alone)\n\
             3 tests listed, 2 will run\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn list_json_without_build() {
        use std::os::unix::fs::PermissionsExt;

        let root = camino_tempfile::tempdir().expect("tempdir created");
        let build_dir = root.path().join("out");
        std::fs::create_dir_all(&build_dir).expect("build dir created");
        let exe = build_dir.join("fake_tests");
        std::fs::write(
            &exe,
            "#!/bin/sh\necho 'Tests list:'\necho Suite.A\necho Suite.B\necho 'End tests list.'\n",
        )
        .expect("script written");
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755))
            .expect("permissions set");
        std::fs::write(
            root.path().join("expectations.txt"),
            ": Suite.B = SKIP_FOR_CAPTURE\n",
        )
        .expect("expectations written");

        let app = CaptureReplayApp::try_parse_from([
            "capture-replay",
            "--root",
            root.path().as_str(),
            "list",
            "--no-build",
            "--build-dir",
            "out",
            "--test-suite",
            "fake_tests",
            "--expectations-file",
            "expectations.txt",
            "--message-format",
            "json",
        ])
        .expect("arguments are valid");
        let output = OutputContext {
            verbose: false,
            color: Color::Never,
        };
        let mut writer = OutputWriter::Test {
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let code = app.exec(output, &mut writer).expect("listing succeeds");
        assert_eq!(code, 0);

        let OutputWriter::Test { stdout, .. } = writer else {
            unreachable!("writer is a test writer");
        };
        let summary: TestListSummary =
            serde_json::from_slice(&stdout).expect("output is a test list summary");
        assert_eq!(summary.run_count, 1);
        assert_eq!(summary.tests.len(), 2);
        assert!(!summary.tests[0].excluded);
        assert!(summary.tests[1].excluded);
        assert_eq!(
            summary.tests[1].expectation.as_deref(),
            Some("SKIP_FOR_CAPTURE")
        );
    }
}
