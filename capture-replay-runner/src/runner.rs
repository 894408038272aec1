// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker pool that runs batches.
//!
//! Batches are put on a shared job queue up front. Each worker is a task that pulls one batch at a
//! time and sends its results to a single collector over a channel, so results arrive in
//! completion order. Workers share nothing else apart from the [`BuildLock`].

use crate::{
    batch::{BatchOutcome, TestBatch, WorkerContext},
    child_manager::{BuildLock, BuildTools, ChildProcessesManager, CommandRuntime, merge_runtimes},
    config::RunSettings,
    errors::{BuildTestSuiteError, ListTestsError, TestRunnerBuildError, TraceDirError},
    result::GroupedResult,
    signal::{ShutdownEvent, SignalHandler, SignalHandlerKind},
    stopwatch::stopwatch,
    test_list,
};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use chrono::{DateTime, Local};
use std::{collections::BTreeMap, io, sync::Arc, time::Duration};
use tokio::{
    runtime::Runtime,
    sync::{Mutex, mpsc, watch},
    task::JoinSet,
};

/// The id of the manager that runs setup commands outside the worker pool.
const MAIN_WORKER_ID: usize = 0;

/// An event reported while a run is in progress.
#[derive(Clone, Debug)]
pub enum RunEvent {
    /// The run started.
    RunStarted {
        /// When the run started.
        start_time: DateTime<Local>,
        /// The number of batches.
        batch_count: usize,
        /// The number of tests across all batches.
        test_count: usize,
        /// The number of workers.
        worker_count: usize,
    },

    /// A worker picked up a batch.
    BatchStarted {
        /// The worker id.
        worker_id: usize,
        /// The batch index.
        batch_index: usize,
        /// The number of tests in the batch.
        test_count: usize,
    },

    /// A worker finished a batch.
    BatchFinished {
        /// The worker id.
        worker_id: usize,
        /// What happened to the batch.
        outcome: BatchOutcome,
        /// How long the batch took.
        elapsed: Duration,
    },

    /// A signal was received and the run is being cancelled.
    CancelStarted {
        /// The signal.
        reason: ShutdownEvent,
    },
}

/// The raw results of a run, before aggregation into a
/// [`RunSummary`](crate::result::RunSummary).
#[derive(Clone, Debug, Default)]
pub struct RunFinished {
    /// Grouped results, in the order batches finished.
    pub results: Vec<GroupedResult>,
    /// True if the run was cancelled.
    pub cancelled: bool,
    /// How long the run took.
    pub elapsed: Duration,
    /// Cumulative runtime per command, across every worker.
    pub runtimes: BTreeMap<String, CommandRuntime>,
}

/// Test runner options.
#[derive(Debug, Default)]
pub struct TestRunnerBuilder {
    worker_count: Option<usize>,
}

impl TestRunnerBuilder {
    /// Overrides the number of workers from the settings.
    pub fn set_worker_count(&mut self, worker_count: usize) -> &mut Self {
        self.worker_count = Some(worker_count);
        self
    }

    /// Creates a new runner.
    pub fn build(
        self,
        mut settings: RunSettings,
        signal_handler: SignalHandlerKind,
    ) -> Result<TestRunner, TestRunnerBuildError> {
        if let Some(worker_count) = self.worker_count {
            settings.worker_count = worker_count;
        }
        settings.worker_count = settings.worker_count.max(1);

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("capture-replay-worker")
            .build()
            .map_err(TestRunnerBuildError::TokioRuntimeCreate)?;
        let _guard = runtime.enter();

        // signal_handler.build() must be called from within the guard.
        let signal_handler = signal_handler.build()?;

        let temp_dir = match &settings.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|error| TraceDirError::new(dir, error))?;
                TempDir::Configured(dir.clone())
            }
            None => TempDir::Owned(
                camino_tempfile::Builder::new()
                    .prefix("capture-replay-")
                    .tempdir()
                    .map_err(TestRunnerBuildError::TempDirCreate)?,
            ),
        };

        let build_lock = BuildLock::new(settings.max_ninja_jobs);
        let main_manager = Arc::new(ChildProcessesManager::new(
            MAIN_WORKER_ID,
            build_tools(&settings),
            build_lock.clone(),
        ));

        Ok(TestRunner {
            settings: Arc::new(settings),
            runtime,
            signal_handler,
            build_lock,
            main_manager,
            temp_dir,
        })
    }
}

fn build_tools(settings: &RunSettings) -> BuildTools {
    BuildTools {
        root: settings.root.clone(),
        gn_command: settings.gn_command.clone(),
        ninja_command: settings.ninja_command.clone(),
        timeout: settings.timeouts.build,
    }
}

#[derive(Debug)]
enum TempDir {
    Owned(Utf8TempDir),
    Configured(Utf8PathBuf),
}

impl TempDir {
    fn path(&self) -> &Utf8Path {
        match self {
            Self::Owned(dir) => dir.path(),
            Self::Configured(dir) => dir,
        }
    }
}

/// Runs setup commands and batches of tests.
///
/// Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner {
    settings: Arc<RunSettings>,
    runtime: Runtime,
    signal_handler: SignalHandler,
    build_lock: BuildLock,
    main_manager: Arc<ChildProcessesManager>,
    temp_dir: TempDir,
}

impl TestRunner {
    /// Returns the settings for this run.
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Returns the directory that holds trace files.
    pub fn temp_dir(&self) -> &Utf8Path {
        self.temp_dir.path()
    }

    /// Builds the test suite with GN and ninja.
    pub fn build_test_suite(&mut self) -> Result<(), BuildTestSuiteError> {
        let settings = self.settings.clone();
        let manager = self.main_manager.clone();
        self.block_on_cancellable(async move {
            let (spec, exit) = manager
                .run_gn_gen(&settings.build_dir, &settings.gn_args)
                .await;
            if !exit.is_success() {
                return Err(BuildTestSuiteError::new(spec.display(), exit));
            }
            let (spec, exit) = manager
                .run_autoninja(&settings.build_dir, &settings.test_suite)
                .await;
            if !exit.is_success() {
                return Err(BuildTestSuiteError::new(spec.display(), exit));
            }
            Ok(())
        })
    }

    /// Lists the tests in the capture binary that match `filter`.
    pub fn list_tests(&mut self, filter: &str) -> Result<Vec<String>, ListTestsError> {
        let settings = self.settings.clone();
        let manager = self.main_manager.clone();
        let filter = filter.to_owned();
        self.block_on_cancellable(async move {
            test_list::list_tests(&manager, &settings, &filter).await
        })
    }

    /// Runs `fut`, killing the main manager's subprocesses if a signal arrives.
    fn block_on_cancellable<T>(&mut self, fut: impl Future<Output = T>) -> T {
        let Self {
            runtime,
            signal_handler,
            main_manager,
            ..
        } = self;
        runtime.block_on(async {
            tokio::pin!(fut);
            let mut signals_done = false;
            loop {
                tokio::select! {
                    res = &mut fut => break res,
                    signal = signal_handler.recv(), if !signals_done => match signal {
                        Some(signal) => {
                            tracing::warn!("received {signal}, killing subprocesses");
                            main_manager.kill_all();
                        }
                        None => signals_done = true,
                    },
                }
            }
        })
    }

    /// Runs `batches` on the worker pool.
    ///
    /// The callback is called for each event, on the calling thread.
    pub fn execute<F>(self, batches: Vec<TestBatch>, mut callback: F) -> RunFinished
    where
        F: FnMut(&RunEvent),
    {
        let Self {
            settings,
            runtime,
            mut signal_handler,
            build_lock,
            main_manager,
            temp_dir,
        } = self;

        let managers: Vec<_> = (1..=settings.worker_count)
            .map(|worker_id| {
                Arc::new(ChildProcessesManager::new(
                    worker_id,
                    build_tools(&settings),
                    build_lock.clone(),
                ))
            })
            .collect();

        let watch = stopwatch();
        let (results, cancelled) = runtime.block_on(async {
            let test_count = batches.iter().map(|batch| batch.tests().len()).sum();
            callback(&RunEvent::RunStarted {
                start_time: watch.snapshot().start_time,
                batch_count: batches.len(),
                test_count,
                worker_count: managers.len(),
            });

            let (job_tx, job_rx) = mpsc::unbounded_channel();
            for batch in batches {
                // The receiver is held below, so this can't fail.
                _ = job_tx.send(batch);
            }
            drop(job_tx);
            let jobs = Arc::new(Mutex::new(job_rx));

            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            let (cancel_tx, cancel_rx) = watch::channel(false);

            let mut workers = JoinSet::new();
            for manager in &managers {
                let ctx = WorkerContext::new(
                    manager.worker_id(),
                    manager.clone(),
                    settings.clone(),
                    temp_dir.path(),
                );
                workers.spawn(worker_loop(
                    ctx,
                    jobs.clone(),
                    event_tx.clone(),
                    cancel_rx.clone(),
                ));
            }
            drop(event_tx);

            let mut results = Vec::new();
            let mut cancelled = false;
            let mut signals_done = false;
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        callback(&event);
                        if let RunEvent::BatchFinished { outcome, .. } = event {
                            cancelled |= outcome.cancelled;
                            results.extend(outcome.results);
                        }
                    }
                    signal = signal_handler.recv(), if !signals_done && !cancelled => {
                        match signal {
                            Some(reason) => {
                                cancelled = true;
                                callback(&RunEvent::CancelStarted { reason });
                                _ = cancel_tx.send(true);
                                build_lock.close();
                                for manager in &managers {
                                    manager.kill_all();
                                }
                            }
                            None => signals_done = true,
                        }
                    }
                }
            }

            while let Some(res) = workers.join_next().await {
                if let Err(error) = res {
                    tracing::error!("worker task failed: {error}");
                }
            }
            (results, cancelled)
        });

        // Subprocesses are killed on drop, so don't wait for their output pipes.
        runtime.shutdown_background();

        let runtimes = merge_runtimes(
            std::iter::once(main_manager.runtimes())
                .chain(managers.iter().map(|manager| manager.runtimes()))
                .collect::<Vec<_>>()
                .iter(),
        );

        clean_up(&settings, managers.len(), temp_dir);

        RunFinished {
            results,
            cancelled,
            elapsed: watch.snapshot().duration,
            runtimes,
        }
    }
}

async fn worker_loop(
    mut ctx: WorkerContext,
    jobs: Arc<Mutex<mpsc::UnboundedReceiver<TestBatch>>>,
    events: mpsc::UnboundedSender<RunEvent>,
    cancel: watch::Receiver<bool>,
) {
    let worker_id = ctx.worker_id();
    loop {
        if *cancel.borrow() {
            break;
        }
        // The queue is filled and closed before workers start, so this never waits on a producer.
        let Some(batch) = jobs.lock().await.recv().await else {
            break;
        };

        _ = events.send(RunEvent::BatchStarted {
            worker_id,
            batch_index: batch.batch_index(),
            test_count: batch.tests().len(),
        });
        let watch = stopwatch();
        let outcome = batch.run(&mut ctx).await;
        let cancelled = outcome.cancelled;
        _ = events.send(RunEvent::BatchFinished {
            worker_id,
            outcome,
            elapsed: watch.snapshot().duration,
        });
        if cancelled {
            break;
        }
    }
    tracing::debug!(worker_id, "worker finished");
}

fn clean_up(settings: &RunSettings, worker_count: usize, temp_dir: TempDir) {
    if settings.purge {
        for worker_id in 1..=worker_count {
            remove_dir(&settings.replay_build_dir(worker_id));
        }
    }

    match temp_dir {
        TempDir::Owned(dir) if settings.keep_temp_files => {
            #[allow(deprecated)]
            let path = dir.into_path();
            tracing::info!("trace files kept in `{path}`");
        }
        TempDir::Owned(dir) => {
            let path = dir.path().to_owned();
            if let Err(error) = dir.close() {
                tracing::warn!("failed to remove `{path}`: {error}");
            }
        }
        TempDir::Configured(dir) if settings.keep_temp_files => {
            tracing::info!("trace files kept in `{dir}`");
        }
        TempDir::Configured(dir) => {
            for worker_id in 1..=worker_count {
                remove_dir(&dir.join(format!("traces{worker_id}")));
                remove_file(&dir.join(format!("results{worker_id}.json")));
            }
        }
    }
}

fn remove_dir(path: &Utf8Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => tracing::debug!("removed `{path}`"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!("failed to remove `{path}`: {error}"),
    }
}

fn remove_file(path: &Utf8Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!("failed to remove `{path}`: {error}"),
    }
}
