// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracking every subprocess a worker starts.
//!
//! Each worker owns one [`ChildProcessesManager`]. Every subprocess goes through
//! [`ChildProcessesManager::run_subprocess`], which registers it in a live-process table for the
//! duration of the call so that [`ChildProcessesManager::kill_all`] can terminate it, and records
//! how long it took.

use crate::{
    config::GnArgValue,
    stopwatch::stopwatch,
    test_command::{ChildExit, CommandSpec, SubProcess},
};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::{Semaphore, SemaphorePermit, oneshot};

/// Limits how many build invocations (GN and ninja) run at once across all workers.
#[derive(Clone, Debug)]
pub struct BuildLock {
    semaphore: Arc<Semaphore>,
}

impl BuildLock {
    /// Creates a new lock that admits `max_concurrent` holders at once (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Waits for a slot, returning `None` if the lock has been closed.
    pub async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.semaphore.acquire().await.ok()
    }

    /// Closes the lock. Pending and future acquisitions return `None`.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Returns the number of free slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Cumulative wall-clock time spent in one command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandRuntime {
    /// The number of times the command was run.
    pub invocations: usize,
    /// The total time spent.
    pub total: Duration,
}

impl CommandRuntime {
    /// Adds `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        self.invocations += other.invocations;
        self.total += other.total;
    }
}

/// Build tool configuration for a [`ChildProcessesManager`].
#[derive(Clone, Debug)]
pub struct BuildTools {
    /// The directory GN and ninja run in.
    pub root: Utf8PathBuf,
    /// The GN executable.
    pub gn_command: String,
    /// The ninja-compatible build executable.
    pub ninja_command: String,
    /// Timeout for each GN or ninja invocation.
    pub timeout: Duration,
}

#[derive(Debug)]
struct LiveChild {
    command: String,
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
}

/// Tracks the live subprocesses of one worker.
#[derive(Debug)]
pub struct ChildProcessesManager {
    worker_id: usize,
    tools: BuildTools,
    build_lock: BuildLock,
    live: Mutex<HashMap<u64, LiveChild>>,
    next_token: AtomicU64,
    runtimes: Mutex<BTreeMap<String, CommandRuntime>>,
    killed: AtomicBool,
}

impl ChildProcessesManager {
    /// Creates a new manager for `worker_id`.
    pub fn new(worker_id: usize, tools: BuildTools, build_lock: BuildLock) -> Self {
        Self {
            worker_id,
            tools,
            build_lock,
            live: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            runtimes: Mutex::new(BTreeMap::new()),
            killed: AtomicBool::new(false),
        }
    }

    /// Returns the id of the worker that owns this manager.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Runs `spec` to completion or until `timeout` elapses.
    ///
    /// The subprocess is registered in the live-process table while it runs and is always
    /// removed before this returns, and before this future is dropped. A subprocess is never left
    /// running after this call.
    pub async fn run_subprocess(&self, spec: &CommandSpec, timeout: Duration) -> ChildExit {
        let command = spec.display();
        if self.is_killed() {
            return ChildExit::Killed {
                output: Bytes::new(),
            };
        }

        let watch = stopwatch();
        tracing::debug!(worker_id = self.worker_id, "running `{command}`");

        let process = match SubProcess::spawn(spec) {
            Ok(process) => process,
            Err(error) => {
                self.record_runtime(spec.basename(), watch.snapshot().duration);
                return ChildExit::ExecFailed {
                    message: error.to_string(),
                };
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.live_table().insert(
            token,
            LiveChild {
                command: command.clone(),
                pid: process.pid(),
                kill: kill_tx,
            },
        );
        let guard = LiveGuard {
            manager: self,
            token,
        };

        // kill_all may have drained the table between the check above and the insert.
        if self.is_killed() {
            guard.kill();
        }

        let exit = process.wait(timeout, kill_rx).await;
        drop(guard);

        let elapsed = watch.snapshot().duration;
        self.record_runtime(spec.basename(), elapsed);
        tracing::debug!(
            worker_id = self.worker_id,
            "`{command}` {exit} after {:.2}s",
            elapsed.as_secs_f64()
        );
        exit
    }

    /// Runs `gn gen` for `build_dir` with `args`.
    pub async fn run_gn_gen(
        &self,
        build_dir: &Utf8Path,
        args: &[(String, GnArgValue)],
    ) -> (CommandSpec, ChildExit) {
        let args = args
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .join(" ");
        let spec = CommandSpec::new(&self.tools.gn_command)
            .arg("gen")
            .arg(build_dir.as_str())
            .arg(format!("--args={args}"))
            .current_dir(&self.tools.root);
        let exit = self.run_build_step(&spec).await;
        (spec, exit)
    }

    /// Builds `target` in `build_dir`.
    pub async fn run_autoninja(
        &self,
        build_dir: &Utf8Path,
        target: &str,
    ) -> (CommandSpec, ChildExit) {
        let spec = CommandSpec::new(&self.tools.ninja_command)
            .arg("-C")
            .arg(build_dir.as_str())
            .arg(target)
            .current_dir(&self.tools.root);
        let exit = self.run_build_step(&spec).await;
        (spec, exit)
    }

    async fn run_build_step(&self, spec: &CommandSpec) -> ChildExit {
        let Some(_permit) = self.build_lock.acquire().await else {
            return ChildExit::Killed {
                output: Bytes::new(),
            };
        };
        self.run_subprocess(spec, self.tools.timeout).await
    }

    /// Kills every live subprocess, and makes future calls to [`Self::run_subprocess`] return
    /// [`ChildExit::Killed`] without starting anything.
    pub fn kill_all(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let children: Vec<_> = self.live_table().drain().map(|(_, child)| child).collect();
        for child in children {
            tracing::debug!(
                worker_id = self.worker_id,
                pid = child.pid,
                "killing `{}`",
                child.command
            );
            // The receiver is gone if the process finished in the meantime.
            _ = child.kill.send(());
        }
    }

    /// Returns true if [`Self::kill_all`] has been called.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Returns the number of subprocesses currently running.
    pub fn live_process_count(&self) -> usize {
        self.live_table().len()
    }

    /// Returns the cumulative runtime per command basename.
    pub fn runtimes(&self) -> BTreeMap<String, CommandRuntime> {
        self.runtimes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_runtime(&self, basename: &str, elapsed: Duration) {
        let mut runtimes = self.runtimes.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = runtimes.entry(basename.to_owned()).or_default();
        entry.invocations += 1;
        entry.total += elapsed;
    }

    fn live_table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, LiveChild>> {
        // The table is never left inconsistent by a panic, so poisoning can be ignored.
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a subprocess from the live table when dropped.
struct LiveGuard<'a> {
    manager: &'a ChildProcessesManager,
    token: u64,
}

impl LiveGuard<'_> {
    fn kill(&self) {
        if let Some(child) = self.manager.live_table().remove(&self.token) {
            _ = child.kill.send(());
        }
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.manager.live_table().remove(&self.token);
    }
}

/// Merges runtimes from several managers.
pub fn merge_runtimes<'a>(
    all: impl IntoIterator<Item = &'a BTreeMap<String, CommandRuntime>>,
) -> BTreeMap<String, CommandRuntime> {
    let mut merged: BTreeMap<String, CommandRuntime> = BTreeMap::new();
    for runtimes in all {
        for (command, runtime) in runtimes {
            merged.entry(command.clone()).or_default().merge(runtime);
        }
    }
    merged
}
