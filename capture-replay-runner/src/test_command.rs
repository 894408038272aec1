// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spawning a single subprocess, collecting its output, and enforcing a timeout.

use bytes::{Bytes, BytesMut};
use camino::{Utf8Path, Utf8PathBuf};
use std::{borrow::Cow, fmt, io, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, ChildStderr, ChildStdout},
    sync::oneshot,
};

/// The size of each buffered reader's buffer.
const CHUNK_SIZE: usize = 4 * 1024;

/// How long to keep reading output after the process has exited or been killed.
///
/// A grandchild process may inherit the pipes and keep them open long after the direct child is
/// gone.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A command to run: program, arguments, extra environment and working directory.
///
/// Commands are always executed directly, never through a shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    cwd: Option<Utf8PathBuf>,
}

impl CommandSpec {
    /// Creates a new command for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child, on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets several environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, cwd: impl Into<Utf8PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Returns the program.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Returns the arguments.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Returns the extra environment variables.
    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Returns the working directory, if set.
    pub fn get_current_dir(&self) -> Option<&Utf8Path> {
        self.cwd.as_deref()
    }

    /// Returns the file name of the program, used to aggregate runtimes.
    pub fn basename(&self) -> &str {
        Utf8Path::new(&self.program)
            .file_name()
            .unwrap_or(&self.program)
    }

    /// Returns the command line, quoted so that it can be pasted into a shell.
    pub fn display(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(&self.args))
    }

    fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// How a subprocess ended.
#[derive(Clone)]
pub enum ChildExit {
    /// The process exited on its own.
    Exited {
        /// The exit code, or `None` if the process was terminated by a signal.
        code: Option<i32>,
        /// Combined stdout and stderr.
        output: Bytes,
    },

    /// The timeout elapsed and the process was killed.
    TimedOut {
        /// Output collected before the process was killed.
        output: Bytes,
    },

    /// The process was killed on request.
    Killed {
        /// Output collected before the process was killed.
        output: Bytes,
    },

    /// The process could not be started.
    ExecFailed {
        /// A description of the error.
        message: String,
    },
}

impl ChildExit {
    /// Returns true if the process exited with code 0.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0), .. })
    }

    /// Returns the exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => *code,
            _ => None,
        }
    }

    /// Returns true if the process was killed because the timeout elapsed.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Returns true if the process was killed on request.
    pub fn is_killed(&self) -> bool {
        matches!(self, Self::Killed { .. })
    }

    /// Returns the raw output.
    pub fn output(&self) -> &[u8] {
        match self {
            Self::Exited { output, .. } | Self::TimedOut { output } | Self::Killed { output } => {
                output
            }
            Self::ExecFailed { message } => message.as_bytes(),
        }
    }

    /// Returns the output as a string, with invalid UTF-8 replaced.
    pub fn output_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.output())
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited {
                code: Some(code), ..
            } => write!(f, "exited with code {code}"),
            Self::Exited { code: None, .. } => write!(f, "was terminated by a signal"),
            Self::TimedOut { .. } => write!(f, "timed out"),
            Self::Killed { .. } => write!(f, "was killed"),
            Self::ExecFailed { message } => write!(f, "failed to execute: {message}"),
        }
    }
}

impl fmt::Debug for ChildExit {
    // Output can be large, so only print its length.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code, output } => f
                .debug_struct("Exited")
                .field("code", code)
                .field("output_len", &output.len())
                .finish(),
            Self::TimedOut { output } => f
                .debug_struct("TimedOut")
                .field("output_len", &output.len())
                .finish(),
            Self::Killed { output } => f
                .debug_struct("Killed")
                .field("output_len", &output.len())
                .finish(),
            Self::ExecFailed { message } => f
                .debug_struct("ExecFailed")
                .field("message", message)
                .finish(),
        }
    }
}

/// A running subprocess.
///
/// The process is killed if this is dropped before [`Self::wait`] completes.
pub struct SubProcess {
    child: Child,
    fds: ChildFds,
}

impl SubProcess {
    /// Spawns the command, with stdin closed and stdout and stderr captured.
    pub fn spawn(spec: &CommandSpec) -> io::Result<Self> {
        let mut child = spec.to_command().spawn()?;
        let fds = ChildFds {
            stdout: child.stdout.take().map(FusedBufReader::new),
            stderr: child.stderr.take().map(FusedBufReader::new),
        };
        Ok(Self { child, fds })
    }

    /// Returns the OS process id, or `None` if the process has already been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the process to exit, collecting its output.
    ///
    /// The process is killed if `timeout` elapses or a message arrives on `kill`. Dropping the
    /// sender half of `kill` without sending does not kill the process. When this returns, the
    /// process has exited or been killed and reaped.
    pub async fn wait(self, timeout: Duration, mut kill: oneshot::Receiver<()>) -> ChildExit {
        let Self { mut child, mut fds } = self;
        let mut acc = BytesMut::with_capacity(CHUNK_SIZE);
        let mut kill_armed = true;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let stop = loop {
            tokio::select! {
                () = fds.fill_buf(&mut acc), if !fds.is_done() => {}
                res = child.wait() => break Stop::Exited(res),
                () = &mut deadline => break Stop::TimedOut,
                res = &mut kill, if kill_armed => match res {
                    Ok(()) => break Stop::Killed,
                    Err(_) => kill_armed = false,
                },
            }
        };

        if matches!(stop, Stop::TimedOut | Stop::Killed) {
            if let Err(error) = child.kill().await {
                tracing::debug!("error killing child process: {error}");
            }
        }

        if tokio::time::timeout(DRAIN_TIMEOUT, fds.drain(&mut acc))
            .await
            .is_err()
        {
            tracing::debug!("output pipes still open after process exit, giving up on them");
        }
        let output = acc.freeze();

        match stop {
            Stop::TimedOut => ChildExit::TimedOut { output },
            Stop::Killed => ChildExit::Killed { output },
            Stop::Exited(Ok(status)) => ChildExit::Exited {
                code: status.code(),
                output,
            },
            Stop::Exited(Err(error)) => ChildExit::ExecFailed {
                message: format!("error waiting for process: {error}"),
            },
        }
    }

    /// Spawns `spec` and waits for it, turning a spawn failure into [`ChildExit::ExecFailed`].
    pub async fn run(
        spec: &CommandSpec,
        timeout: Duration,
        kill: oneshot::Receiver<()>,
    ) -> ChildExit {
        match Self::spawn(spec) {
            Ok(process) => process.wait(timeout, kill).await,
            Err(error) => ChildExit::ExecFailed {
                message: error.to_string(),
            },
        }
    }
}

enum Stop {
    Exited(io::Result<std::process::ExitStatus>),
    TimedOut,
    Killed,
}

/// The child's stdout and stderr, read into a single buffer in arrival order.
struct ChildFds {
    stdout: Option<FusedBufReader<ChildStdout>>,
    stderr: Option<FusedBufReader<ChildStderr>>,
}

impl ChildFds {
    fn is_done(&self) -> bool {
        is_done_opt(&self.stdout) && is_done_opt(&self.stderr)
    }

    /// Reads whatever is available on either pipe. Cancel-safe.
    async fn fill_buf(&mut self, acc: &mut BytesMut) {
        // Wait until either of these make progress.
        let res = tokio::select! {
            res = fill_buf_opt(self.stdout.as_mut()), if !is_done_opt(&self.stdout) => res,
            res = fill_buf_opt(self.stderr.as_mut()), if !is_done_opt(&self.stderr) => res,
            else => Ok(Bytes::new()),
        };
        match res {
            Ok(chunk) => acc.extend_from_slice(&chunk),
            Err(error) => tracing::debug!("error reading child output: {error}"),
        }
    }

    async fn drain(&mut self, acc: &mut BytesMut) {
        while !self.is_done() {
            self.fill_buf(acc).await;
        }
    }
}

/// A `BufReader` over an `AsyncRead` that tracks whether it has hit EOF or an error.
struct FusedBufReader<R> {
    reader: BufReader<R>,
    done: bool,
}

impl<R: AsyncRead + Unpin> FusedBufReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(CHUNK_SIZE, reader),
            done: false,
        }
    }

    /// Returns the next chunk of output, or an empty chunk at EOF.
    async fn fill_buf(&mut self) -> io::Result<Bytes> {
        if self.done {
            return Ok(Bytes::new());
        }

        match self.reader.fill_buf().await {
            Ok(buf) => {
                if buf.is_empty() {
                    self.done = true;
                }
                let chunk = Bytes::copy_from_slice(buf);
                self.reader.consume(chunk.len());
                Ok(chunk)
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

async fn fill_buf_opt<R: AsyncRead + Unpin>(
    reader: Option<&mut FusedBufReader<R>>,
) -> io::Result<Bytes> {
    match reader {
        Some(reader) => reader.fill_buf().await,
        None => Ok(Bytes::new()),
    }
}

fn is_done_opt<R: AsyncRead + Unpin>(reader: &Option<FusedBufReader<R>>) -> bool {
    reader.as_ref().is_none_or(|r| r.is_done())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn display_and_basename() {
        let spec = CommandSpec::new("/opt/out/angle_end2end_tests")
            .arg("--gtest_filter=ClearTest.*")
            .arg("--label with space");
        assert_eq!(spec.basename(), "angle_end2end_tests");
        assert_eq!(
            spec.display(),
            "/opt/out/angle_end2end_tests '--gtest_filter=ClearTest.*' '--label with space'"
        );

        let spec = CommandSpec::new("gn");
        assert_eq!(spec.basename(), "gn");
    }

    #[test]
    fn exit_display() {
        let exit = ChildExit::Exited {
            code: Some(3),
            output: Bytes::from_static(b"boom"),
        };
        assert_eq!(exit.to_string(), "exited with code 3");
        assert_eq!(exit.output_str(), "boom");
        assert!(!exit.is_success());
        assert_eq!(exit.code(), Some(3));
        assert_eq!(
            ChildExit::TimedOut {
                output: Bytes::new()
            }
            .to_string(),
            "timed out"
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use pretty_assertions::assert_eq;

        fn sh(script: &str) -> CommandSpec {
            CommandSpec::new("sh").arg("-c").arg(script)
        }

        fn unarmed() -> oneshot::Receiver<()> {
            oneshot::channel().1
        }

        #[tokio::test]
        async fn collects_combined_output() {
            let exit = SubProcess::run(
                &sh("echo out; echo err >&2; exit 3"),
                Duration::from_secs(30),
                unarmed(),
            )
            .await;
            assert_eq!(exit.code(), Some(3));
            let output = exit.output_str();
            assert!(output.contains("out\n"), "stdout captured: {output:?}");
            assert!(output.contains("err\n"), "stderr captured: {output:?}");
        }

        #[tokio::test]
        async fn env_and_cwd() {
            let dir = camino_tempfile::tempdir().expect("tempdir created");
            let spec = sh("echo \"$CAPTURE_VAR\"; pwd")
                .env("CAPTURE_VAR", "value")
                .current_dir(dir.path());
            let exit = SubProcess::run(&spec, Duration::from_secs(30), unarmed()).await;
            assert!(exit.is_success(), "{exit:?}");
            let output = exit.output_str();
            assert!(output.starts_with("value\n"), "{output:?}");
        }

        #[tokio::test]
        async fn times_out() {
            let process = SubProcess::spawn(&sh("echo started; exec sleep 30")).expect("spawned");
            assert!(process.pid().is_some());
            let exit = process.wait(Duration::from_millis(200), unarmed()).await;
            assert!(exit.is_timed_out(), "{exit:?}");
        }

        #[tokio::test]
        async fn killed_on_request() {
            let (kill_tx, kill_rx) = oneshot::channel();
            let process = SubProcess::spawn(&sh("exec sleep 30")).expect("spawned");
            let handle = tokio::spawn(process.wait(Duration::from_secs(30), kill_rx));
            kill_tx.send(()).expect("receiver alive");
            let exit = handle.await.expect("task completed");
            assert!(exit.is_killed(), "{exit:?}");
        }

        #[tokio::test]
        async fn drains_both_pipes_concurrently() {
            // Each stream is larger than a pipe buffer, so reading only one would deadlock.
            let exit = SubProcess::run(
                &sh("head -c 200000 /dev/zero >&2; head -c 100000 /dev/zero; echo done"),
                Duration::from_secs(30),
                unarmed(),
            )
            .await;
            assert!(exit.is_success(), "{exit:?}");
            assert_eq!(exit.output().len(), 300_005);
            assert!(exit.output_str().ends_with("done\n"));
        }

        #[tokio::test]
        async fn missing_program() {
            let exit = SubProcess::run(
                &CommandSpec::new("/nonexistent/capture-replay-program"),
                Duration::from_secs(30),
                unarmed(),
            )
            .await;
            assert!(matches!(exit, ChildExit::ExecFailed { .. }), "{exit:?}");
        }
    }
}
