use crate::{isolate_process_group, kill_process_tree_by_pid, CancellationToken};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How often the waiting thread re-checks timeout and cancellation.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Kill the child (and its process group) after this long.
    pub timeout: Option<Duration>,
    /// Per-stream capture cap; output beyond it is dropped but still drained.
    pub max_bytes: usize,
    pub cancellation: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            max_bytes: 16 * 1024 * 1024,
            cancellation: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug)]
pub struct RunResult {
    pub status: ExitStatus,
    pub output: CapturedOutput,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// The command line a failure report describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub cwd: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(cwd: &Path, program: &Path, args: &[String]) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            program: program.to_path_buf(),
            args: args.to_vec(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("`{command}` {}:\n{stderr}", failure_reason(.status, .timed_out, .cancelled))]
pub struct CommandFailure {
    pub command: CommandSpec,
    pub status: ExitStatus,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

fn failure_reason(status: &ExitStatus, timed_out: &bool, cancelled: &bool) -> String {
    if *timed_out {
        "timed out".to_string()
    } else if *cancelled {
        "was cancelled".to_string()
    } else {
        format!("exited with {status}")
    }
}

impl CommandFailure {
    pub fn new(
        command: CommandSpec,
        status: ExitStatus,
        stderr: String,
        timed_out: bool,
        cancelled: bool,
    ) -> Self {
        Self {
            command,
            status,
            stderr,
            timed_out,
            cancelled,
        }
    }
}

/// Run `program args…` to completion with bounded capture.
///
/// The child gets a null stdin and its own process group. A timeout or
/// cancellation kills the whole tree; the function still reaps the child and
/// returns its (failed) status with `timed_out`/`cancelled` set.
pub fn run_command(
    cwd: &Path,
    program: &Path,
    args: &[String],
    opts: RunOptions,
) -> io::Result<RunResult> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("failed to open stdout pipe"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("failed to open stderr pipe"))?;

    let max_bytes = opts.max_bytes;
    let stdout_handle =
        thread::spawn(move || read_capped_and_drain(stdout, max_bytes));
    let stderr_handle =
        thread::spawn(move || read_capped_and_drain(stderr, max_bytes));

    let (status_tx, status_rx) = mpsc::channel::<io::Result<ExitStatus>>();
    let wait_handle = thread::spawn(move || {
        let _ = status_tx.send(child.wait());
    });

    let deadline = opts.timeout.map(|timeout| Instant::now() + timeout);
    let mut timed_out = false;
    let mut cancelled = false;

    let status = loop {
        match status_rx.recv_timeout(WAIT_POLL_INTERVAL) {
            Ok(status) => break status?,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(io::Error::other("wait thread exited without a status"));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if let Some(token) = &opts.cancellation {
            if token.is_cancelled() && !cancelled {
                cancelled = true;
                kill_process_tree_by_pid(pid, libc::SIGKILL);
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline && !timed_out && !cancelled {
                timed_out = true;
                kill_process_tree_by_pid(pid, libc::SIGKILL);
            }
        }
    };

    let (stdout, stdout_truncated) = stdout_handle
        .join()
        .unwrap_or_else(|_| (Vec::new(), false));
    let (stderr, stderr_truncated) = stderr_handle
        .join()
        .unwrap_or_else(|_| (Vec::new(), false));
    let _ = wait_handle.join();

    Ok(RunResult {
        status,
        output: CapturedOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            truncated: stdout_truncated || stderr_truncated,
        },
        timed_out,
        cancelled,
    })
}

/// Read up to `limit` bytes, then keep draining to EOF so the child never
/// blocks on a full pipe. Returns the captured bytes and a truncation flag.
fn read_capped_and_drain<R: Read>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut captured = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < limit {
                    let take = n.min(limit - captured.len());
                    captured.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    (captured, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn sh(script: &str, opts: RunOptions) -> RunResult {
        run_command(
            Path::new("."),
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            opts,
        )
        .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_stderr() {
        let result = sh("echo out; echo err >&2", RunOptions::default());
        assert!(result.status.success());
        assert_eq!(result.output.stdout_string(), "out\n");
        assert_eq!(result.output.stderr, "err\n");
        assert!(!result.output.truncated);
    }

    #[cfg(unix)]
    #[test]
    fn truncates_large_stdout() {
        let opts = RunOptions {
            max_bytes: 1024,
            ..RunOptions::default()
        };
        let result = sh("head -c 1048576 /dev/zero", opts);
        assert!(result.status.success());
        assert!(result.output.truncated);
        assert_eq!(result.output.stdout.len(), 1024);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_child() {
        let opts = RunOptions {
            timeout: Some(Duration::from_millis(50)),
            ..RunOptions::default()
        };
        let start = Instant::now();
        let result = sh("sleep 5", opts);
        assert!(result.timed_out);
        assert!(!result.status.success());
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "expected timeout kill to return promptly, took {:?}",
            start.elapsed()
        );
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let opts = RunOptions {
            cancellation: Some(cancel),
            ..RunOptions::default()
        };
        let start = Instant::now();
        let result = sh("sleep 5", opts);
        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "expected cancellation kill to return promptly, took {:?}",
            start.elapsed()
        );
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_reported_in_status() {
        let result = sh("exit 7", RunOptions::default());
        assert_eq!(result.status.code(), Some(7));
    }

    #[test]
    fn command_failure_display_includes_command_and_stderr() {
        #[cfg(unix)]
        {
            let result = sh("exit 3", RunOptions::default());
            let failure = CommandFailure::new(
                CommandSpec::new(
                    Path::new("."),
                    Path::new("bazel"),
                    &["build".to_string(), "//App".to_string()],
                ),
                result.status,
                "analysis failed".to_string(),
                false,
                false,
            );
            let message = failure.to_string();
            assert!(message.contains("bazel build //App"), "{message}");
            assert!(message.contains("analysis failed"), "{message}");
        }
    }
}
