use crate::{isolate_process_group, kill_process_tree_by_pid};
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Per-stream capture cap for long-running children. Bazel build output is
/// progress chatter; only the tail of stderr matters for error reporting.
const MAX_STREAM_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

type TerminationHandler = Box<dyn FnOnce(&ProcessExit) + Send>;

/// Final state of a [`SpawnedProcess`].
#[derive(Debug)]
pub struct ProcessExit {
    pub status: ExitStatus,
    /// `None` when the child died to a signal before exiting.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Whether [`SpawnedProcess::terminate`] was called before exit.
    pub terminated: bool,
}

struct ProcessState {
    exit: Option<Arc<ProcessExit>>,
    handler: Option<TerminationHandler>,
    terminated: bool,
}

struct ProcessInner {
    state: Mutex<ProcessState>,
    exited: Condvar,
}

/// A long-running shell child with streamed output capture.
///
/// The exit is observed by a dedicated waiter thread, which fires the
/// registered termination handler exactly once. A handler registered after
/// the child already exited fires immediately on the registering thread.
pub struct SpawnedProcess {
    inner: Arc<ProcessInner>,
    pid: u32,
}

impl SpawnedProcess {
    /// Spawn `/bin/sh -c <command>` in `cwd` with piped stdout/stderr.
    pub fn spawn_shell(command: &str, cwd: &Path) -> io::Result<Self> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
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

        let inner = Arc::new(ProcessInner {
            state: Mutex::new(ProcessState {
                exit: None,
                handler: None,
                terminated: false,
            }),
            exited: Condvar::new(),
        });

        let stdout_handle = thread::spawn(move || drain_capped(stdout));
        let stderr_handle = thread::spawn(move || drain_capped(stderr));

        let waiter_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("kestrel-process-waiter".to_string())
            .spawn(move || {
                let status = child.wait();
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();

                let status = match status {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::error!(
                            target = "kestrel.process",
                            pid,
                            error = %err,
                            "failed to wait for child"
                        );
                        return;
                    }
                };

                let (handler, exit) = {
                    let mut state = lock_recover(&waiter_inner.state);
                    let exit = Arc::new(ProcessExit {
                        status,
                        code: status.code(),
                        stdout: String::from_utf8_lossy(&stdout).into_owned(),
                        stderr: String::from_utf8_lossy(&stderr).into_owned(),
                        terminated: state.terminated,
                    });
                    state.exit = Some(Arc::clone(&exit));
                    (state.handler.take(), exit)
                };
                waiter_inner.exited.notify_all();

                if let Some(handler) = handler {
                    handler(&exit);
                }
            })
            .expect("failed to spawn process waiter thread");

        Ok(Self { inner, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Block until the child exits.
    pub fn wait(&self) -> Arc<ProcessExit> {
        let mut state = lock_recover(&self.inner.state);
        loop {
            if let Some(exit) = &state.exit {
                return Arc::clone(exit);
            }
            state = match self.inner.exited.wait(state) {
                Ok(guard) => guard,
                Err(err) => err.into_inner(),
            };
        }
    }

    /// Send SIGTERM to the child's process group.
    ///
    /// The exit still flows through the waiter thread, so the termination
    /// handler fires with whatever status the child reports (Bazel exits
    /// with code 8 when a `--preemptible` build is interrupted).
    pub fn terminate(&self) {
        {
            let mut state = lock_recover(&self.inner.state);
            if state.exit.is_some() {
                return;
            }
            state.terminated = true;
        }
        kill_process_tree_by_pid(self.pid, libc::SIGTERM);
    }

    /// Register `handler` to run when the child exits.
    ///
    /// Fires immediately if the child has already exited. At most one handler
    /// is supported; registering again replaces an unfired handler.
    pub fn set_termination_handler(&self, handler: impl FnOnce(&ProcessExit) + Send + 'static) {
        let already_exited = {
            let mut state = lock_recover(&self.inner.state);
            match &state.exit {
                Some(exit) => Some(Arc::clone(exit)),
                None => {
                    state.handler = Some(Box::new(handler));
                    return;
                }
            }
        };
        if let Some(exit) = already_exited {
            handler(&exit);
        }
    }
}

// Local poison recovery; this crate sits below kestrel-core in the
// dependency graph so it cannot use the shared helper.
fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(err) => err.into_inner(),
    }
}

fn drain_capped<R: Read>(mut reader: R) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < MAX_STREAM_CAPTURE_BYTES {
                    let take = n.min(MAX_STREAM_CAPTURE_BYTES - captured.len());
                    captured.extend_from_slice(&buf[..take]);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    captured
}
