//! Child-process execution for the kestrel build server.
//!
//! Two execution styles are provided:
//!
//! - [`run_command`]: bounded one-shot execution with a timeout, optional
//!   cancellation, and capped output capture. Used for Bazel queries and
//!   toolchain discovery.
//! - [`SpawnedProcess`]: a long-running shell child with streamed output, a
//!   `terminate` that signals the whole process tree, and an exactly-once
//!   termination handler. Used for `buildTarget/prepare` builds.
//!
//! On unix every child is placed in its own process group so that kills
//! reach grandchildren (Bazel forks its server and workers).

mod cancel;
mod run;
mod spawn;

pub use crate::{
    cancel::CancellationToken,
    run::{run_command, CapturedOutput, CommandFailure, CommandSpec, RunOptions, RunResult},
    spawn::{ProcessExit, SpawnedProcess},
};

pub(crate) fn kill_process_tree_by_pid(pid: u32, signal: i32) {
    #[cfg(unix)]
    unsafe {
        let pid = pid as i32;
        // The process group first (requires `setpgid` in `pre_exec`), then the
        // immediate child as a fallback.
        let _ = libc::kill(-pid, signal);
        let _ = libc::kill(pid, signal);
    }

    #[cfg(windows)]
    {
        use std::process::{Command, Stdio};

        let _ = signal;
        let pid = pid.to_string();
        let _ = Command::new("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

/// Configure `cmd` so the spawned child leads its own process group.
pub(crate) fn isolate_process_group(cmd: &mut std::process::Command) {
    #[cfg(unix)]
    unsafe {
        use std::os::unix::process::CommandExt;

        cmd.pre_exec(|| {
            // SAFETY: `setpgid` is async-signal-safe and does not allocate;
            // this runs after `fork` in the child.
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    let _ = cmd;
}
