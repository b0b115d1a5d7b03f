//! Bazel command construction and execution.
//!
//! Commands are assembled as shell strings (the wrapper may itself be a
//! script) and run through a [`CommandRunner`] seam so tests can substitute
//! a recording fake. Query-style invocations are bounded by a timeout that
//! can be raised via `KESTREL_BAZEL_QUERY_TIMEOUT_SECS` for large
//! workspaces.

use crate::config::InitializedServerConfig;
use anyhow::{anyhow, Context, Result};
use kestrel_process::{run_command, CommandFailure, CommandSpec, RunOptions};
use std::env::VarError;
use std::path::Path;
use std::time::Duration;

const ENV_QUERY_TIMEOUT_SECS: &str = "KESTREL_BAZEL_QUERY_TIMEOUT_SECS";
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(300);

/// Startup flags prepended to every invocation against the indexing base.
///
/// `--preemptible` lets a later invocation (or a SIGTERM) interrupt the
/// current one instead of queueing behind its analysis phase; without it,
/// `$/cancelRequest` could not unblock a running prepare.
pub const STARTUP_FLAGS: &[&str] = &["--preemptible"];

/// `--remote_download_regex` value for indexing builds: with remote
/// execution enabled, these are the outputs the indexer must have locally.
pub const REMOTE_DOWNLOAD_REGEX: &str =
    ".*\\.indexstore/.*|.*\\.(a|swiftmodule|swiftdoc|swiftsourceinfo|swiftinterface|h|modulemap|pch|pcm)$";

fn query_timeout() -> Duration {
    let raw = match std::env::var(ENV_QUERY_TIMEOUT_SECS) {
        Ok(raw) => raw,
        Err(VarError::NotPresent) => String::new(),
        Err(err) => {
            tracing::debug!(
                target = "kestrel.bazel",
                key = ENV_QUERY_TIMEOUT_SECS,
                error = ?err,
                "failed to read env override; using default query timeout"
            );
            String::new()
        }
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return DEFAULT_QUERY_TIMEOUT;
    }

    match raw.parse::<i64>() {
        Ok(secs) if secs > 0 => Duration::from_secs(secs as u64),
        Ok(_) | Err(_) => {
            tracing::debug!(
                target = "kestrel.bazel",
                key = ENV_QUERY_TIMEOUT_SECS,
                value = raw,
                "invalid env override; using default query timeout"
            );
            DEFAULT_QUERY_TIMEOUT
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Executes shell command lines. The default implementation shells out; the
/// test implementations replay canned output.
pub trait CommandRunner: Send + Sync {
    fn run_shell(&self, cwd: &Path, command: &str) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone)]
pub struct DefaultCommandRunner;

impl CommandRunner for DefaultCommandRunner {
    fn run_shell(&self, cwd: &Path, command: &str) -> Result<CommandOutput> {
        let opts = RunOptions {
            timeout: Some(query_timeout()),
            ..RunOptions::default()
        };
        let args = vec!["-c".to_string(), command.to_string()];
        let result = run_command(cwd, Path::new("/bin/sh"), &args, opts)
            .with_context(|| format!("failed to run `{command}`"))?;

        if result.timed_out || result.cancelled || !result.status.success() {
            let spec = CommandSpec::new(cwd, Path::new("/bin/sh"), &args);
            return Err(anyhow!(CommandFailure::new(
                spec,
                result.status,
                result.output.stderr,
                result.timed_out,
                result.cancelled,
            )));
        }

        Ok(CommandOutput {
            stdout: result.output.stdout,
            stderr: result.output.stderr,
        })
    }
}

/// Quote `arg` for inclusion in a `/bin/sh -c` command line.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'@' | b'=' | b','))
    {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Builds the Bazel command lines the server issues.
#[derive(Debug, Clone)]
pub struct BazelCommands {
    wrapper: String,
    output_base: String,
    index_flags: Vec<String>,
}

impl BazelCommands {
    pub fn new(config: &InitializedServerConfig) -> Self {
        Self {
            wrapper: config.base.bazel_wrapper.clone(),
            output_base: config.output_base.to_string_lossy().into_owned(),
            index_flags: config.base.index_flags.clone(),
        }
    }

    /// `bazel info <key>` against the user's regular output base.
    pub fn info_cold(wrapper: &str, key: &str) -> String {
        format!("{wrapper} info {key}")
    }

    /// `bazel info <key>` against an explicit output base; used during
    /// `build/initialize` before an [`InitializedServerConfig`] exists.
    pub fn info_with_output_base(wrapper: &str, output_base: &std::path::Path, key: &str) -> String {
        format!(
            "{wrapper} --output_base={} info {key}",
            shell_quote(&output_base.to_string_lossy())
        )
    }

    /// `bazel info <key>` against the indexing base.
    pub fn info(&self, key: &str) -> String {
        format!(
            "{} --output_base={} info {key}",
            self.wrapper,
            shell_quote(&self.output_base)
        )
    }

    fn startup_prefix(&self) -> String {
        let mut prefix = format!(
            "{} --output_base={}",
            self.wrapper,
            shell_quote(&self.output_base)
        );
        for flag in STARTUP_FLAGS {
            prefix.push(' ');
            prefix.push_str(flag);
        }
        prefix
    }

    /// A plain `query`, without indexing flags.
    pub fn query(&self, expression: &str, flags: &[&str]) -> String {
        let mut command = format!("{} query {}", self.startup_prefix(), shell_quote(expression));
        for flag in flags {
            command.push(' ');
            command.push_str(&shell_quote(flag));
        }
        command
    }

    pub fn cquery(&self, expression: &str, flags: &[&str]) -> String {
        let mut command = format!(
            "{} cquery {}",
            self.startup_prefix(),
            shell_quote(expression)
        );
        for flag in flags {
            command.push(' ');
            command.push_str(&shell_quote(flag));
        }
        command
    }

    pub fn aquery(&self, expression: &str, flags: &[&str]) -> String {
        let mut command = format!(
            "{} aquery {}",
            self.startup_prefix(),
            shell_quote(expression)
        );
        for flag in flags {
            command.push(' ');
            command.push_str(&shell_quote(flag));
        }
        command
    }

    /// An indexing build: startup flags, the requested labels and transition
    /// flags, the remote download regex, and the configured index flags.
    pub fn build(&self, labels: &[String], extra_flags: &[String]) -> String {
        let mut command = format!("{} build", self.startup_prefix());
        for label in labels {
            command.push(' ');
            command.push_str(&shell_quote(label));
        }
        for flag in extra_flags {
            command.push(' ');
            command.push_str(&shell_quote(flag));
        }
        command.push_str(&format!(
            " --remote_download_regex={}",
            shell_quote(REMOTE_DOWNLOAD_REGEX)
        ));
        for flag in &self.index_flags {
            command.push(' ');
            command.push_str(&shell_quote(flag));
        }
        command
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{CommandOutput, CommandRunner};
    use anyhow::{anyhow, Result};
    use std::path::Path;
    use std::sync::Mutex;

    /// Replays canned output keyed by a substring of the command line, and
    /// records every command it sees.
    #[derive(Debug, Default)]
    pub struct FakeCommandRunner {
        responses: Mutex<Vec<(String, Result<CommandOutput, String>)>>,
        pub seen: Mutex<Vec<String>>,
    }

    impl FakeCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, needle: &str, stdout: impl Into<Vec<u8>>) {
            self.responses.lock().unwrap().push((
                needle.to_string(),
                Ok(CommandOutput {
                    stdout: stdout.into(),
                    stderr: String::new(),
                }),
            ));
        }

        pub fn fail(&self, needle: &str, stderr: &str) {
            self.responses
                .lock()
                .unwrap()
                .push((needle.to_string(), Err(stderr.to_string())));
        }
    }

    impl CommandRunner for FakeCommandRunner {
        fn run_shell(&self, _cwd: &Path, command: &str) -> Result<CommandOutput> {
            self.seen.lock().unwrap().push(command.to_string());
            let responses = self.responses.lock().unwrap();
            for (needle, response) in responses.iter() {
                if command.contains(needle.as_str()) {
                    return match response {
                        Ok(output) => Ok(output.clone()),
                        Err(stderr) => {
                            Err(anyhow!("`{command}` exited with 1.\nstderr:\n{stderr}"))
                        }
                    };
                }
            }
            Err(anyhow!("no canned response for `{command}`"))
        }
    }
}
