#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

static STDIO_SERVER_LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests that spawn the `kestrel` stdio server so parallel test
/// threads don't stack server processes (and their worker threads) on top
/// of each other.
pub fn stdio_server_lock() -> MutexGuard<'static, ()> {
    STDIO_SERVER_LOCK
        .lock()
        .unwrap_or_else(|err| err.into_inner())
}

pub fn write_message<W: Write>(writer: &mut W, message: &Value) {
    let bytes = serde_json::to_vec(message).expect("serialize message");
    write!(writer, "Content-Length: {}\r\n\r\n", bytes.len()).expect("write header");
    writer.write_all(&bytes).expect("write body");
    writer.flush().expect("flush");
}

pub fn read_message<R: BufRead>(reader: &mut R) -> Option<Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let bytes = reader.read_line(&mut line).expect("read header line");
        if bytes == 0 {
            return None;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(value.trim().parse().expect("content length"));
            }
        }
    }
    let len = content_length.expect("missing Content-Length");
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).expect("read body");
    Some(serde_json::from_slice(&buf).expect("decode message"))
}

/// Lay down the fake `bazel` / `xcrun` / `xcode-select` scripts and the
/// proto fixtures the server will be pointed at.
pub struct Fixtures {
    pub dir: PathBuf,
}

impl Fixtures {
    pub fn install(dir: &Path, cquery: &[u8], aquery: &[u8]) -> Self {
        let bin = dir.join("bin");
        std::fs::create_dir_all(&bin).expect("create fake bin dir");
        std::fs::write(dir.join("cquery.bin"), cquery).expect("write cquery fixture");
        std::fs::write(dir.join("aquery.bin"), aquery).expect("write aquery fixture");

        write_script(
            &bin.join("bazel"),
            r#"#!/bin/sh
case "$*" in
  *"info output_base"*) echo "$KESTREL_TEST_FIXTURES/ob" ;;
  *"info output_path"*) echo "$KESTREL_TEST_FIXTURES/ob-kestrel/bin" ;;
  *"info execution_root"*) echo "$KESTREL_TEST_FIXTURES/ob-kestrel/execroot/_main" ;;
  *cquery*) cat "$KESTREL_TEST_FIXTURES/cquery.bin" ;;
  *aquery*) cat "$KESTREL_TEST_FIXTURES/aquery.bin" ;;
  *" build "*)
    mode=ok
    [ -f "$KESTREL_TEST_FIXTURES/build_mode" ] && mode=$(cat "$KESTREL_TEST_FIXTURES/build_mode")
    if [ "$mode" = "sleep" ]; then
      trap 'exit 8' TERM
      sleep 30 &
      wait $!
    fi
    exit 0
    ;;
  *query*) echo "//App:App" ;;
  *) exit 1 ;;
esac
"#,
        );
        write_script(
            &bin.join("xcrun"),
            r#"#!/bin/sh
case "$*" in
  *"--find swift"*) echo "$KESTREL_TEST_FIXTURES/toolchain/usr/bin/swift" ;;
  *iphonesimulator*) echo "$KESTREL_TEST_FIXTURES/sdks/iPhoneSimulator.sdk" ;;
  *) exit 1 ;;
esac
"#,
        );
        write_script(
            &bin.join("xcode-select"),
            r#"#!/bin/sh
echo "$KESTREL_TEST_FIXTURES/developer"
"#,
        );

        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join("bin")
    }

    pub fn set_build_mode(&self, mode: &str) {
        std::fs::write(self.dir.join("build_mode"), mode).expect("write build mode");
    }
}

fn write_script(path: &Path, contents: &str) {
    std::fs::write(path, contents).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }
}

pub struct ServerHarness {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    buffered: VecDeque<Value>,
}

impl ServerHarness {
    pub fn spawn(workspace: &Path, fixtures: &Fixtures, extra_args: &[&str]) -> Self {
        let path = format!(
            "{}:{}",
            fixtures.bin_dir().display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let mut child = Command::new(env!("CARGO_BIN_EXE_kestrel"))
            .arg("serve")
            .args(["--bazel-wrapper", "bazel", "--target", "//App"])
            .args([
                "--top-level-rule-to-discover",
                "ios_application",
                "--top-level-rule-to-discover",
                "ios_unit_test",
            ])
            .args(["--index-flag", "--config=index"])
            .args(extra_args)
            .env("PATH", path)
            .env("KESTREL_TEST_FIXTURES", &fixtures.dir)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn kestrel");

        let stdin = child.stdin.take().expect("stdin");
        let stdout = BufReader::new(child.stdout.take().expect("stdout"));
        Self {
            child,
            stdin,
            stdout,
            buffered: VecDeque::new(),
        }
    }

    pub fn request(&mut self, id: i64, method: &str, params: Value) {
        write_message(
            &mut self.stdin,
            &json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
        );
    }

    pub fn notify(&mut self, method: &str, params: Value) {
        write_message(
            &mut self.stdin,
            &json!({"jsonrpc": "2.0", "method": method, "params": params}),
        );
    }

    fn next_message(&mut self) -> Value {
        if let Some(message) = self.buffered.pop_front() {
            return message;
        }
        read_message(&mut self.stdout).expect("server closed the transport")
    }

    /// Read until the response for `id` arrives, buffering notifications.
    pub fn response_for(&mut self, id: i64) -> Value {
        loop {
            let message = self.next_message();
            if message.get("id").and_then(Value::as_i64) == Some(id) {
                return message;
            }
            self.buffered.push_back(message);
        }
    }

    /// Read until a notification with `method` arrives, buffering the rest.
    pub fn notification(&mut self, method: &str) -> Value {
        if let Some(position) = self
            .buffered
            .iter()
            .position(|m| m.get("method").and_then(Value::as_str) == Some(method))
        {
            return self.buffered.remove(position).expect("position in bounds");
        }
        loop {
            let message = self.next_message();
            if message.get("method").and_then(Value::as_str) == Some(method) {
                return message;
            }
            self.buffered.push_back(message);
        }
    }

    /// A notification already buffered while waiting for something else.
    pub fn buffered_notification(&mut self, method: &str) -> Option<Value> {
        let position = self
            .buffered
            .iter()
            .position(|m| m.get("method").and_then(Value::as_str) == Some(method))?;
        self.buffered.remove(position)
    }

    pub fn initialize(&mut self, workspace: &Path) -> Value {
        self.request(
            1,
            "build/initialize",
            json!({
                "displayName": "test-client",
                "version": "1.0",
                "bspVersion": "2.2.0",
                "rootUri": format!("file://{}", workspace.display()),
                "capabilities": {"languageIds": ["swift", "objective-c"]}
            }),
        );
        let response = self.response_for(1);
        self.notify("build/initialized", json!(null));
        response
    }

    pub fn shutdown_and_exit(mut self) -> i32 {
        self.request(99, "build/shutdown", json!(null));
        let response = self.response_for(99);
        assert!(response.get("error").is_none(), "shutdown failed: {response}");
        self.notify("build/exit", json!(null));
        self.wait_for_exit()
    }

    pub fn wait_for_exit(mut self) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match self.child.try_wait().expect("wait for server") {
                Some(status) => return status.code().unwrap_or(-1),
                None if Instant::now() > deadline => {
                    let _ = self.child.kill();
                    panic!("server did not exit in time");
                }
                None => std::thread::sleep(Duration::from_millis(20)),
            }
        }
    }
}

impl Drop for ServerHarness {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
