//! Apple toolchain discovery.
//!
//! `build/initialize` probes the local Xcode installation through
//! `xcode-select` and `xcrun`. Missing tools or SDKs are tolerated: the
//! corresponding placeholder substitutions simply resolve to nothing, and
//! the server still serves targets and build requests.

use crate::commands::CommandRunner;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppleToolchain {
    /// `xcode-select --print-path` output.
    pub developer_dir: Option<String>,
    /// The toolchain directory derived from `xcrun --find swift`.
    pub toolchain_path: Option<String>,
    /// SDK name (as passed to `xcrun --sdk`) to SDK root path.
    pub sdk_roots: BTreeMap<String, String>,
}

impl AppleToolchain {
    pub fn sdk_root(&self, sdk_name: &str) -> Option<&str> {
        self.sdk_roots.get(sdk_name).map(String::as_str)
    }
}

const SWIFT_BIN_SUFFIX: &str = "/usr/bin/swift";

/// Probe the toolchain with the given runner. Every probe failure is
/// logged and skipped.
pub fn discover_toolchain(
    runner: &dyn CommandRunner,
    cwd: &Path,
    sdk_names: &[&str],
) -> AppleToolchain {
    let mut toolchain = AppleToolchain::default();

    match runner.run_shell(cwd, "xcode-select --print-path") {
        Ok(output) => {
            let path = output.stdout_string().trim().to_string();
            if !path.is_empty() {
                toolchain.developer_dir = Some(path);
            }
        }
        Err(err) => {
            tracing::warn!(
                target = "kestrel.bazel",
                error = %err,
                "failed to detect the Xcode developer directory"
            );
        }
    }

    match runner.run_shell(cwd, "xcrun --find swift") {
        Ok(output) => {
            let swift = output.stdout_string().trim().to_string();
            match swift.strip_suffix(SWIFT_BIN_SUFFIX) {
                Some(toolchain_dir) if !toolchain_dir.is_empty() => {
                    toolchain.toolchain_path = Some(toolchain_dir.to_string());
                }
                _ => {
                    tracing::warn!(
                        target = "kestrel.bazel",
                        swift_path = %swift,
                        "swift binary path has an unexpected shape; toolchain path unknown"
                    );
                }
            }
        }
        Err(err) => {
            tracing::warn!(
                target = "kestrel.bazel",
                error = %err,
                "failed to locate the swift toolchain"
            );
        }
    }

    for sdk in sdk_names {
        let command = format!("xcrun --sdk {sdk} --show-sdk-path");
        match runner.run_shell(cwd, &command) {
            Ok(output) => {
                let path = output.stdout_string().trim().to_string();
                if !path.is_empty() {
                    toolchain.sdk_roots.insert((*sdk).to_string(), path);
                }
            }
            Err(err) => {
                // Not every machine has every SDK installed.
                tracing::debug!(
                    target = "kestrel.bazel",
                    sdk,
                    error = %err,
                    "SDK not available"
                );
            }
        }
    }

    toolchain
}
