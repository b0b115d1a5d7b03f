//! Server configuration.
//!
//! [`BaseServerConfig`] is assembled from the CLI and lives for the process.
//! [`InitializedServerConfig`] is derived once during `build/initialize`
//! from `bazel info` output and toolchain discovery, and never replaced.

use crate::rules::{DependencyRuleKind, TopLevelRuleKind};
use crate::toolchain::AppleToolchain;
use anyhow::{bail, Result};
use kestrel_core::AbsPathBuf;
use std::path::PathBuf;

/// Suffix appended to the user's output base to derive the dedicated
/// indexing base, so index builds never contend with interactive builds.
pub const OUTPUT_BASE_SUFFIX: &str = "-kestrel";

const GLOBAL_INDEX_STORE_DIR: &str = "_global_index_store";
const GLOBAL_INDEX_DATABASE_DIR: &str = "_global_index_database";

pub const DEFAULT_APPLE_SUPPORT_REPO: &str = "build_bazel_apple_support";

#[derive(Debug, Clone)]
pub struct BaseServerConfig {
    /// Command used to invoke Bazel, e.g. `bazel` or `./bazelw`.
    pub bazel_wrapper: String,
    /// Top-level target patterns anchoring discovery, e.g. `//App`.
    pub targets: Vec<String>,
    /// Extra flags appended to every indexing build, e.g. `--config=index`.
    pub index_flags: Vec<String>,
    /// Glob patterns (relative to the workspace root) the client should
    /// watch. `None` means the built-in source globs.
    pub files_to_watch: Option<Vec<String>>,
    /// Build whole top-level targets in `buildTarget/prepare` instead of
    /// individual libraries under a replicated transition.
    pub compile_top_level: bool,
    pub top_level_rules: Vec<TopLevelRuleKind>,
    pub dependency_rules: Vec<DependencyRuleKind>,
    /// Target patterns excluded from top-level discovery.
    pub top_level_exclusions: Vec<String>,
    /// Target patterns excluded from dependency discovery.
    pub dependency_exclusions: Vec<String>,
    /// External repo providing `//platforms:<platform>_<cpu>` definitions.
    pub apple_support_repo: String,
}

impl BaseServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bazel_wrapper.trim().is_empty() {
            bail!("bazel wrapper command must not be empty");
        }
        if self.targets.is_empty() {
            bail!("at least one top-level target pattern is required");
        }
        if self.top_level_rules.is_empty() {
            bail!("at least one top-level rule kind is required");
        }
        if self.dependency_rules.is_empty() {
            bail!("at least one dependency rule kind is required");
        }
        Ok(())
    }

    /// The SDKs worth probing with `xcrun`, derived from the configured
    /// top-level rule kinds.
    pub fn sdk_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            self.top_level_rules.iter().map(|kind| kind.sdk_name()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

#[derive(Debug, Clone)]
pub struct InitializedServerConfig {
    pub base: BaseServerConfig,
    /// The workspace root as a `file://` URI.
    pub root_uri: String,
    pub root_path: AbsPathBuf,
    /// Last path component of the workspace root.
    pub workspace_name: String,
    /// The dedicated indexing output base.
    pub output_base: PathBuf,
    /// `bazel info output_path` under the indexing base.
    pub output_path: PathBuf,
    /// `bazel info execution_root` under the indexing base.
    pub execution_root: PathBuf,
    pub toolchain: AppleToolchain,
}

impl InitializedServerConfig {
    pub fn global_index_store_path(&self) -> PathBuf {
        self.output_path.join(GLOBAL_INDEX_STORE_DIR)
    }

    pub fn global_index_database_path(&self) -> PathBuf {
        self.output_path.join(GLOBAL_INDEX_DATABASE_DIR)
    }
}

/// Derive the indexing output base from the user's regular one.
pub fn indexing_output_base(user_output_base: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", user_output_base.trim_end(), OUTPUT_BASE_SUFFIX))
}
