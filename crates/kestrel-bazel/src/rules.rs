//! Bazel rule kinds the server understands.
//!
//! Top-level rules anchor a build graph and carry the Apple platform
//! configuration that rules_apple applies through its platform transition;
//! dependency rules are the library targets the indexer actually cares
//! about. Each top-level variant knows the flag vocabulary needed to
//! replicate the transition when building a dependency directly.

use std::fmt;
use std::str::FromStr;

/// A user-declarable rule kind that anchors a build graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopLevelRuleKind {
    IosApplication,
    IosExtension,
    IosUnitTest,
    IosUiTest,
    MacosApplication,
    MacosUnitTest,
}

impl TopLevelRuleKind {
    pub const ALL: [TopLevelRuleKind; 6] = [
        TopLevelRuleKind::IosApplication,
        TopLevelRuleKind::IosExtension,
        TopLevelRuleKind::IosUnitTest,
        TopLevelRuleKind::IosUiTest,
        TopLevelRuleKind::MacosApplication,
        TopLevelRuleKind::MacosUnitTest,
    ];

    pub fn rule_class(self) -> &'static str {
        match self {
            TopLevelRuleKind::IosApplication => "ios_application",
            TopLevelRuleKind::IosExtension => "ios_extension",
            TopLevelRuleKind::IosUnitTest => "ios_unit_test",
            TopLevelRuleKind::IosUiTest => "ios_ui_test",
            TopLevelRuleKind::MacosApplication => "macos_application",
            TopLevelRuleKind::MacosUnitTest => "macos_unit_test",
        }
    }

    pub fn from_rule_class(rule_class: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.rule_class() == rule_class)
    }

    /// rules_apple platform name, as used in flag prefixes.
    pub fn platform(self) -> &'static str {
        match self {
            TopLevelRuleKind::IosApplication
            | TopLevelRuleKind::IosExtension
            | TopLevelRuleKind::IosUnitTest
            | TopLevelRuleKind::IosUiTest => "ios",
            TopLevelRuleKind::MacosApplication | TopLevelRuleKind::MacosUnitTest => "macos",
        }
    }

    /// The CPU value the transition selects. Indexing always targets the
    /// simulator on iOS so no signing is involved.
    pub fn cpu(self) -> &'static str {
        match self.platform() {
            "ios" => "sim_arm64",
            _ => "arm64",
        }
    }

    /// Prefix combined with [`cpu`](Self::cpu) for the legacy `--cpu` flag,
    /// e.g. `ios_sim_arm64` / `darwin_arm64`.
    pub fn cpu_prefix(self) -> &'static str {
        match self.platform() {
            "ios" => "ios",
            _ => "darwin",
        }
    }

    /// Suffix of the per-platform CPU list flag: `--ios_multi_cpus` /
    /// `--macos_cpus`.
    pub fn cpu_flag_name(self) -> &'static str {
        match self.platform() {
            "ios" => "multi_cpus",
            _ => "cpus",
        }
    }

    /// Suffix of the per-platform minimum OS flag: `--ios_minimum_os` /
    /// `--macos_minimum_os`.
    pub fn min_os_flag_name(self) -> &'static str {
        "minimum_os"
    }

    /// The SDK identifier passed to `xcrun --sdk`.
    pub fn sdk_name(self) -> &'static str {
        match self.platform() {
            "ios" => "iphonesimulator",
            _ => "macosx",
        }
    }

    /// The internal bundle rule a test target wraps its code in, if any.
    ///
    /// Test bundles appear as intermediate targets in the dependency graph
    /// and must be traversed to reach the libraries under test.
    pub fn test_bundle_rule(self) -> Option<&'static str> {
        match self {
            TopLevelRuleKind::IosUnitTest | TopLevelRuleKind::IosUiTest => {
                Some("ios_test_bundle")
            }
            TopLevelRuleKind::MacosUnitTest => Some("macos_test_bundle"),
            _ => None,
        }
    }
}

impl fmt::Display for TopLevelRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rule_class())
    }
}

impl FromStr for TopLevelRuleKind {
    type Err = UnknownRuleKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_rule_class(s).ok_or_else(|| UnknownRuleKind(s.to_string()))
    }
}

/// A library rule kind discovered underneath top-level targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyRuleKind {
    SwiftLibrary,
    ObjcLibrary,
}

impl DependencyRuleKind {
    pub const ALL: [DependencyRuleKind; 2] = [
        DependencyRuleKind::SwiftLibrary,
        DependencyRuleKind::ObjcLibrary,
    ];

    pub fn rule_class(self) -> &'static str {
        match self {
            DependencyRuleKind::SwiftLibrary => "swift_library",
            DependencyRuleKind::ObjcLibrary => "objc_library",
        }
    }

    pub fn from_rule_class(rule_class: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.rule_class() == rule_class)
    }
}

impl fmt::Display for DependencyRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.rule_class())
    }
}

impl FromStr for DependencyRuleKind {
    type Err = UnknownRuleKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_rule_class(s).ok_or_else(|| UnknownRuleKind(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRuleKind(pub String);

impl fmt::Display for UnknownRuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown rule kind `{}`", self.0)
    }
}

impl std::error::Error for UnknownRuleKind {}
