//! Action-query execution and decoding.
//!
//! One aquery over the user targets' transitive closure collects every
//! Swift and Objective-C compile action; the compiler-argument extractor
//! later picks the right action per request out of the decoded maps.

use crate::config::BaseServerConfig;
use anyhow::Result;
use kestrel_bazel_proto::analysis;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Flags for the compile-action aquery. Artifacts are omitted because the
/// compile arguments already name every input the extractor needs.
pub const AQUERY_FLAGS: &[&str] = &[
    "--noinclude_artifacts",
    "--noinclude_aspects",
    "--output",
    "proto",
];

pub fn build_aquery_expression(config: &BaseServerConfig) -> String {
    let user_targets = config.targets.join(" + ");
    format!("mnemonic('SwiftCompile|ObjcCompile', deps({user_targets}))")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AqueryTarget {
    pub id: u32,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AqueryAction {
    pub mnemonic: String,
    pub configuration_id: u32,
    pub arguments: Vec<String>,
}

/// The decoded action graph, indexed for extraction.
///
/// `actions` is a list per target id because the same target can appear
/// under multiple platform configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AqueryResult {
    pub targets: BTreeMap<String, AqueryTarget>,
    pub actions: BTreeMap<u32, Vec<AqueryAction>>,
}

impl Hash for AqueryResult {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (label, target) in &self.targets {
            label.hash(state);
            target.hash(state);
        }
        for (id, actions) in &self.actions {
            id.hash(state);
            actions.hash(state);
        }
    }
}

impl AqueryResult {
    /// A stable key for caches derived from this result.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub fn target_by_label(&self, label: &str) -> Option<&AqueryTarget> {
        self.targets.get(label)
    }

    pub fn actions_for(&self, target_id: u32) -> &[AqueryAction] {
        self.actions
            .get(&target_id)
            .map(|actions| actions.as_slice())
            .unwrap_or(&[])
    }
}

pub fn decode_aquery_result(container: &analysis::ActionGraphContainer) -> Result<AqueryResult> {
    let mut targets: BTreeMap<String, AqueryTarget> = BTreeMap::new();
    let mut duplicate_labels: Vec<String> = Vec::new();
    for target in &container.targets {
        match targets.entry(target.label.clone()) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(AqueryTarget {
                    id: target.id,
                    label: target.label.clone(),
                });
            }
            std::collections::btree_map::Entry::Occupied(_) => {
                duplicate_labels.push(target.label.clone());
            }
        }
    }
    if !duplicate_labels.is_empty() {
        duplicate_labels.sort();
        duplicate_labels.dedup();
        tracing::warn!(
            target = "kestrel.bazel",
            labels = ?duplicate_labels,
            "aquery reported duplicate target labels; keeping the first of each"
        );
    }

    let mut actions: BTreeMap<u32, Vec<AqueryAction>> = BTreeMap::new();
    for action in &container.actions {
        actions.entry(action.target_id).or_default().push(AqueryAction {
            mnemonic: action.mnemonic.clone(),
            configuration_id: action.configuration_id,
            arguments: action.arguments.clone(),
        });
    }

    Ok(AqueryResult { targets, actions })
}

#[cfg(test)]
pub(crate) mod test_support {
    use kestrel_bazel_proto::analysis;

    pub(crate) fn sample_action_graph() -> analysis::ActionGraphContainer {
        analysis::ActionGraphContainer {
            actions: vec![
                analysis::Action {
                    target_id: 1,
                    mnemonic: "SwiftCompile".to_string(),
                    configuration_id: 1,
                    arguments: vec![
                        "bazel-out/host/bin/worker".to_string(),
                        "swiftc".to_string(),
                        "-sdk".to_string(),
                        "__BAZEL_XCODE_SDKROOT__".to_string(),
                        "App/Lib/A.swift".to_string(),
                        "App/Lib/B.swift".to_string(),
                        "-index-store-path".to_string(),
                        "bazel-out/ios-sim/bin/idx".to_string(),
                    ],
                    ..Default::default()
                },
                analysis::Action {
                    target_id: 2,
                    mnemonic: "ObjcCompile".to_string(),
                    configuration_id: 1,
                    arguments: vec![
                        "external/toolchain/clang".to_string(),
                        "-c".to_string(),
                        "App/Tests/Impl.m".to_string(),
                    ],
                    ..Default::default()
                },
            ],
            targets: vec![
                analysis::Target {
                    id: 1,
                    label: "//App:AppLib".to_string(),
                    rule_class_id: 1,
                },
                analysis::Target {
                    id: 2,
                    label: "//App:TestLib".to_string(),
                    rule_class_id: 2,
                },
            ],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::sample_action_graph;
    use super::*;
    use crate::config::test_support::base_config;

    #[test]
    fn expression_filters_compile_mnemonics() {
        let expr = build_aquery_expression(&base_config());
        assert_eq!(expr, "mnemonic('SwiftCompile|ObjcCompile', deps(//App))");
    }

    #[test]
    fn decodes_targets_and_actions() {
        let result = decode_aquery_result(&sample_action_graph()).unwrap();
        let lib = result.target_by_label("//App:AppLib").unwrap();
        assert_eq!(lib.id, 1);
        let actions = result.actions_for(lib.id);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].mnemonic, "SwiftCompile");
        assert!(result.actions_for(99).is_empty());
    }

    #[test]
    fn duplicate_labels_keep_first_id() {
        let mut container = sample_action_graph();
        container.targets.push(kestrel_bazel_proto::analysis::Target {
            id: 7,
            label: "//App:AppLib".to_string(),
            rule_class_id: 1,
        });
        let result = decode_aquery_result(&container).unwrap();
        assert_eq!(result.target_by_label("//App:AppLib").unwrap().id, 1);
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let a = decode_aquery_result(&sample_action_graph()).unwrap();
        let b = decode_aquery_result(&sample_action_graph()).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut container = sample_action_graph();
        container.actions[0].arguments.push("-DX".to_string());
        let c = decode_aquery_result(&container).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
