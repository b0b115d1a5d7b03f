//! Configured-query execution and target-graph reconstruction.
//!
//! One cquery discovers everything the server serves: the top-level
//! targets matching the configured rule kinds, every library target
//! underneath them, and the source files those libraries own. The proto
//! output does not follow `alias` targets or collapse test bundles, so
//! both are resolved manually while walking the graph.

use crate::config::{BaseServerConfig, InitializedServerConfig};
use crate::rules::TopLevelRuleKind;
use anyhow::{Context, Result};
use kestrel_bazel_proto::{analysis, query};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Flags for the discovery cquery. Aspects and tool/implicit deps would
/// drag in toolchain targets the server never serves.
pub const CQUERY_FLAGS: &[&str] = &[
    "--noinclude_aspects",
    "--notool_deps",
    "--noimplicit_deps",
    "--output",
    "proto",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopLevelTarget {
    pub label: String,
    pub kind: TopLevelRuleKind,
    /// Position of the configured target in the cquery result; stable for
    /// the lifetime of one cache generation.
    pub configured_target_id: u32,
    /// The `minimum_os_version` attribute, empty when unset.
    pub min_os: String,
}

/// A target served over BSP: a top-level target or a library underneath one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTarget {
    pub label: String,
    pub rule_class: String,
    /// The label to `bazel build` for this target. Differs from `label`
    /// for libraries reached through a test bundle, which can only be
    /// built via their owning test target.
    pub build_label: String,
    /// The top-level target that anchors this target's configuration.
    pub parent_label: String,
    /// Absolute paths of the target's direct workspace sources.
    pub source_paths: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CqueryOutcome {
    pub top_level: BTreeMap<String, TopLevelTarget>,
    /// Sorted by label; includes the top-level targets themselves.
    pub targets: Vec<DiscoveredTarget>,
    /// Absolute source path to the labels of every target owning it.
    pub sources_to_targets: BTreeMap<String, BTreeSet<String>>,
}

/// Build the discovery expression:
///
/// ```text
/// let topLevelTargets = kind("<topLevelKinds>", deps(<userTargets>)) except (…) in
///   $topLevelTargets union (kind("<depKinds|alias|source file|bundles>", deps($topLevelTargets)) except (…))
/// ```
pub fn build_cquery_expression(config: &BaseServerConfig) -> String {
    let user_targets = config.targets.join(" + ");

    let top_kinds: Vec<&str> = config
        .top_level_rules
        .iter()
        .map(|kind| kind.rule_class())
        .collect();
    let top_kinds = top_kinds.join("|");

    let mut dep_kinds: Vec<String> = config
        .dependency_rules
        .iter()
        .map(|kind| kind.rule_class().to_string())
        .collect();
    dep_kinds.push("alias".to_string());
    dep_kinds.push("source file".to_string());
    for kind in &config.top_level_rules {
        if let Some(bundle) = kind.test_bundle_rule() {
            let bundle = bundle.to_string();
            if !dep_kinds.contains(&bundle) {
                dep_kinds.push(bundle);
            }
        }
    }
    let dep_kinds = dep_kinds.join("|");

    let mut top_expr = format!("kind(\"{top_kinds}\", deps({user_targets}))");
    if !config.top_level_exclusions.is_empty() {
        top_expr = format!(
            "({top_expr} except ({}))",
            config.top_level_exclusions.join(" + ")
        );
    }

    let mut dep_expr = format!("kind(\"{dep_kinds}\", deps($topLevelTargets))");
    if !config.dependency_exclusions.is_empty() {
        dep_expr = format!(
            "({dep_expr} except ({}))",
            config.dependency_exclusions.join(" + ")
        );
    }

    format!("let topLevelTargets = {top_expr} in $topLevelTargets union ({dep_expr})")
}

struct RuleRecord<'a> {
    rule: &'a query::Rule,
    configuration_checksum: &'a str,
    configured_target_id: u32,
}

/// Reconstruct the target graph from a decoded cquery result.
pub fn decode_cquery_outcome(
    result: &analysis::CqueryResult,
    config: &InitializedServerConfig,
) -> Result<CqueryOutcome> {
    let mut rules: BTreeMap<&str, RuleRecord<'_>> = BTreeMap::new();
    let mut duplicates: Vec<String> = Vec::new();
    let mut source_files: BTreeSet<&str> = BTreeSet::new();

    for (index, configured) in result.results.iter().enumerate() {
        let Some(target) = &configured.target else {
            continue;
        };
        match target.discriminator() {
            Some(query::target::Discriminator::Rule) => {
                let Some(rule) = &target.rule else { continue };
                let checksum = configured
                    .configuration
                    .as_ref()
                    .map(|c| c.checksum.as_str())
                    .unwrap_or("");
                match rules.entry(rule.name.as_str()) {
                    std::collections::btree_map::Entry::Vacant(entry) => {
                        entry.insert(RuleRecord {
                            rule,
                            configuration_checksum: checksum,
                            configured_target_id: index as u32,
                        });
                    }
                    std::collections::btree_map::Entry::Occupied(entry) => {
                        if entry.get().configuration_checksum != checksum {
                            duplicates.push(rule.name.clone());
                        }
                    }
                }
            }
            Some(query::target::Discriminator::SourceFile) => {
                if let Some(file) = &target.source_file {
                    source_files.insert(file.name.as_str());
                }
            }
            _ => {}
        }
    }

    if !duplicates.is_empty() {
        duplicates.sort();
        duplicates.dedup();
        tracing::warn!(
            target = "kestrel.bazel",
            labels = ?duplicates,
            "targets appear under multiple configurations; keeping the first variant of each"
        );
    }

    let mut top_level: BTreeMap<String, TopLevelTarget> = BTreeMap::new();
    for (label, record) in &rules {
        let Some(kind) = TopLevelRuleKind::from_rule_class(&record.rule.rule_class) else {
            continue;
        };
        if !config.base.top_level_rules.contains(&kind) {
            continue;
        }
        let min_os = record
            .rule
            .string_attribute("minimum_os_version")
            .unwrap_or("")
            .to_string();
        top_level.insert(
            (*label).to_string(),
            TopLevelTarget {
                label: (*label).to_string(),
                kind,
                configured_target_id: record.configured_target_id,
                min_os,
            },
        );
    }

    let dep_kinds: BTreeSet<&str> = config
        .base
        .dependency_rules
        .iter()
        .map(|kind| kind.rule_class())
        .collect();
    let bundle_kinds: BTreeSet<&str> = config
        .base
        .top_level_rules
        .iter()
        .filter_map(|kind| kind.test_bundle_rule())
        .collect();

    // label → (parent top-level label, build label). Top-level targets are
    // iterated in sorted order, so on disagreement the smallest parent
    // label wins deterministically.
    let mut assignments: BTreeMap<String, (String, String)> = BTreeMap::new();
    let mut conflicting: Vec<String> = Vec::new();

    for top_label in top_level.keys() {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<(&str, bool)> = VecDeque::new();
        queue.push_back((top_label.as_str(), false));

        while let Some((label, via_bundle)) = queue.pop_front() {
            let label = resolve_alias(label, &rules);
            if !visited.insert(label) {
                continue;
            }
            let Some(record) = rules.get(label) else {
                continue;
            };
            let rule_class = record.rule.rule_class.as_str();
            let through_bundle = via_bundle || bundle_kinds.contains(rule_class);

            if dep_kinds.contains(rule_class) {
                let build_label = if via_bundle {
                    top_label.clone()
                } else {
                    label.to_string()
                };
                match assignments.entry(label.to_string()) {
                    std::collections::btree_map::Entry::Vacant(entry) => {
                        entry.insert((top_label.clone(), build_label));
                    }
                    std::collections::btree_map::Entry::Occupied(entry) => {
                        let (existing_parent, _) = entry.get();
                        if !same_platform_configuration(&top_level, existing_parent, top_label) {
                            conflicting.push(label.to_string());
                        }
                    }
                }
            }

            for input in &record.rule.rule_input {
                if !visited.contains(input.as_str()) {
                    queue.push_back((input.as_str(), through_bundle));
                }
            }
        }
    }

    if !conflicting.is_empty() {
        conflicting.sort();
        conflicting.dedup();
        tracing::warn!(
            target = "kestrel.bazel",
            labels = ?conflicting,
            "targets are reachable from top-level parents with differing configurations; \
             keeping the parent that sorts first"
        );
    }

    let mut targets: Vec<DiscoveredTarget> = Vec::new();
    let mut sources_to_targets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    let mut push_target =
        |label: &str, rule_class: &str, parent: &str, build_label: &str| -> Result<()> {
            let record = rules
                .get(label)
                .with_context(|| format!("rule `{label}` vanished from the cquery result"))?;
            let mut source_paths = Vec::new();
            for src in record.rule.string_list_attribute("srcs") {
                if !source_files.contains(src.as_str()) {
                    continue;
                }
                if let Some(path) = source_label_to_path(src, config) {
                    sources_to_targets
                        .entry(path.clone())
                        .or_default()
                        .insert(label.to_string());
                    source_paths.push(path);
                }
            }
            source_paths.sort();
            targets.push(DiscoveredTarget {
                label: label.to_string(),
                rule_class: rule_class.to_string(),
                build_label: build_label.to_string(),
                parent_label: parent.to_string(),
                source_paths,
            });
            Ok(())
        };

    for (label, top) in &top_level {
        let rule_class = top.kind.rule_class();
        push_target(label, rule_class, label, label)?;
    }
    for (label, (parent, build_label)) in &assignments {
        let record = rules
            .get(label.as_str())
            .with_context(|| format!("rule `{label}` vanished from the cquery result"))?;
        push_target(label, &record.rule.rule_class.clone(), parent, build_label)?;
    }

    targets.sort_by(|a, b| a.label.cmp(&b.label));

    Ok(CqueryOutcome {
        top_level,
        targets,
        sources_to_targets,
    })
}

/// Follow `alias` rules to their `actual` target. Chains are bounded to
/// guard against malformed output; Bazel itself rejects alias cycles.
fn resolve_alias<'a>(mut label: &'a str, rules: &BTreeMap<&'a str, RuleRecord<'a>>) -> &'a str {
    for _ in 0..32 {
        let Some(record) = rules.get(label) else {
            return label;
        };
        if record.rule.rule_class != "alias" {
            return label;
        }
        match record.rule.string_attribute("actual") {
            Some(actual) => label = resolve_label_str(actual, rules),
            None => return label,
        }
    }
    label
}

/// `string_attribute` hands back a `&str` borrowed from the rule; map it
/// into the key domain of `rules` so lifetimes line up.
fn resolve_label_str<'a>(label: &str, rules: &BTreeMap<&'a str, RuleRecord<'a>>) -> &'a str {
    match rules.get_key_value(label) {
        Some((key, _)) => key,
        None => "",
    }
}

fn same_platform_configuration(
    top_level: &BTreeMap<String, TopLevelTarget>,
    a: &str,
    b: &str,
) -> bool {
    match (top_level.get(a), top_level.get(b)) {
        (Some(a), Some(b)) => {
            a.kind.platform() == b.kind.platform()
                && a.kind.cpu() == b.kind.cpu()
                && a.min_os == b.min_os
        }
        _ => false,
    }
}

/// Convert a workspace source label (`//pkg:sub/file.swift`) into an
/// absolute path. External-repo labels have no workspace path.
fn source_label_to_path(label: &str, config: &InitializedServerConfig) -> Option<String> {
    let rest = label.strip_prefix("//")?;
    let (package, file) = rest.split_once(':')?;
    let root = config.root_path.as_path().to_string_lossy();
    if package.is_empty() {
        Some(format!("{root}/{file}"))
    } else {
        Some(format!("{root}/{package}/{file}"))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::test_support::initialized_config;

    #[test]
    fn expression_nests_top_level_targets_into_dependency_scan() {
        let config = initialized_config();
        let expr = build_cquery_expression(&config.base);
        assert!(expr.starts_with(
            "let topLevelTargets = kind(\"ios_application|ios_unit_test\", deps(//App))"
        ));
        assert!(expr.contains("union"));
        assert!(expr.contains("alias"));
        assert!(expr.contains("source file"));
        assert!(expr.contains("ios_test_bundle"));
        assert!(expr.contains("deps($topLevelTargets)"));
    }

    #[test]
    fn exclusions_are_subtracted() {
        let mut config = initialized_config();
        config.base.top_level_exclusions = vec!["//Vendored/...".to_string()];
        config.base.dependency_exclusions = vec!["//ThirdParty/...".to_string()];
        let expr = build_cquery_expression(&config.base);
        assert!(expr.contains("except (//Vendored/...)"));
        assert!(expr.contains("except (//ThirdParty/...)"));
    }

    #[test]
    fn decodes_top_level_and_dependency_targets() {
        let config = initialized_config();
        let outcome = decode_cquery_outcome(&sample_cquery_result(), &config).unwrap();

        let labels: Vec<&str> = outcome.targets.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(
            labels,
            vec!["//App:App", "//App:AppLib", "//App:AppTests", "//App:TestLib"]
        );

        let app = outcome.top_level.get("//App:App").unwrap();
        assert_eq!(app.kind, crate::rules::TopLevelRuleKind::IosApplication);
        assert_eq!(app.min_os, "17.0");
    }

    #[test]
    fn alias_is_followed_to_the_library() {
        let config = initialized_config();
        let outcome = decode_cquery_outcome(&sample_cquery_result(), &config).unwrap();
        let lib = outcome
            .targets
            .iter()
            .find(|t| t.label == "//App:AppLib")
            .unwrap();
        assert_eq!(lib.parent_label, "//App:App");
        assert_eq!(lib.build_label, "//App:AppLib");
    }

    #[test]
    fn sources_are_absolute_and_indexed() {
        let config = initialized_config();
        let outcome = decode_cquery_outcome(&sample_cquery_result(), &config).unwrap();
        let lib = outcome
            .targets
            .iter()
            .find(|t| t.label == "//App:AppLib")
            .unwrap();
        assert_eq!(
            lib.source_paths,
            vec!["/ws/App/Lib/A.swift", "/ws/App/Lib/B.swift"]
        );
        assert!(outcome
            .sources_to_targets
            .get("/ws/App/Lib/A.swift")
            .unwrap()
            .contains("//App:AppLib"));
    }

    #[test]
    fn bundle_deps_build_via_their_test_target() {
        let config = initialized_config();
        let outcome = decode_cquery_outcome(&sample_cquery_result(), &config).unwrap();
        let test_lib = outcome
            .targets
            .iter()
            .find(|t| t.label == "//App:TestLib")
            .unwrap();
        assert_eq!(test_lib.parent_label, "//App:AppTests");
        assert_eq!(test_lib.build_label, "//App:AppTests");
    }

    #[test]
    fn every_target_has_a_top_level_parent() {
        let config = initialized_config();
        let outcome = decode_cquery_outcome(&sample_cquery_result(), &config).unwrap();
        for target in &outcome.targets {
            assert!(
                outcome.top_level.contains_key(&target.parent_label),
                "{} has non-top-level parent {}",
                target.label,
                target.parent_label
            );
        }
    }

    #[test]
    fn duplicate_configurations_keep_first_variant() {
        let config = initialized_config();
        let mut result = sample_cquery_result();
        result.results.push(configured(
            rule_target(
                "//App:AppLib",
                "swift_library",
                &["//App:Lib/A.swift"],
                &["//App:Lib/A.swift"],
                &[],
            ),
            "cfg-other",
        ));
        let outcome = decode_cquery_outcome(&result, &config).unwrap();
        let lib = outcome
            .targets
            .iter()
            .find(|t| t.label == "//App:AppLib")
            .unwrap();
        // The first variant has both sources.
        assert_eq!(lib.source_paths.len(), 2);
    }
}
