//! The stateful target store.
//!
//! Owns the decoded cquery/aquery results behind a single lock, builds
//! them lazily on first use, and recomputes them when the file watcher
//! reports relevant changes. Handlers only ever see snapshots (`Arc`s of
//! immutable data), so a recompute never invalidates a reply in flight.

use crate::aquery::{self, AqueryResult};
use crate::commands::{BazelCommands, CommandRunner};
use crate::config::InitializedServerConfig;
use crate::cquery::{self, CqueryOutcome};
use crate::rules::TopLevelRuleKind;
use anyhow::{anyhow, Context, Result};
use kestrel_core::lock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// How a watched file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Absolute path of the changed file.
    pub path: String,
    pub kind: FileChangeKind,
}

/// Everything `buildTarget/prepare` and the extractor need to know about a
/// target's effective platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub target_label: String,
    /// The label to actually `bazel build`.
    pub build_label: String,
    pub parent_label: String,
    pub parent_kind: TopLevelRuleKind,
    /// Parent's `minimum_os_version`, empty when unset.
    pub min_os: String,
    pub cpu: String,
}

/// A BSP-visible target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTargetRecord {
    pub bsp_uri: String,
    pub label: String,
    pub rule_class: String,
    pub parent_label: String,
    /// Absolute source paths, sorted.
    pub source_paths: Vec<String>,
}

/// An immutable snapshot of one discovery generation.
#[derive(Debug, Default)]
pub struct TargetGraph {
    pub records: Vec<BuildTargetRecord>,
    outcome: CqueryOutcome,
    uri_to_label: BTreeMap<String, String>,
}

/// Derive the stable BSP URI for a Bazel label.
pub fn bsp_uri_for_label(label: &str) -> String {
    format!("bsp://{}", label.trim_start_matches('/').replace(':', "/"))
}

impl TargetGraph {
    fn new(outcome: CqueryOutcome) -> Self {
        let mut records = Vec::with_capacity(outcome.targets.len());
        let mut uri_to_label = BTreeMap::new();
        for target in &outcome.targets {
            let bsp_uri = bsp_uri_for_label(&target.label);
            uri_to_label.insert(bsp_uri.clone(), target.label.clone());
            records.push(BuildTargetRecord {
                bsp_uri,
                label: target.label.clone(),
                rule_class: target.rule_class.clone(),
                parent_label: target.parent_label.clone(),
                source_paths: target.source_paths.clone(),
            });
        }
        Self {
            records,
            outcome,
            uri_to_label,
        }
    }

    fn label_for_uri(&self, bsp_uri: &str) -> Result<&str> {
        self.uri_to_label
            .get(bsp_uri)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("unknown build target `{bsp_uri}`"))
    }

    fn record_for_label(&self, label: &str) -> Result<&BuildTargetRecord> {
        self.records
            .iter()
            .find(|record| record.label == label)
            .ok_or_else(|| anyhow!("unknown target label `{label}`"))
    }

    fn platform_info_for_label(&self, label: &str) -> Result<PlatformInfo> {
        let target = self
            .outcome
            .targets
            .iter()
            .find(|target| target.label == label)
            .ok_or_else(|| anyhow!("unknown target label `{label}`"))?;
        let parent = self
            .outcome
            .top_level
            .get(&target.parent_label)
            .ok_or_else(|| {
                anyhow!(
                    "target `{label}` has no top-level parent `{}` in the current graph",
                    target.parent_label
                )
            })?;
        Ok(PlatformInfo {
            target_label: target.label.clone(),
            build_label: target.build_label.clone(),
            parent_label: parent.label.clone(),
            parent_kind: parent.kind,
            min_os: parent.min_os.clone(),
            cpu: parent.kind.cpu().to_string(),
        })
    }

    fn uris_owning_path(&self, path: &str) -> Vec<String> {
        self.outcome
            .sources_to_targets
            .get(path)
            .map(|labels| labels.iter().map(|label| bsp_uri_for_label(label)).collect())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct StoreState {
    graph: Option<Arc<TargetGraph>>,
    aquery: Option<Arc<AqueryResult>>,
}

/// See the module docs; this is the single stateful component behind the
/// request handlers.
pub struct TargetStore {
    config: Arc<InitializedServerConfig>,
    runner: Arc<dyn CommandRunner>,
    commands: BazelCommands,
    state: Mutex<StoreState>,
}

impl TargetStore {
    pub fn new(config: Arc<InitializedServerConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        let commands = BazelCommands::new(&config);
        Self {
            config,
            runner,
            commands,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn config(&self) -> &InitializedServerConfig {
        &self.config
    }

    pub fn commands(&self) -> &BazelCommands {
        &self.commands
    }

    /// The current target list, computing it on first use.
    pub fn fetch_targets(&self) -> Result<Arc<TargetGraph>> {
        let mut state = lock(&self.state, "TargetStore.fetch_targets");
        self.ensure_graph(&mut state)
    }

    pub fn sources_for(&self, bsp_uri: &str) -> Result<Vec<String>> {
        let mut state = lock(&self.state, "TargetStore.sources_for");
        let graph = self.ensure_graph(&mut state)?;
        let label = graph.label_for_uri(bsp_uri)?;
        Ok(graph.record_for_label(label)?.source_paths.clone())
    }

    pub fn platform_info_for(&self, bsp_uri: &str) -> Result<PlatformInfo> {
        let mut state = lock(&self.state, "TargetStore.platform_info_for");
        let graph = self.ensure_graph(&mut state)?;
        let label = graph.label_for_uri(bsp_uri)?;
        graph.platform_info_for_label(label)
    }

    pub fn bsp_uris_containing(&self, path: &str) -> Result<Vec<String>> {
        let mut state = lock(&self.state, "TargetStore.bsp_uris_containing");
        let graph = self.ensure_graph(&mut state)?;
        Ok(graph.uris_owning_path(path))
    }

    /// The decoded compile-action graph for argument extraction.
    pub fn aquery_for_args_extraction(&self) -> Result<Arc<AqueryResult>> {
        let mut state = lock(&self.state, "TargetStore.aquery_for_args_extraction");
        self.ensure_aquery(&mut state)
    }

    /// Apply a debounced batch of watcher events.
    ///
    /// Deletions and changes resolve their owning targets against the old
    /// index; any creation throws the caches away (new files can introduce
    /// new targets) and resolves against the recomputed graph. Returns the
    /// BSP URIs of every affected target.
    pub fn process_file_changes(&self, changes: &[FileChange]) -> Result<BTreeSet<String>> {
        let mut state = lock(&self.state, "TargetStore.process_file_changes");
        let mut invalidated: BTreeSet<String> = BTreeSet::new();

        let old_graph = state.graph.clone();
        let mut saw_creation = false;
        for change in changes {
            match change.kind {
                FileChangeKind::Created => saw_creation = true,
                FileChangeKind::Changed | FileChangeKind::Deleted => {
                    if let Some(graph) = &old_graph {
                        invalidated.extend(graph.uris_owning_path(&change.path));
                    }
                }
            }
        }

        if saw_creation {
            state.graph = None;
            state.aquery = None;
            let graph = self.ensure_graph(&mut state)?;
            for change in changes {
                if change.kind == FileChangeKind::Created {
                    invalidated.extend(graph.uris_owning_path(&change.path));
                }
            }
        }

        Ok(invalidated)
    }

    pub fn clear_cache(&self) {
        let mut state = lock(&self.state, "TargetStore.clear_cache");
        state.graph = None;
        state.aquery = None;
    }

    /// Block until no recomputation is in flight.
    ///
    /// Recomputation happens under the state lock, so acquiring it is the
    /// barrier.
    pub fn wait_for_updates(&self) {
        let _state = lock(&self.state, "TargetStore.wait_for_updates");
    }

    fn ensure_graph(&self, state: &mut StoreState) -> Result<Arc<TargetGraph>> {
        if let Some(graph) = &state.graph {
            return Ok(Arc::clone(graph));
        }

        let expression = cquery::build_cquery_expression(&self.config.base);
        let command = self.commands.cquery(&expression, cquery::CQUERY_FLAGS);
        tracing::info!(target = "kestrel.bazel", %command, "running discovery cquery");
        let output = self
            .runner
            .run_shell(self.config.root_path.as_path(), &command)
            .context("discovery cquery failed")?;
        let decoded = kestrel_bazel_proto::decode_cquery_result(&output.stdout)
            .context("failed to decode cquery proto output")?;
        let outcome = cquery::decode_cquery_outcome(&decoded, &self.config)?;
        let graph = Arc::new(TargetGraph::new(outcome));
        tracing::info!(
            target = "kestrel.bazel",
            targets = graph.records.len(),
            "target graph rebuilt"
        );
        state.graph = Some(Arc::clone(&graph));
        Ok(graph)
    }

    fn ensure_aquery(&self, state: &mut StoreState) -> Result<Arc<AqueryResult>> {
        if let Some(result) = &state.aquery {
            return Ok(Arc::clone(result));
        }

        let expression = aquery::build_aquery_expression(&self.config.base);
        let command = self.commands.aquery(&expression, aquery::AQUERY_FLAGS);
        tracing::info!(target = "kestrel.bazel", %command, "running compile-action aquery");
        let output = self
            .runner
            .run_shell(self.config.root_path.as_path(), &command)
            .context("compile-action aquery failed")?;
        let container = kestrel_bazel_proto::decode_action_graph(&output.stdout)
            .context("failed to decode aquery proto output")?;
        let result = Arc::new(aquery::decode_aquery_result(&container)?);
        state.aquery = Some(Arc::clone(&result));
        Ok(result)
    }
}
