//! BSP payload types, kept to the subset of the protocol the server
//! implements (plus the SourceKit extension fields the client reads).

use crate::rpc::RequestId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BSP_VERSION: &str = "2.2.0";

/// Wire method names.
pub mod methods {
    pub const INITIALIZE: &str = "build/initialize";
    pub const INITIALIZED: &str = "build/initialized";
    pub const SHUTDOWN: &str = "build/shutdown";
    pub const EXIT: &str = "build/exit";
    pub const WORKSPACE_BUILD_TARGETS: &str = "workspace/buildTargets";
    pub const WAIT_FOR_BUILD_SYSTEM_UPDATES: &str = "workspace/waitForBuildSystemUpdates";
    pub const BUILD_TARGET_SOURCES: &str = "buildTarget/sources";
    pub const BUILD_TARGET_INVERSE_SOURCES: &str = "buildTarget/inverseSources";
    pub const BUILD_TARGET_DEPENDENCY_SOURCES: &str = "buildTarget/dependencySources";
    pub const BUILD_TARGET_RESOURCES: &str = "buildTarget/resources";
    pub const BUILD_TARGET_PREPARE: &str = "buildTarget/prepare";
    pub const SOURCEKIT_OPTIONS: &str = "textDocument/sourceKitOptions";
    pub const WATCHED_FILES_DID_CHANGE: &str = "workspace/didChangeWatchedFiles";
    pub const CANCEL_REQUEST: &str = "$/cancelRequest";
    pub const BUILD_TARGET_DID_CHANGE: &str = "buildTarget/didChange";
    pub const TASK_START: &str = "build/taskStart";
    pub const TASK_FINISH: &str = "build/taskFinish";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeBuildParams {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub bsp_version: String,
    pub root_uri: String,
    #[serde(default)]
    pub capabilities: BuildClientCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildClientCapabilities {
    #[serde(default)]
    pub language_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeBuildResult {
    pub display_name: String,
    pub version: String,
    pub bsp_version: String,
    pub capabilities: BuildServerCapabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_provider: Option<LanguageProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_provider: Option<LanguageProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_provider: Option<LanguageProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_provider: Option<LanguageProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverse_sources_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependency_sources_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_target_changed_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_reload: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageProvider {
    pub language_ids: Vec<String>,
}

/// The SourceKit extension payload in the `data` field of
/// `InitializeBuildResult`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitInitializeData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_store_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_database_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepare_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_kit_options_provider: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchers: Option<Vec<FileSystemWatcher>>,
    /// Largest `buildTarget/prepare` batch the server accepts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,
}

/// LSP-style watcher registration. `kind` is the create/change/delete
/// bitmask; `None` means all three.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemWatcher {
    pub glob_pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<u32>,
}

pub const WATCH_KIND_ALL: u32 = 0b111;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildTargetIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTarget {
    pub id: BuildTargetIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub language_ids: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<BuildTargetIdentifier>,
    pub capabilities: BuildTargetCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTargetCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_compile: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_test: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_run: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_debug: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceBuildTargetsResult {
    pub targets: Vec<BuildTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesResult {
    pub items: Vec<SourcesItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesItem {
    pub target: BuildTargetIdentifier,
    pub sources: Vec<SourceItem>,
}

pub const SOURCE_ITEM_KIND_FILE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceItem {
    pub uri: String,
    pub kind: i32,
    pub generated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// SourceKit extension data attached to a [`SourceItem`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceKitSourceItemData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_header: Option<bool>,
}

pub const SOURCE_ITEM_DATA_KIND_SOURCEKIT: &str = "sourceKit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InverseSourcesParams {
    pub text_document: TextDocumentIdentifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InverseSourcesResult {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySourcesParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySourcesResult {
    pub items: Vec<DependencySourcesItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySourcesItem {
    pub target: BuildTargetIdentifier,
    /// URIs of dependency source archives; Bazel keeps third-party sources
    /// inside its own repositories, so this is typically empty.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesParams {
    pub targets: Vec<BuildTargetIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesResult {
    pub items: Vec<ResourcesItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesItem {
    pub target: BuildTargetIdentifier,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentSourceKitOptionsParams {
    pub text_document: TextDocumentIdentifier,
    pub target: BuildTargetIdentifier,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextDocumentSourceKitOptionsResult {
    pub compiler_arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareParams {
    pub targets: Vec<BuildTargetIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartParams {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub const TASK_STATUS_OK: i32 = 1;
pub const TASK_STATUS_ERROR: i32 = 2;
pub const TASK_STATUS_CANCELLED: i32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFinishParams {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: i32,
}

pub const BUILD_TARGET_EVENT_CREATED: i32 = 1;
pub const BUILD_TARGET_EVENT_CHANGED: i32 = 2;
pub const BUILD_TARGET_EVENT_DELETED: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidChangeBuildTargetParams {
    pub changes: Vec<BuildTargetEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTargetEvent {
    pub target: BuildTargetIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<i32>,
}

pub const FILE_CHANGE_CREATED: i32 = 1;
pub const FILE_CHANGE_CHANGED: i32 = 2;
pub const FILE_CHANGE_DELETED: i32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidChangeWatchedFilesParams {
    pub changes: Vec<FileEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub uri: String,
    #[serde(rename = "type")]
    pub change_type: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_result_serializes_camel_case() {
        let result = InitializeBuildResult {
            display_name: "kestrel".to_string(),
            version: "0.1.0".to_string(),
            bsp_version: BSP_VERSION.to_string(),
            capabilities: BuildServerCapabilities {
                compile_provider: Some(LanguageProvider {
                    language_ids: vec!["swift".to_string()],
                }),
                build_target_changed_provider: Some(true),
                ..Default::default()
            },
            data: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["bspVersion"], "2.2.0");
        assert_eq!(value["capabilities"]["compileProvider"]["languageIds"][0], "swift");
        assert_eq!(value["capabilities"]["buildTargetChangedProvider"], true);
        assert!(value["capabilities"].get("testProvider").is_none());
    }

    #[test]
    fn initialize_params_tolerate_missing_optional_fields() {
        let params: InitializeBuildParams = serde_json::from_value(json!({
            "rootUri": "file:///ws"
        }))
        .unwrap();
        assert_eq!(params.root_uri, "file:///ws");
        assert!(params.capabilities.language_ids.is_empty());
    }

    #[test]
    fn file_events_use_the_lsp_type_field() {
        let params: DidChangeWatchedFilesParams = serde_json::from_value(json!({
            "changes": [{"uri": "file:///ws/A.swift", "type": 2}]
        }))
        .unwrap();
        assert_eq!(params.changes[0].change_type, FILE_CHANGE_CHANGED);
    }

    #[test]
    fn sourcekit_data_round_trips() {
        let data = SourceKitInitializeData {
            index_store_path: Some("/tmp/store".to_string()),
            index_database_path: Some("/tmp/db".to_string()),
            prepare_provider: Some(true),
            source_kit_options_provider: Some(true),
            watchers: Some(vec![FileSystemWatcher {
                glob_pattern: "/ws/**/*.swift".to_string(),
                kind: Some(WATCH_KIND_ALL),
            }]),
            batch_size: Some(1),
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["indexStorePath"], "/tmp/store");
        assert_eq!(value["watchers"][0]["globPattern"], "/ws/**/*.swift");
        assert_eq!(value["batchSize"], 1);

        let back: SourceKitInitializeData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }
}
