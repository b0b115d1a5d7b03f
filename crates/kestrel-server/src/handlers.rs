//! Post-initialize request and notification handlers.

use crate::server::InitContext;
use kestrel_bazel::{BuildTargetRecord, FileChange, FileChangeKind, Language, TopLevelRuleKind};
use kestrel_bsp::types::{self, methods};
use kestrel_bsp::{Dispatcher, RpcError};
use kestrel_core::{file_uri_to_path, path_to_file_uri, AbsPathBuf};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

pub(crate) fn register_post_init_handlers(dispatcher: &Arc<Dispatcher>, ctx: Arc<InitContext>) {
    {
        let ctx = Arc::clone(&ctx);
        dispatcher.on_request(
            methods::WORKSPACE_BUILD_TARGETS,
            move |_params: Option<Value>, _id| {
                let graph = ctx
                    .store
                    .fetch_targets()
                    .map_err(|err| RpcError::Internal(format!("{err:#}")))?;
                let targets = graph
                    .records
                    .iter()
                    .map(|record| build_target_for_record(record))
                    .collect();
                Ok::<_, RpcError>(types::WorkspaceBuildTargetsResult { targets })
            },
        );
    }

    {
        let ctx = Arc::clone(&ctx);
        dispatcher.on_request(
            methods::BUILD_TARGET_SOURCES,
            move |params: types::SourcesParams, _id| {
                let mut items = Vec::with_capacity(params.targets.len());
                for target in params.targets {
                    let sources = ctx
                        .store
                        .sources_for(&target.uri)
                        .map_err(|err| RpcError::InvalidParams(format!("{err:#}")))?;
                    let sources = sources
                        .into_iter()
                        .filter_map(|path| source_item_for_path(&path))
                        .collect();
                    items.push(types::SourcesItem { target, sources });
                }
                Ok::<_, RpcError>(types::SourcesResult { items })
            },
        );
    }

    {
        let ctx = Arc::clone(&ctx);
        dispatcher.on_request(
            methods::BUILD_TARGET_INVERSE_SOURCES,
            move |params: types::InverseSourcesParams, _id| {
                let path = file_uri_to_path(&params.text_document.uri)
                    .map_err(|err| RpcError::InvalidParams(format!("bad document uri: {err}")))?;
                let uris = ctx
                    .store
                    .bsp_uris_containing(&path.as_path().to_string_lossy())
                    .map_err(|err| RpcError::Internal(format!("{err:#}")))?;
                Ok::<_, RpcError>(types::InverseSourcesResult {
                    targets: uris
                        .into_iter()
                        .map(|uri| types::BuildTargetIdentifier { uri })
                        .collect(),
                })
            },
        );
    }

    {
        // Third-party sources live inside Bazel's external repos, which the
        // client cannot index from an archive; report none.
        dispatcher.on_request(
            methods::BUILD_TARGET_DEPENDENCY_SOURCES,
            move |params: types::DependencySourcesParams, _id| {
                Ok::<_, RpcError>(types::DependencySourcesResult {
                    items: params
                        .targets
                        .into_iter()
                        .map(|target| types::DependencySourcesItem {
                            target,
                            sources: Vec::new(),
                        })
                        .collect(),
                })
            },
        );
    }

    {
        // Resource bundling is a build concern; the indexer has no use for
        // resource URIs.
        dispatcher.on_request(
            methods::BUILD_TARGET_RESOURCES,
            move |params: types::ResourcesParams, _id| {
                Ok::<_, RpcError>(types::ResourcesResult {
                    items: params
                        .targets
                        .into_iter()
                        .map(|target| types::ResourcesItem {
                            target,
                            resources: Vec::new(),
                        })
                        .collect(),
                })
            },
        );
    }

    {
        let ctx = Arc::clone(&ctx);
        dispatcher.on_request(
            methods::SOURCEKIT_OPTIONS,
            move |params: types::TextDocumentSourceKitOptionsParams, _id| {
                sourcekit_options(&ctx, params)
            },
        );
    }

    {
        let ctx = Arc::clone(&ctx);
        dispatcher.on_request(
            methods::WAIT_FOR_BUILD_SYSTEM_UPDATES,
            move |_params: Option<Value>, _id| {
                ctx.store.wait_for_updates();
                Ok::<_, RpcError>(Value::Null)
            },
        );
    }

    {
        let ctx = Arc::clone(&ctx);
        dispatcher.on_notification(
            methods::WATCHED_FILES_DID_CHANGE,
            move |params: types::DidChangeWatchedFilesParams| {
                let changes: Vec<FileChange> = params
                    .changes
                    .iter()
                    .filter_map(file_change_for_event)
                    .collect();
                ctx.watcher.enqueue(changes);
                Ok(())
            },
        );
    }
}

fn build_target_for_record(record: &BuildTargetRecord) -> types::BuildTarget {
    let kind = TopLevelRuleKind::from_rule_class(&record.rule_class);
    let tag = match kind {
        Some(kind) if kind.test_bundle_rule().is_some() => "test",
        Some(_) => "application",
        None => "library",
    };
    let language_ids = match record.rule_class.as_str() {
        "swift_library" => vec!["swift".to_string()],
        "objc_library" => vec!["objective-c".to_string()],
        _ => vec!["swift".to_string(), "objective-c".to_string()],
    };

    types::BuildTarget {
        id: types::BuildTargetIdentifier {
            uri: record.bsp_uri.clone(),
        },
        display_name: Some(record.label.clone()),
        base_directory: None,
        tags: vec![tag.to_string()],
        language_ids,
        dependencies: Vec::new(),
        capabilities: types::BuildTargetCapabilities {
            can_compile: Some(true),
            can_test: Some(tag == "test"),
            can_run: Some(tag == "application"),
            can_debug: Some(false),
        },
    }
}

fn source_item_for_path(path: &str) -> Option<types::SourceItem> {
    let abs = AbsPathBuf::new(PathBuf::from(path)).ok()?;
    let uri = path_to_file_uri(&abs);

    let is_header = path.ends_with(".h");
    let language = if path.ends_with(".swift") {
        Some("swift".to_string())
    } else if path.ends_with(".m") || path.ends_with(".mm") || is_header {
        Some("objective-c".to_string())
    } else {
        None
    };

    let data = types::SourceKitSourceItemData {
        language,
        is_header: is_header.then_some(true),
    };
    Some(types::SourceItem {
        uri,
        kind: types::SOURCE_ITEM_KIND_FILE,
        generated: false,
        data_kind: Some(types::SOURCE_ITEM_DATA_KIND_SOURCEKIT.to_string()),
        data: serde_json::to_value(data).ok(),
    })
}

fn sourcekit_options(
    ctx: &InitContext,
    params: types::TextDocumentSourceKitOptionsParams,
) -> Result<Option<types::TextDocumentSourceKitOptionsResult>, RpcError> {
    let document_path = file_uri_to_path(&params.text_document.uri)
        .map_err(|err| RpcError::InvalidParams(format!("bad document uri: {err}")))?;
    let document_path = document_path.as_path().to_string_lossy().into_owned();

    // Headers have no compile action; answer without touching Bazel.
    if document_path.ends_with(".h") {
        return Ok(None);
    }
    if Language::of_source_path(&document_path).is_none() {
        return Ok(None);
    }

    let info = ctx
        .store
        .platform_info_for(&params.target.uri)
        .map_err(|err| RpcError::InvalidParams(format!("{err:#}")))?;
    let aquery = ctx
        .store
        .aquery_for_args_extraction()
        .map_err(|err| RpcError::Internal(format!("{err:#}")))?;

    let arguments = ctx
        .extractor
        .options_for(&aquery, &info, &document_path, &ctx.config)
        .map_err(|err| RpcError::Internal(format!("{err:#}")))?;

    match arguments {
        Some(arguments) if !arguments.is_empty() => {
            Ok(Some(types::TextDocumentSourceKitOptionsResult {
                compiler_arguments: arguments.as_ref().clone(),
                working_directory: Some(
                    ctx.config.execution_root.to_string_lossy().into_owned(),
                ),
            }))
        }
        _ => Ok(None),
    }
}

fn file_change_for_event(event: &types::FileEvent) -> Option<FileChange> {
    let kind = match event.change_type {
        types::FILE_CHANGE_CREATED => FileChangeKind::Created,
        types::FILE_CHANGE_CHANGED => FileChangeKind::Changed,
        types::FILE_CHANGE_DELETED => FileChangeKind::Deleted,
        other => {
            tracing::debug!(
                target = "kestrel.server",
                change_type = other,
                "ignoring unknown file change type"
            );
            return None;
        }
    };
    let path = file_uri_to_path(&event.uri).ok()?;
    Some(FileChange {
        path: path.as_path().to_string_lossy().into_owned(),
        kind,
    })
}
