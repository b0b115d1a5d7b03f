//! Per-request compiler-argument extraction.
//!
//! Finds the compile action for a (target, document) pair in the cached
//! aquery result and hands it to the rewriter. Results are cached per
//! `(target label, file path)`; Swift shares one entry per target because
//! the whole module compiles in a single action.

use crate::aquery::AqueryResult;
use crate::config::InitializedServerConfig;
use crate::rewrite::{rewrite_compile_arguments, Language, RewriteRequest};
use crate::store::PlatformInfo;
use anyhow::Result;
use kestrel_core::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SWIFT_COMPILE_MNEMONIC: &str = "SwiftCompile";
const OBJC_COMPILE_MNEMONIC: &str = "ObjcCompile";

#[derive(Default)]
struct CacheState {
    /// Fingerprint of the aquery generation the entries were computed from.
    fingerprint: u64,
    entries: HashMap<(String, String), Option<Arc<Vec<String>>>>,
}

#[derive(Default)]
pub struct CompileArgsExtractor {
    cache: Mutex<CacheState>,
}

impl CompileArgsExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the indexer argv for `document_path` (absolute) in the given
    /// target. Returns `None` when no compile action covers the request —
    /// notably for headers, which never have one.
    pub fn options_for(
        &self,
        aquery: &AqueryResult,
        info: &PlatformInfo,
        document_path: &str,
        config: &InitializedServerConfig,
    ) -> Result<Option<Arc<Vec<String>>>> {
        if document_path.ends_with(".h") {
            return Ok(None);
        }
        let Some(language) = Language::of_source_path(document_path) else {
            return Ok(None);
        };

        // Swift compiles the whole module at once, so every file of the
        // target shares one cache entry.
        let file_key = match language {
            Language::Swift => String::new(),
            Language::ObjectiveC => document_path.to_string(),
        };
        let key = (info.target_label.clone(), file_key);

        {
            let mut cache = lock(&self.cache, "CompileArgsExtractor.options_for");
            if cache.fingerprint != aquery.fingerprint() {
                cache.entries.clear();
                cache.fingerprint = aquery.fingerprint();
            }
            if let Some(cached) = cache.entries.get(&key) {
                return Ok(cached.clone());
            }
        }

        let computed = self.compute(aquery, info, document_path, language, config);
        let mut cache = lock(&self.cache, "CompileArgsExtractor.options_for");
        cache.entries.insert(key, computed.clone());
        Ok(computed)
    }

    /// Drop every cached argv. Called when a watch cycle saw a create or
    /// delete, since those can change which actions exist.
    pub fn clear_cache(&self) {
        let mut cache = lock(&self.cache, "CompileArgsExtractor.clear_cache");
        cache.entries.clear();
        cache.fingerprint = 0;
    }

    fn compute(
        &self,
        aquery: &AqueryResult,
        info: &PlatformInfo,
        document_path: &str,
        language: Language,
        config: &InitializedServerConfig,
    ) -> Option<Arc<Vec<String>>> {
        let target = aquery.target_by_label(&info.target_label)?;
        let actions = aquery.actions_for(target.id);

        let relative_path = document_path
            .strip_prefix(&format!("{}/", config.root_path.as_path().to_string_lossy()))
            .unwrap_or(document_path);

        let action = match language {
            Language::Swift => actions
                .iter()
                .find(|action| action.mnemonic == SWIFT_COMPILE_MNEMONIC),
            Language::ObjectiveC => actions.iter().find(|action| {
                action.mnemonic == OBJC_COMPILE_MNEMONIC
                    && action
                        .arguments
                        .iter()
                        .any(|arg| arg == relative_path || arg.ends_with(&format!("/{relative_path}")))
            }),
        }?;

        let root = config.root_path.as_path().to_string_lossy().into_owned();
        let output_base = config.output_base.to_string_lossy().into_owned();
        let output_path = config.output_path.to_string_lossy().into_owned();
        let index_store = config.global_index_store_path().to_string_lossy().into_owned();
        let sdk_root = config
            .toolchain
            .sdk_root(info.parent_kind.sdk_name())
            .unwrap_or("")
            .to_string();
        let developer_dir = config.toolchain.developer_dir.clone().unwrap_or_default();

        let request = RewriteRequest {
            language,
            content_path: relative_path,
            root: &root,
            output_base: &output_base,
            output_path: &output_path,
            developer_dir: &developer_dir,
            sdk_root: &sdk_root,
            global_index_store: &index_store,
        };
        let rewritten = rewrite_compile_arguments(&action.arguments, &request);
        Some(Arc::new(rewritten))
    }
}
