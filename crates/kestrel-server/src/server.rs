//! Server state, lifecycle handlers, and the stdio bootstrap.
//!
//! The main thread owns the transport read loop; decoded messages are
//! handed to the dispatcher's pool. `build/initialize` derives the
//! [`InitializedServerConfig`], constructs the stateful components, and
//! registers every post-initialize handler. `build/exit` and transport
//! close leave through [`kestrel_core::exit_now`] so no destructor can
//! hang teardown mid-write.

use crate::watcher::{WatchDebouncer, DEBOUNCE_WINDOW};
use anyhow::{anyhow, Context, Result};
use kestrel_bazel::{
    discover_toolchain, indexing_output_base, BaseServerConfig, BazelCommands,
    CommandRunner, CompileArgsExtractor, InitializedServerConfig, TargetStore,
};
use kestrel_bsp::types::{self, methods};
use kestrel_bsp::{codec, Dispatcher, IncomingMessage, Outgoing, RequestId, RpcError};
use kestrel_core::{exit_now, file_uri_to_path, KESTREL_VERSION};
use kestrel_process::SpawnedProcess;
use serde_json::Value;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Default watcher globs when `--files-to-watch` is not given. Kept in
/// step with the extensions the debouncer actually processes.
const DEFAULT_WATCH_GLOBS: &[&str] = &[
    "**/*.swift",
    "**/*.h",
    "**/*.m",
    "**/BUILD",
    "**/BUILD.bazel",
];

pub(crate) struct ServerState {
    pub(crate) base: BaseServerConfig,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) shutdown_requested: AtomicBool,
    initialized: OnceLock<Arc<InitContext>>,
}

/// Everything that only exists after `build/initialize`.
pub(crate) struct InitContext {
    pub(crate) config: Arc<InitializedServerConfig>,
    pub(crate) store: Arc<TargetStore>,
    pub(crate) extractor: Arc<CompileArgsExtractor>,
    pub(crate) watcher: WatchDebouncer,
    /// The in-flight prepare build, if any; consulted by `$/cancelRequest`.
    pub(crate) prepare_slot: Arc<Mutex<Option<PrepareTask>>>,
}

pub(crate) struct PrepareTask {
    pub(crate) id: RequestId,
    pub(crate) process: Arc<SpawnedProcess>,
}

impl ServerState {
    pub(crate) fn initialized(&self) -> Result<Arc<InitContext>, RpcError> {
        self.initialized
            .get()
            .cloned()
            .ok_or_else(|| RpcError::InvalidParams("server is not initialized".to_string()))
    }
}

/// Run the server over stdin/stdout until the client exits or the
/// transport closes. Does not return.
pub fn run_stdio(base: BaseServerConfig, runner: Arc<dyn CommandRunner>) -> Result<()> {
    base.validate()?;

    let outgoing = Outgoing::stdout();
    let dispatcher = Dispatcher::new(outgoing);
    let state = Arc::new(ServerState {
        base,
        runner,
        shutdown_requested: AtomicBool::new(false),
        initialized: OnceLock::new(),
    });
    register_lifecycle_handlers(&dispatcher, &state);

    let stdin = std::io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    loop {
        match codec::read_raw_message(&mut reader) {
            Ok(Some(bytes)) => match serde_json::from_slice::<IncomingMessage>(&bytes) {
                Ok(message) => dispatcher.dispatch(message),
                Err(err) => {
                    tracing::error!(
                        target = "kestrel.server",
                        error = %err,
                        "dropping malformed message"
                    );
                }
            },
            Ok(None) => break,
            Err(err) => {
                tracing::error!(
                    target = "kestrel.server",
                    error = %err,
                    "transport read failed"
                );
                break;
            }
        }
    }

    // Transport closed. Kill whatever is still building, then leave without
    // running destructors: the writer may be mid-frame on another thread.
    if let Some(ctx) = state.initialized.get() {
        let slot = kestrel_core::lock(&ctx.prepare_slot, "run_stdio.teardown");
        if let Some(task) = slot.as_ref() {
            task.process.terminate();
        }
    }
    let code = if state.shutdown_requested.load(Ordering::SeqCst) {
        0
    } else {
        1
    };
    tracing::info!(target = "kestrel.server", code, "transport closed; exiting");
    exit_now(code)
}

fn register_lifecycle_handlers(dispatcher: &Arc<Dispatcher>, state: &Arc<ServerState>) {
    let weak_dispatcher = Arc::downgrade(dispatcher);

    {
        let state = Arc::clone(state);
        dispatcher.on_request(
            methods::INITIALIZE,
            move |params: types::InitializeBuildParams, _id| {
                let dispatcher = weak_dispatcher
                    .upgrade()
                    .ok_or_else(|| RpcError::Internal("dispatcher is gone".to_string()))?;
                initialize(&state, &dispatcher, params)
            },
        );
    }

    {
        let state = Arc::clone(state);
        dispatcher.on_request(methods::SHUTDOWN, move |_params: Option<Value>, _id| {
            state.shutdown_requested.store(true, Ordering::SeqCst);
            Ok::<_, RpcError>(Value::Null)
        });
    }

    {
        let state = Arc::clone(state);
        dispatcher.on_notification(methods::EXIT, move |_params: Option<Value>| {
            let code = if state.shutdown_requested.load(Ordering::SeqCst) {
                0
            } else {
                1
            };
            tracing::info!(target = "kestrel.server", code, "build/exit received");
            exit_now(code)
        });
    }

    {
        let state = Arc::clone(state);
        dispatcher.on_notification(methods::INITIALIZED, move |_params: Option<Value>| {
            let Ok(ctx) = state.initialized() else {
                return Ok(());
            };
            // Warm up Bazel's analysis cache for the indexing output base so
            // the first real cquery doesn't pay the cold-server cost. Runs
            // off the handler lock; the result is irrelevant.
            let runner = Arc::clone(&state.runner);
            std::thread::Builder::new()
                .name("kestrel-warmup".to_string())
                .spawn(move || {
                    let Some(first_target) = ctx.config.base.targets.first().cloned() else {
                        return;
                    };
                    let command = ctx.store.commands().query(&first_target, &[]);
                    match runner.run_shell(ctx.config.root_path.as_path(), &command) {
                        Ok(_) => {
                            tracing::debug!(target = "kestrel.server", "warm-up query finished")
                        }
                        Err(err) => tracing::debug!(
                            target = "kestrel.server",
                            error = %err,
                            "warm-up query failed"
                        ),
                    }
                })
                .map_err(|err| RpcError::internal(err))?;
            Ok(())
        });
    }

    {
        let state = Arc::clone(state);
        dispatcher.on_notification(
            methods::CANCEL_REQUEST,
            move |params: types::CancelParams| {
                let Ok(ctx) = state.initialized() else {
                    return Ok(());
                };
                let slot = kestrel_core::lock(&ctx.prepare_slot, "cancel_request");
                match slot.as_ref() {
                    Some(task) if task.id == params.id => {
                        tracing::info!(
                            target = "kestrel.server",
                            id = %params.id,
                            "cancelling in-flight prepare"
                        );
                        task.process.terminate();
                    }
                    _ => {
                        tracing::debug!(
                            target = "kestrel.server",
                            id = %params.id,
                            "cancel request does not match the running prepare"
                        );
                    }
                }
                Ok(())
            },
        );
    }
}

fn initialize(
    state: &Arc<ServerState>,
    dispatcher: &Arc<Dispatcher>,
    params: types::InitializeBuildParams,
) -> Result<types::InitializeBuildResult, RpcError> {
    if state.initialized.get().is_some() {
        return Err(RpcError::InvalidParams(
            "server is already initialized".to_string(),
        ));
    }

    let root_path = file_uri_to_path(&params.root_uri)
        .map_err(|err| RpcError::InvalidParams(format!("bad rootUri: {err}")))?;
    let config = derive_initialized_config(state, root_path.into_path_buf())
        .map_err(|err| RpcError::Internal(format!("{err:#}")))?;
    let config = Arc::new(config);

    let store = Arc::new(TargetStore::new(
        Arc::clone(&config),
        Arc::clone(&state.runner),
    ));
    let extractor = Arc::new(CompileArgsExtractor::new());
    let watcher = WatchDebouncer::new(
        Arc::clone(&store),
        Arc::clone(&extractor),
        dispatcher.outgoing().clone(),
        DEBOUNCE_WINDOW,
    );

    let ctx = Arc::new(InitContext {
        config: Arc::clone(&config),
        store,
        extractor,
        watcher,
        prepare_slot: Arc::new(Mutex::new(None)),
    });
    state
        .initialized
        .set(Arc::clone(&ctx))
        .map_err(|_| RpcError::InvalidParams("server is already initialized".to_string()))?;

    crate::handlers::register_post_init_handlers(dispatcher, Arc::clone(&ctx));
    crate::prepare::register_prepare_handler(dispatcher, ctx);

    tracing::info!(
        target = "kestrel.server",
        root = %config.root_path.display(),
        output_base = %config.output_base.display(),
        "initialized"
    );

    Ok(initialize_result(&config))
}

fn derive_initialized_config(
    state: &ServerState,
    root_path: PathBuf,
) -> Result<InitializedServerConfig> {
    let root_path = kestrel_core::AbsPathBuf::new(root_path)
        .map_err(|err| anyhow!("workspace root: {err}"))?;
    let root_uri = kestrel_core::path_to_file_uri(&root_path);
    let workspace_name = root_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string());

    let wrapper = &state.base.bazel_wrapper;
    let cwd = root_path.as_path();

    // The user's regular output base, from a cold `bazel info`.
    let user_base = state
        .runner
        .run_shell(cwd, &BazelCommands::info_cold(wrapper, "output_base"))
        .context("failed to query the user's output base")?;
    let output_base = indexing_output_base(user_base.stdout_string().trim());

    let output_path = state
        .runner
        .run_shell(
            cwd,
            &BazelCommands::info_with_output_base(wrapper, &output_base, "output_path"),
        )
        .context("failed to query the indexing output path")?;
    let execution_root = state
        .runner
        .run_shell(
            cwd,
            &BazelCommands::info_with_output_base(wrapper, &output_base, "execution_root"),
        )
        .context("failed to query the indexing execution root")?;

    let toolchain = discover_toolchain(state.runner.as_ref(), cwd, &state.base.sdk_names());

    Ok(InitializedServerConfig {
        base: state.base.clone(),
        root_uri,
        root_path,
        workspace_name,
        output_base,
        output_path: PathBuf::from(output_path.stdout_string().trim()),
        execution_root: PathBuf::from(execution_root.stdout_string().trim()),
        toolchain,
    })
}

fn initialize_result(config: &InitializedServerConfig) -> types::InitializeBuildResult {
    let language_ids = vec![
        "swift".to_string(),
        "objective-c".to_string(),
        "objective-cpp".to_string(),
    ];
    let provider = || {
        Some(types::LanguageProvider {
            language_ids: language_ids.clone(),
        })
    };

    let root = config.root_path.as_path().to_string_lossy();
    let globs: Vec<String> = match &config.base.files_to_watch {
        Some(globs) => globs.clone(),
        None => DEFAULT_WATCH_GLOBS.iter().map(|s| s.to_string()).collect(),
    };
    let watchers = globs
        .into_iter()
        .map(|glob| types::FileSystemWatcher {
            glob_pattern: format!("{root}/{glob}"),
            kind: Some(types::WATCH_KIND_ALL),
        })
        .collect();

    let data = types::SourceKitInitializeData {
        index_store_path: Some(
            config
                .global_index_store_path()
                .to_string_lossy()
                .into_owned(),
        ),
        index_database_path: Some(
            config
                .global_index_database_path()
                .to_string_lossy()
                .into_owned(),
        ),
        prepare_provider: Some(true),
        source_kit_options_provider: Some(true),
        watchers: Some(watchers),
        batch_size: if config.base.compile_top_level {
            None
        } else {
            Some(1)
        },
    };

    types::InitializeBuildResult {
        display_name: "kestrel".to_string(),
        version: KESTREL_VERSION.to_string(),
        bsp_version: types::BSP_VERSION.to_string(),
        capabilities: types::BuildServerCapabilities {
            compile_provider: provider(),
            test_provider: provider(),
            run_provider: provider(),
            debug_provider: provider(),
            inverse_sources_provider: Some(true),
            dependency_sources_provider: Some(true),
            resources_provider: Some(true),
            build_target_changed_provider: Some(true),
            can_reload: Some(true),
        },
        data: serde_json::to_value(data).ok(),
    }
}
