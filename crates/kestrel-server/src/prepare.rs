//! `buildTarget/prepare`: the only long-running, cancelable handler.
//!
//! The handler resolves the build labels, spawns the Bazel build, parks
//! its responder in the termination handler, and returns, releasing the
//! dispatch lock so `$/cancelRequest` can reach the server while the
//! build runs. Bazel is always launched with `--preemptible`, so a
//! SIGTERM interrupts analysis and surfaces as exit code 8.

use crate::server::{InitContext, PrepareTask};
use kestrel_bazel::PlatformInfo;
use kestrel_bsp::types::{self, methods};
use kestrel_bsp::{Dispatcher, Outgoing, Responder, RpcError};
use kestrel_core::lock;
use kestrel_process::SpawnedProcess;
use serde_json::Value;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bazel's exit code for a build interrupted mid-flight.
const BAZEL_EXIT_INTERRUPTED: i32 = 8;

const STDERR_LOG_CHUNK_CHARS: usize = 800;

pub(crate) fn register_prepare_handler(dispatcher: &Arc<Dispatcher>, ctx: Arc<InitContext>) {
    let outgoing = dispatcher.outgoing().clone();
    dispatcher.on_request_deferred(
        methods::BUILD_TARGET_PREPARE,
        move |params: types::PrepareParams, responder| prepare(&ctx, &outgoing, params, responder),
    );
}

fn prepare(
    ctx: &Arc<InitContext>,
    outgoing: &Outgoing,
    params: types::PrepareParams,
    responder: Responder,
) -> Result<(), RpcError> {
    if params.targets.is_empty() {
        responder.reply_ok(Value::Null);
        return Ok(());
    }

    let mut infos: Vec<PlatformInfo> = Vec::with_capacity(params.targets.len());
    for target in &params.targets {
        infos.push(
            ctx.store
                .platform_info_for(&target.uri)
                .map_err(|err| RpcError::InvalidParams(format!("{err:#}")))?,
        );
    }

    let (labels, flags) = if ctx.config.base.compile_top_level {
        // Building the top-level targets lets rules_apple apply its own
        // platform transition; no extra flags needed.
        let mut labels: Vec<String> = infos.iter().map(|info| info.parent_label.clone()).collect();
        labels.sort();
        labels.dedup();
        (labels, Vec::new())
    } else {
        if infos.len() != 1 {
            return Err(RpcError::InvalidParams(format!(
                "prepare accepts exactly one target per request, got {}",
                infos.len()
            )));
        }
        let info = &infos[0];
        (
            vec![info.build_label.clone()],
            transition_flags(info, &ctx.config.base.apple_support_repo),
        )
    };

    let command = ctx.store.commands().build(&labels, &flags);
    tracing::info!(target = "kestrel.server", %command, "starting prepare build");

    let task_id = types::TaskId {
        id: responder.id().to_string(),
    };
    outgoing.notify(
        methods::TASK_START,
        types::TaskStartParams {
            task_id: task_id.clone(),
            origin_id: params.origin_id.clone(),
            event_time: Some(now_millis()),
            message: Some(format!("Building {}", labels.join(", "))),
        },
    );

    let process = match SpawnedProcess::spawn_shell(&command, ctx.config.root_path.as_path()) {
        Ok(process) => Arc::new(process),
        Err(err) => {
            outgoing.notify(
                methods::TASK_FINISH,
                task_finish(task_id, types::TASK_STATUS_ERROR, Some(err.to_string())),
            );
            return Err(RpcError::Internal(format!("failed to spawn bazel: {err}")));
        }
    };

    {
        let mut slot = lock(&ctx.prepare_slot, "prepare.store_task");
        *slot = Some(PrepareTask {
            id: responder.id().clone(),
            process: Arc::clone(&process),
        });
    }

    let slot = Arc::clone(&ctx.prepare_slot);
    let request_id = responder.id().clone();
    let outgoing = outgoing.clone();
    process.set_termination_handler(move |exit| {
        {
            let mut slot = lock(&slot, "prepare.finish_task");
            if slot.as_ref().is_some_and(|task| task.id == request_id) {
                *slot = None;
            }
        }

        match (exit.code, exit.terminated) {
            (Some(0), _) => {
                outgoing.notify(
                    methods::TASK_FINISH,
                    task_finish(task_id, types::TASK_STATUS_OK, None),
                );
                responder.reply_ok(Value::Null);
            }
            (Some(BAZEL_EXIT_INTERRUPTED), _) | (None, true) => {
                outgoing.notify(
                    methods::TASK_FINISH,
                    task_finish(
                        task_id,
                        types::TASK_STATUS_ERROR,
                        Some("build cancelled".to_string()),
                    ),
                );
                responder.reply_err(&RpcError::Cancelled);
            }
            (code, _) => {
                log_stderr_chunks(&exit.stderr);
                outgoing.notify(
                    methods::TASK_FINISH,
                    task_finish(
                        task_id,
                        types::TASK_STATUS_ERROR,
                        Some("build failed".to_string()),
                    ),
                );
                responder.reply_err(&RpcError::Internal(format!(
                    "bazel build failed (exit {}):\n{}",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                    exit.stderr
                )));
            }
        }
    });

    Ok(())
}

/// Replicate rules_apple's platform transition for a single library build.
fn transition_flags(info: &PlatformInfo, apple_support_repo: &str) -> Vec<String> {
    let platform = info.parent_kind.platform();
    let cpu = info.parent_kind.cpu();
    let cpu_prefix = info.parent_kind.cpu_prefix();
    let cpu_flag = info.parent_kind.cpu_flag_name();
    let min_os_flag = info.parent_kind.min_os_flag_name();
    let min_os = &info.min_os;

    vec![
        format!("--platforms=@{apple_support_repo}//platforms:{platform}_{cpu}"),
        format!("--{platform}_{cpu_flag}={cpu}"),
        format!("--apple_platform_type={platform}"),
        format!("--apple_split_cpu={cpu}"),
        format!("--{platform}_{min_os_flag}={min_os}"),
        format!("--cpu={cpu_prefix}_{cpu}"),
        format!("--minimum_os_version={min_os}"),
    ]
}

fn task_finish(
    task_id: types::TaskId,
    status: i32,
    message: Option<String>,
) -> types::TaskFinishParams {
    types::TaskFinishParams {
        task_id,
        event_time: Some(now_millis()),
        message,
        status,
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Bazel failure output can run to hundreds of kilobytes; emit it in
/// bounded chunks so log sinks with line limits keep all of it.
fn log_stderr_chunks(stderr: &str) {
    if stderr.is_empty() {
        return;
    }
    let chars: Vec<char> = stderr.chars().collect();
    let total_chunks = chars.len().div_ceil(STDERR_LOG_CHUNK_CHARS);
    for (index, chunk) in chars.chunks(STDERR_LOG_CHUNK_CHARS).enumerate() {
        let text: String = chunk.iter().collect();
        tracing::error!(
            target = "kestrel.server",
            chunk = index + 1,
            total_chunks,
            "bazel stderr: {text}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_bazel::TopLevelRuleKind;

    #[test]
    fn transition_flags_replicate_the_ios_transition() {
        let info = PlatformInfo {
            target_label: "//App:AppLib".to_string(),
            build_label: "//App:AppLib".to_string(),
            parent_label: "//App:App".to_string(),
            parent_kind: TopLevelRuleKind::IosApplication,
            min_os: "17.0".to_string(),
            cpu: "sim_arm64".to_string(),
        };
        let flags = transition_flags(&info, "build_bazel_apple_support");
        assert_eq!(
            flags,
            vec![
                "--platforms=@build_bazel_apple_support//platforms:ios_sim_arm64",
                "--ios_multi_cpus=sim_arm64",
                "--apple_platform_type=ios",
                "--apple_split_cpu=sim_arm64",
                "--ios_minimum_os=17.0",
                "--cpu=ios_sim_arm64",
                "--minimum_os_version=17.0",
            ]
        );
    }

    #[test]
    fn transition_flags_use_darwin_cpu_for_macos() {
        let info = PlatformInfo {
            target_label: "//Mac:Lib".to_string(),
            build_label: "//Mac:Lib".to_string(),
            parent_label: "//Mac:App".to_string(),
            parent_kind: TopLevelRuleKind::MacosApplication,
            min_os: "14.0".to_string(),
            cpu: "arm64".to_string(),
        };
        let flags = transition_flags(&info, "build_bazel_apple_support");
        assert!(flags.contains(&"--macos_cpus=arm64".to_string()));
        assert!(flags.contains(&"--cpu=darwin_arm64".to_string()));
        assert!(flags.contains(&"--platforms=@build_bazel_apple_support//platforms:macos_arm64".to_string()));
    }
}
