//! Bazel integration for the kestrel build server.
//!
//! This crate turns a Bazel Apple workspace into the data a BSP client
//! needs:
//! - target discovery via one configured query (`cquery.rs`)
//! - compile actions via one action query (`aquery.rs`)
//! - a stateful, invalidatable store over both (`store.rs`)
//! - indexer-ready compile arguments (`rewrite.rs`, `extract.rs`)
//! - Bazel/Xcode process plumbing (`commands.rs`, `toolchain.rs`)

mod aquery;
mod commands;
mod config;
mod cquery;
mod extract;
mod rewrite;
mod rules;
mod store;
mod toolchain;

pub use crate::{
    aquery::{AqueryAction, AqueryResult, AqueryTarget},
    commands::{
        shell_quote, BazelCommands, CommandOutput, CommandRunner, DefaultCommandRunner,
        REMOTE_DOWNLOAD_REGEX, STARTUP_FLAGS,
    },
    config::{
        indexing_output_base, BaseServerConfig, InitializedServerConfig,
        DEFAULT_APPLE_SUPPORT_REPO, OUTPUT_BASE_SUFFIX,
    },
    cquery::{CqueryOutcome, DiscoveredTarget, TopLevelTarget},
    extract::CompileArgsExtractor,
    rewrite::{rewrite_compile_arguments, Language, RewriteRequest},
    rules::{DependencyRuleKind, TopLevelRuleKind, UnknownRuleKind},
    store::{
        bsp_uri_for_label, BuildTargetRecord, FileChange, FileChangeKind, PlatformInfo,
        TargetGraph, TargetStore,
    },
    toolchain::{discover_toolchain, AppleToolchain},
};
