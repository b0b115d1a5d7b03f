use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kestrel_bazel::{
    BaseServerConfig, DefaultCommandRunner, DependencyRuleKind, TopLevelRuleKind,
    DEFAULT_APPLE_SUPPORT_REPO,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "kestrel",
    version,
    about = "A BSP server exposing Bazel Apple workspaces to SourceKit-LSP"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve BSP over stdio
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Command used to invoke Bazel (e.g. `bazel`, `./bazelw`)
    #[arg(long, default_value = "bazel")]
    bazel_wrapper: String,

    /// Top-level target pattern to discover; repeatable
    #[arg(long = "target", required = true)]
    targets: Vec<String>,

    /// Extra flag appended to indexing builds; repeatable
    #[arg(long = "index-flag", allow_hyphen_values = true)]
    index_flags: Vec<String>,

    /// Comma-separated glob list overriding the default watched files
    #[arg(long)]
    files_to_watch: Option<String>,

    /// Top-level rule kind to discover; repeatable (defaults to all)
    #[arg(long = "top-level-rule-to-discover")]
    top_level_rules: Vec<String>,

    /// Dependency rule kind to discover; repeatable (defaults to all)
    #[arg(long = "dependency-rule-to-discover")]
    dependency_rules: Vec<String>,

    /// Build whole top-level targets in prepare requests
    #[arg(long)]
    compile_top_level: bool,

    /// Target pattern excluded from top-level discovery; repeatable
    #[arg(long = "top-level-exclusion")]
    top_level_exclusions: Vec<String>,

    /// Target pattern excluded from dependency discovery; repeatable
    #[arg(long = "dependency-exclusion")]
    dependency_exclusions: Vec<String>,

    /// External repo providing the `//platforms` definitions
    #[arg(long, default_value = DEFAULT_APPLE_SUPPORT_REPO)]
    apple_support_repo: String,
}

fn main() {
    // Logs go to stderr; stdout belongs to JSON-RPC.
    let filter = EnvFilter::try_from_env("KESTREL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|err| {
        if err.use_stderr() {
            let _ = err.print();
            std::process::exit(1);
        }
        // --help / --version land here and exit 0.
        err.exit()
    });
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => {
            let config = base_config(args)?;
            kestrel_server::run_stdio(config, Arc::new(DefaultCommandRunner))
        }
    }
}

fn base_config(args: ServeArgs) -> Result<BaseServerConfig> {
    let top_level_rules = if args.top_level_rules.is_empty() {
        TopLevelRuleKind::ALL.to_vec()
    } else {
        args.top_level_rules
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<_>, _>>()
            .context("bad --top-level-rule-to-discover")?
    };
    let dependency_rules = if args.dependency_rules.is_empty() {
        DependencyRuleKind::ALL.to_vec()
    } else {
        args.dependency_rules
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<_>, _>>()
            .context("bad --dependency-rule-to-discover")?
    };

    let files_to_watch = args.files_to_watch.map(|globs| {
        globs
            .split(',')
            .map(|glob| glob.trim().to_string())
            .filter(|glob| !glob.is_empty())
            .collect()
    });

    Ok(BaseServerConfig {
        bazel_wrapper: args.bazel_wrapper,
        targets: args.targets,
        index_flags: args.index_flags,
        files_to_watch,
        compile_top_level: args.compile_top_level,
        top_level_rules,
        dependency_rules,
        top_level_exclusions: args.top_level_exclusions,
        dependency_exclusions: args.dependency_exclusions,
        apple_support_repo: args.apple_support_repo,
    })
}
