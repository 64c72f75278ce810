//! `arx` command-line front for the decision engine.
//!
//! Every command prints JSON on stdout and exits with one of the codes in
//! [`arx::exit_codes`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use arx::core::types::{ExecMode, ExecutionStatus};
use arx::decide::{DecideRequest, decide_and_dispatch, score_only};
use arx::error::exit_code_for;
use arx::exit_codes;
use arx::io::candidates::load_candidates;
use arx::io::init::{ArxPaths, InitOptions, init_workspace};
use arx::io::executor::ProcessRunner;
use arx::io::observability::TracingSink;
use arx::io::registry_store::load_registry;
use arx::io::state_store::WorkflowStateStore;
use arx::logging;

#[derive(Parser)]
#[command(
    name = "arx",
    version,
    about = "Score candidate actions, decide, and dispatch the chosen command"
)]
struct Cli {
    /// Project root containing `.arx/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// Debug-level engine logs on stderr when `RUST_LOG` is unset.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.arx/` with a default config and a sample registry.
    Init {
        /// Overwrite existing engine-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Rank candidates without deciding or dispatching.
    Score {
        /// JSON file with a candidate array or `{ "candidates": [...] }`.
        candidates: PathBuf,
    },
    /// Score, decide, and dispatch the chosen command.
    Decide(DecideArgs),
    /// Workflow state commands.
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
    /// Registry commands.
    Registry {
        #[command(subcommand)]
        command: RegistryCommand,
    },
}

#[derive(Args)]
struct DecideArgs {
    candidates: PathBuf,
    /// Log the resolved command without running it (default).
    #[arg(long, conflicts_with = "live")]
    dry_run: bool,
    /// Run the resolved command; also requires `safety.enable_live`.
    #[arg(long)]
    live: bool,
    #[arg(long)]
    flow: String,
    #[arg(long)]
    task: String,
    #[arg(long)]
    step: String,
    /// Placeholder value, repeatable.
    #[arg(long = "ctx", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    ctx: Vec<(String, String)>,
    /// Branch you expect to be on. The checked-out branch is still guarded;
    /// a protected name here blocks even when git reports another branch.
    #[arg(long)]
    branch: Option<String>,
}

#[derive(Subcommand)]
enum StateCommand {
    /// Print the workflow state document.
    Show,
}

#[derive(Subcommand)]
enum RegistryCommand {
    /// Load and validate the registry.
    Validate {
        /// Registry file (defaults to `.arx/registry.json`).
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = cli.root.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Score { candidates } => cmd_score(root, &candidates),
        Command::Decide(args) => cmd_decide(root, args),
        Command::State {
            command: StateCommand::Show,
        } => cmd_state_show(root),
        Command::Registry {
            command: RegistryCommand::Validate { path },
        } => cmd_registry_validate(root, path),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    print_json(&serde_json::json!({ "initialized": paths.arx_dir }))?;
    Ok(exit_codes::OK)
}

fn cmd_score(root: &Path, candidates: &Path) -> Result<i32> {
    let candidates = load_candidates(candidates)?;
    let report = score_only(root, &candidates)?;
    print_json(&report)?;
    Ok(exit_codes::OK)
}

fn cmd_decide(root: &Path, args: DecideArgs) -> Result<i32> {
    let request = DecideRequest {
        candidates: load_candidates(&args.candidates)?,
        mode: if args.live && !args.dry_run {
            ExecMode::Live
        } else {
            ExecMode::DryRun
        },
        flow_id: args.flow,
        task_id: args.task,
        step_id: args.step,
        context: args.ctx.into_iter().collect::<BTreeMap<_, _>>(),
        branch_override: args.branch,
    };
    let outcome = decide_and_dispatch(root, &request, ProcessRunner)?;
    print_json(&outcome)?;
    let code = match outcome.dispatch.as_ref().map(|result| result.status) {
        Some(ExecutionStatus::Blocked) => exit_codes::BLOCKED,
        Some(ExecutionStatus::Failure | ExecutionStatus::Cancelled) => {
            exit_codes::EXECUTION_FAILED
        }
        Some(ExecutionStatus::Success | ExecutionStatus::SkippedDuplicate) | None => {
            exit_codes::OK
        }
    };
    Ok(code)
}

fn cmd_state_show(root: &Path) -> Result<i32> {
    let paths = ArxPaths::new(root);
    let store = WorkflowStateStore::open(&paths, Arc::new(TracingSink));
    let document = store.document().context("read workflow state")?;
    print_json(&document)?;
    Ok(exit_codes::OK)
}

fn cmd_registry_validate(root: &Path, path: Option<PathBuf>) -> Result<i32> {
    let path = path.unwrap_or_else(|| ArxPaths::new(root).registry_path);
    let registry = load_registry(&path)?;
    let ids: Vec<&str> = registry.iter().map(|entry| entry.id.as_str()).collect();
    print_json(&serde_json::json!({ "valid": true, "entries": ids }))?;
    Ok(exit_codes::OK)
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Pretty JSON with a trailing newline on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
