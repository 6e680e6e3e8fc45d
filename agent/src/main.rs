//! Tool-calling agent for Shopify theme edits.
//!
//! `agent run` drives a model through a sandboxed edit session over a theme
//! workspace; `agent apply` validates and applies a plan file offline;
//! `agent baseline` shows or regenerates the checker baseline.

use std::path::{Path, PathBuf};

use agent::core::plan::PlanError;
use agent::exit_codes;
use agent::io::config::{AgentConfig, DEFAULT_CONFIG_FILE, load_config};
use agent::io::llm::OpenAiCompatClient;
use agent::io::run_log::RunStatus;
use agent::io::task::MissingTask;
use agent::logging;
use agent::observer::TracingObserver;
use agent::session::{SessionPaths, apply_plan_file, baseline_command, run_session};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "agent",
    version,
    about = "Tool-calling agent runtime for Shopify theme edits"
)]
struct Cli {
    /// Config file; a missing file means built-in defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Log run progress to stderr (`RUST_LOG` takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent on a theme workspace until it is done or fails.
    Run(RunArgs),
    /// Validate and apply a plan file without a model.
    Apply {
        #[arg(long)]
        workdir: PathBuf,
        /// JSON plan document (`{"ops": [...]}`).
        #[arg(long)]
        plan: PathBuf,
        /// Record the plan and its outcome in a new run directory here.
        #[arg(long)]
        runs_dir: Option<PathBuf>,
    },
    /// Show the checker baseline for a workspace, or regenerate it.
    Baseline {
        #[arg(long)]
        workdir: PathBuf,
        #[arg(long, default_value = "runs")]
        runs_dir: PathBuf,
        /// Run the checker and overwrite the stored baseline.
        #[arg(long)]
        regenerate: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Theme workspace root.
    #[arg(long)]
    workdir: PathBuf,
    /// Directory with `task.md` and the human resume signal file.
    #[arg(long, default_value = "tasks")]
    tasks_dir: PathBuf,
    #[arg(long, default_value = "runs")]
    runs_dir: PathBuf,
    #[arg(long)]
    max_iters: Option<u32>,
    /// Preview URL for browser checks; skips starting the preview server.
    #[arg(long)]
    base_url: Option<String>,
    /// Comma-separated storefront routes to verify.
    #[arg(long, value_delimiter = ',')]
    routes: Option<Vec<String>>,
    #[arg(long)]
    no_checker: bool,
    #[arg(long)]
    no_browser: bool,
    /// Default timeout for sandboxed commands.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl RunArgs {
    fn apply_overrides(&self, cfg: &mut AgentConfig) {
        if let Some(max_iters) = self.max_iters {
            cfg.run_loop.max_iters = max_iters;
        }
        if let Some(base_url) = &self.base_url {
            cfg.verify.base_url = Some(base_url.clone());
        }
        if let Some(routes) = &self.routes {
            cfg.verify.routes = routes
                .iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
        }
        if self.no_checker {
            cfg.verify.run_checker = false;
        }
        if self.no_browser {
            cfg.verify.run_browser = false;
        }
        if let Some(timeout) = self.timeout_secs {
            cfg.commands.timeout_secs = timeout;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Run(args) => cmd_run(&cli.config, args),
        Command::Apply {
            workdir,
            plan,
            runs_dir,
        } => cmd_apply(&cli.config, workdir, plan, runs_dir.as_deref()),
        Command::Baseline {
            workdir,
            runs_dir,
            regenerate,
        } => cmd_baseline(&cli.config, workdir, runs_dir, *regenerate),
    }
}

fn cmd_run(config_path: &Path, args: &RunArgs) -> Result<i32> {
    let (cfg, model) = match prepare_run(config_path, args) {
        Ok(prepared) => prepared,
        Err(err) => {
            eprintln!("{:#}", err);
            return Ok(exit_codes::INVALID);
        }
    };
    let paths = SessionPaths {
        workdir: args.workdir.clone(),
        tasks_dir: args.tasks_dir.clone(),
        runs_dir: args.runs_dir.clone(),
    };
    let outcome = run_session(&paths, &cfg, &model, &TracingObserver)?;
    print_json(&outcome)?;
    Ok(match outcome.status {
        RunStatus::Done => exit_codes::OK,
        RunStatus::Failed => exit_codes::FAILED,
    })
}

fn prepare_run(config_path: &Path, args: &RunArgs) -> Result<(AgentConfig, OpenAiCompatClient)> {
    let mut cfg = load_config(config_path)?;
    cfg.model
        .apply_env(|key| std::env::var(key).ok())
        .context("apply model environment overrides")?;
    args.apply_overrides(&mut cfg);
    cfg.validate().context("invalid command-line overrides")?;
    let model = OpenAiCompatClient::from_env(&cfg.model)?;
    Ok((cfg, model))
}

fn cmd_apply(
    config_path: &Path,
    workdir: &Path,
    plan: &Path,
    runs_dir: Option<&Path>,
) -> Result<i32> {
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{:#}", err);
            return Ok(exit_codes::INVALID);
        }
    };
    let report = apply_plan_file(workdir, plan, &cfg, runs_dir)?;
    print_json(&report)?;
    Ok(exit_codes::OK)
}

fn cmd_baseline(config_path: &Path, workdir: &Path, runs_dir: &Path, regenerate: bool) -> Result<i32> {
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{:#}", err);
            return Ok(exit_codes::INVALID);
        }
    };
    match baseline_command(workdir, runs_dir, &cfg, regenerate)? {
        Some(baseline) => print_json(&baseline)?,
        None => eprintln!("no baseline recorded for {}", workdir.display()),
    }
    Ok(exit_codes::OK)
}

/// Errors about the inputs themselves are `INVALID`; everything else `FAILED`.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<MissingTask>().is_some() || err.downcast_ref::<PlanError>().is_some() {
        exit_codes::INVALID
    } else {
        exit_codes::FAILED
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{payload}");
    Ok(())
}
