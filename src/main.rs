//! Runwatch CLI entry point.
//!
//! `run` supervises a child node process on negotiated ports; `pipe` applies
//! the same alerting to lines read from stdin.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use runwatch::config::{load_alert_config, AlertConfig, ChildSpec, RunConfig};
use runwatch::logging;
use runwatch::supervisor::{LinePipeline, Supervisor};

/// Runwatch: log-driven alerting for a supervised node process.
#[derive(Parser)]
#[command(name = "runwatch", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every subcommand.
#[derive(Args)]
struct CommonArgs {
    /// Path to the alert configuration (JSON, or TOML by extension).
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Chat message prefix.
    #[arg(long, default_value = "")]
    msg: String,

    /// Also write JSON diagnostics to daily-rotated files in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Negotiate ports, start the child and alert on its output.
    Run {
        /// Shared options.
        #[command(flatten)]
        common: CommonArgs,

        /// Working directory of the child (its source repository).
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Child configuration file, relative to `--repo`.
        #[arg(long = "erigon-config", default_value = "hermezconfig-bali.yaml")]
        erigon_config: PathBuf,

        /// Child executable, relative to `--repo` unless absolute.
        #[arg(long, default_value = "./build/bin/cdk-erigon")]
        child: PathBuf,

        /// Run `make <TARGET>` in `--repo` before starting the child.
        #[arg(long, value_name = "TARGET")]
        build: Option<String>,
    },
    /// Alert on lines read from stdin until EOF.
    Pipe {
        /// Shared options.
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            common,
            repo,
            erigon_config,
            child,
            build,
        } => {
            let spec = ChildSpec {
                repo_dir: repo,
                executable: child,
                config_path: erigon_config,
                build_target: build,
            };
            handle_run(common, spec).await
        }
        Command::Pipe { common } => handle_pipe(common).await,
    }
}

/// Supervise the child until it exits.
async fn handle_run(common: CommonArgs, child: ChildSpec) -> anyhow::Result<()> {
    let _logging_guard = logging::init(common.log_dir.as_deref())?;

    let run_config = RunConfig {
        alerts: load_config(&common.config)?,
        message_prefix: common.msg,
        child,
    };

    info!(
        config = %common.config.display(),
        child_config = %run_config.child.resolved_config_path().display(),
        "updating ports in child config"
    );
    let supervisor = Supervisor::from_config(run_config).context("failed to compile patterns")?;
    supervisor.run().await.context("supervised run failed")?;
    Ok(())
}

/// Scan stdin until EOF.
async fn handle_pipe(common: CommonArgs) -> anyhow::Result<()> {
    let _logging_guard = logging::init(common.log_dir.as_deref())?;

    let config = load_config(&common.config)?;
    let pipeline =
        LinePipeline::from_config(&config, &common.msg).context("failed to compile patterns")?;

    info!(prefix = %common.msg, "reading log lines from stdin");
    pipeline.scan_reader(tokio::io::stdin()).await;
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AlertConfig> {
    load_alert_config(path).with_context(|| format!("failed to load {}", path.display()))
}
