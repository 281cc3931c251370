mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use castle_cli::{is_ssh, resolve_cluster_path};
use castle_core::cluster::{CastleCluster, CastleClusterSpec};
use castle_core::env::CastleEnvironment;
use castle_core::shutdown::ShutdownManager;
use castle_core::{ssh, CastleReturnCode};
use clap::{CommandFactory, Parser};

#[derive(Parser)]
#[command(
    name = "castle",
    about = "Bring up, check, and tear down Kafka test clusters",
    version,
    after_help = "Targets: up, down, status, start, stop, setup, init, destroy, \
                  saveLogs, clean, destroyNodes, or any action as type[:node]. \
                  `castle ssh <node|index|all> [command...]` runs a command on nodes."
)]
struct Cli {
    /// Cluster file to read when the working directory has none yet
    #[arg(short = 'c', long = "cluster", env = "CASTLE_CLUSTER_INPUT_PATH")]
    cluster: Option<PathBuf>,

    /// Directory holding cluster.conf, ssh keys, and logs (required)
    #[arg(
        short = 'w',
        long = "working-directory",
        env = "CASTLE_WORKING_DIRECTORY"
    )]
    working_directory: Option<PathBuf>,

    /// Log at debug level
    #[arg(short = 'v', long, env = "CASTLE_VERBOSE")]
    verbose: bool,

    /// Print the run report as JSON
    #[arg(short = 'j', long)]
    json: bool,

    /// Targets to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    targets: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    if cli.targets.is_empty() {
        let _ = Cli::command().print_help();
        std::process::exit(0);
    }

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let working_directory = cli
        .working_directory
        .context("You must specify a working directory with -w or --working-directory.")?;
    std::fs::create_dir_all(&working_directory).with_context(|| {
        format!(
            "unable to create working directory {}",
            working_directory.display()
        )
    })?;
    let cluster_path = resolve_cluster_path(&working_directory, cli.cluster.as_deref())?;
    let env = CastleEnvironment::new(&working_directory)?;
    let spec = CastleClusterSpec::read(&cluster_path)?;
    let manager = Arc::new(ShutdownManager::new());
    let cluster = Arc::new(CastleCluster::new(env, Arc::clone(&manager), spec)?);
    tracing::debug!(path = %cluster_path.display(), targets = ?cli.targets, "loaded cluster");

    let result = if is_ssh(&cli.targets) {
        ssh::run(&cluster, &cli.targets).map_err(anyhow::Error::from)
    } else {
        run_targets(&cluster, &manager, &cli.targets, cli.json)
    };
    // Hooks may wait on cloud futures, so they run outside the runtime.
    if result.is_err() {
        manager.change_return_code(CastleReturnCode::ToolFailed);
    }
    let code = manager.shutdown(&cluster);
    cluster.close();
    let exit = result?;
    Ok(if exit != 0 { exit } else { code.code() })
}

/// Run the closure of `targets` until it completes, the global timeout
/// expires, or the user interrupts. Returns zero; the outcome lives in the
/// shutdown manager.
fn run_targets(
    cluster: &Arc<CastleCluster>,
    manager: &ShutdownManager,
    targets: &[String],
    json: bool,
) -> anyhow::Result<i32> {
    let mut scheduler = cluster.create_scheduler(targets, Vec::new())?;
    let timeout = cluster.conf().global_timeout();
    let runtime = tokio::runtime::Runtime::new().context("unable to start the tokio runtime")?;
    let report = runtime.block_on(async {
        let report = tokio::select! {
            report = scheduler.await_completion(timeout) => Some(report),
            _ = tokio::signal::ctrl_c() => None,
        };
        if report.is_none() {
            tracing::warn!("interrupted, cancelling pending actions");
            scheduler.close();
        }
        drop(scheduler);
        report
    });
    // Actions still inside a blocking call are abandoned, not awaited.
    runtime.shutdown_background();

    match report {
        Some(report) if json => output::print_json(&report)?,
        Some(report) => output::print_report(&report),
        None => manager.change_return_code(CastleReturnCode::ToolFailed),
    }
    Ok(0)
}
