//! Subcommand handlers. `run` is the single entry point and matches the
//! closed [`Command`] set exhaustively.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use coordination::shell_safety::redact_credentials;
use coordination::{
    ClusterArtifacts, DispatchCoordinator, DispatchSummary, RosterStore, SshTransport,
};
use tracing::info;

use crate::cli::{Cli, Command};
use crate::config::MarsConfig;
use crate::report;

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = MarsConfig::load(cli.config.as_deref())?;
    config.apply_process_env();

    match cli.command {
        Command::Dispatch {
            cluster,
            connection,
            payload,
            run,
        } => {
            cluster.apply(&mut config);
            connection.apply(&mut config);
            payload.apply(&mut config);
            run.apply(&mut config);
            dispatch(&config, run.report.as_deref()).await
        }
        Command::Prepare {
            cluster,
            connection,
            git,
            run,
        } => {
            cluster.apply(&mut config);
            connection.apply(&mut config);
            git.apply(&mut config);
            run.apply(&mut config);
            prepare(&config, run.report.as_deref()).await
        }
        Command::Roster { cluster } => {
            cluster.apply(&mut config);
            roster(&config)
        }
        Command::Render { cluster, payload } => {
            cluster.apply(&mut config);
            payload.apply(&mut config);
            render(&config)
        }
    }
}

fn load_artifacts(config: &MarsConfig) -> Result<ClusterArtifacts> {
    let dir = config.artifacts_dir()?;
    RosterStore::load_artifacts(&dir)
        .with_context(|| format!("Failed to load cluster artifacts from {}", dir.display()))
}

fn coordinator(config: &MarsConfig) -> Result<DispatchCoordinator> {
    let transport = SshTransport::new(config.ssh_config())
        .context("Failed to create SSH control socket directory")?;
    Ok(DispatchCoordinator::new(Arc::new(transport)))
}

async fn dispatch(config: &MarsConfig, report_path: Option<&Path>) -> Result<ExitCode> {
    let artifacts = load_artifacts(config)?;
    let credentials = config.credentials()?;
    let shared = config.shared_launch(&artifacts.coordinator_private_address)?;
    let options = config.dispatch_options();
    let coordinator = coordinator(config)?;

    let results = coordinator
        .dispatch(&artifacts.roster, &shared, &credentials, &options)
        .await
        .context("Dispatch aborted before any node was contacted")?;

    let summary = DispatchSummary::from_results("dispatch", coordinator.run_id(), results);
    report::emit(&summary, report_path)?;
    Ok(report::exit_code(&summary))
}

async fn prepare(config: &MarsConfig, report_path: Option<&Path>) -> Result<ExitCode> {
    let artifacts = load_artifacts(config)?;
    let credentials = config.credentials()?;
    let request = config.prepare_request()?;
    let options = config.dispatch_options();
    let coordinator = coordinator(config)?;

    let results = coordinator
        .prepare(&artifacts.roster, &request, &credentials, &options)
        .await
        .context("Prepare aborted before any node was contacted")?;

    let summary = DispatchSummary::from_results("prepare", coordinator.run_id(), results);
    report::emit(&summary, report_path)?;
    Ok(report::exit_code(&summary))
}

fn roster(config: &MarsConfig) -> Result<ExitCode> {
    let artifacts = load_artifacts(config)?;
    println!("rendezvous {}", artifacts.coordinator_private_address);
    for node in &artifacts.roster {
        let role = if node.rank == 0 { "coordinator" } else { "worker" };
        println!("{:>4}  {:<11}  {}", node.rank, role, node.address);
    }
    Ok(ExitCode::SUCCESS)
}

fn render(config: &MarsConfig) -> Result<ExitCode> {
    let artifacts = load_artifacts(config)?;
    let shared = config.shared_launch(&artifacts.coordinator_private_address)?;
    let jobs = coordination::dispatch::plan(&artifacts.roster, &shared)
        .context("Invalid launch parameters")?;
    info!(nodes = jobs.len(), "rendered launch commands");
    for job in jobs {
        println!("[{}] {}: {}", job.rank, job.address, redact_credentials(&job.command));
    }
    Ok(ExitCode::SUCCESS)
}
