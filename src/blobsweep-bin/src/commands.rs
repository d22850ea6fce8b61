use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, utils};
use common::config::PlanMode;
use common::{Configuration, WorkspaceRef};
use std::path::PathBuf;
use std::sync::Arc;
use sweeper::remote_job::GcpRestClient;
use sweeper::{Pipeline, RemoteJobSubmitter};
use terra::FirecloudClient;
use terra::auth::TokenSource;

/// blobsweep: find and delete unreferenced objects in a workspace bucket
#[derive(Parser)]
#[command(name = "blobsweep", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Settings every subcommand accepts; each one overrides the config file
#[derive(Args, Debug, Clone, Default)]
pub struct SweepArgs {
    /// Namespace (billing project) of the workspace
    #[arg(long)]
    workspace_namespace: Option<String>,

    /// Name of the workspace
    #[arg(long)]
    workspace_name: Option<String>,

    /// Google Cloud project billed for requests
    #[arg(long)]
    gcp_project_id: Option<String>,

    /// Inventory NDJSON file
    #[arg(long)]
    inventory_path: Option<PathBuf>,

    /// SQLite plan file
    #[arg(long)]
    plan_path: Option<PathBuf>,

    #[arg(long)]
    days_considered_old: Option<u32>,

    #[arg(long)]
    bytes_considered_large: Option<u64>,

    /// Another workspace (namespace/name) whose tables may reference the bucket
    #[arg(long = "other-workspaces", value_name = "NAMESPACE/NAME")]
    other_workspaces: Vec<WorkspaceRef>,
}

impl SweepArgs {
    fn apply(&self, config: &mut Configuration) {
        if let Some(namespace) = &self.workspace_namespace {
            config.workspace.namespace = namespace.clone();
        }
        if let Some(name) = &self.workspace_name {
            config.workspace.name = name.clone();
        }
        if let Some(project) = &self.gcp_project_id {
            config.gcp.project_id = project.clone();
        }
        if let Some(path) = &self.inventory_path {
            config.inventory.path = path.clone();
        }
        if let Some(path) = &self.plan_path {
            config.plan.path = path.clone();
        }
        if let Some(days) = self.days_considered_old {
            config.plan.days_considered_old = days;
        }
        if let Some(bytes) = self.bytes_considered_large {
            config.plan.bytes_considered_large = bytes;
        }
        for other in &self.other_workspaces {
            if !config.workspace.other_workspaces.contains(other) {
                config.workspace.other_workspaces.push(other.clone());
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the workspace bucket into the inventory file
    Inventory {
        #[command(flatten)]
        args: SweepArgs,
    },
    /// Classify the inventory and write the deletion plan
    Plan {
        #[command(flatten)]
        args: SweepArgs,

        /// Also roll deletions up to whole directory prefixes
        #[arg(long)]
        rollup: bool,
    },
    /// Delete what the plan selects, after re-checking references
    Clean {
        #[command(flatten)]
        args: SweepArgs,

        /// Log what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Run inventory, plan and clean in sequence
    RunAll {
        #[command(flatten)]
        args: SweepArgs,

        #[arg(long)]
        dry_run: bool,
    },
    /// Run `run-all` as a GCP Batch job
    SubmitRemoteJob {
        #[command(flatten)]
        args: SweepArgs,

        #[arg(long)]
        dry_run: bool,
    },
}

impl Commands {
    /// Fold this command's flags into the loaded configuration
    fn configure(&self, config: &mut Configuration) {
        match self {
            Commands::Inventory { args } => args.apply(config),
            Commands::Plan { args, rollup } => {
                args.apply(config);
                if *rollup {
                    config.plan.mode = PlanMode::Rollup;
                }
            }
            Commands::Clean { args, dry_run }
            | Commands::RunAll { args, dry_run }
            | Commands::SubmitRemoteJob { args, dry_run } => {
                args.apply(config);
                if *dry_run {
                    config.clean.dry_run = true;
                }
            }
        }
    }
}

impl Cli {
    /// Load and validate the configuration this invocation runs with
    pub fn configuration(&self) -> Result<Configuration> {
        let mut config = utils::load_config(self.common.config.as_ref())?;
        self.command.configure(&mut config);

        match self.command {
            Commands::SubmitRemoteJob { .. } => config.validate_batch(),
            _ => config.validate(),
        }
        .context("Invalid configuration")?;

        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.configuration()?;
        log::info!(
            "Workspace {} in project {}",
            config.workspace.primary(),
            config.gcp.project_id
        );

        match self.command {
            Commands::Inventory { .. } => {
                pipeline(config)?.inventory().await?;
            }
            Commands::Plan { .. } => {
                pipeline(config)?.plan().await?;
            }
            Commands::Clean { .. } => {
                let report = pipeline(config)?.clean().await?;
                if report.objects_failed > 0 {
                    log::warn!("{} objects could not be deleted", report.objects_failed);
                }
            }
            Commands::RunAll { .. } => {
                pipeline(config)?.run_all().await?;
            }
            Commands::SubmitRemoteJob { .. } => {
                let tokens = TokenSource::new(config.workspace.access_token.clone());
                let submitter = RemoteJobSubmitter::new(Arc::new(GcpRestClient::new(tokens)?));
                let job = submitter
                    .submit(&config, chrono::Utc::now().date_naive())
                    .await?;
                println!("Submitted {} ({})", job.job_id, job.tracking_url);
            }
        }
        Ok(())
    }
}

fn pipeline(config: Configuration) -> Result<Pipeline> {
    let api = FirecloudClient::new(&config.workspace)?;
    Ok(Pipeline::new(config, Arc::new(api)))
}
