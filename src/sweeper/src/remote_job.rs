//! Unattended runs on GCP Batch.
//!
//! The job is a single container task re-invoking `blobsweep run-all` with
//! every setting passed as a flag, so the container needs no config file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use common::Configuration;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use terra::auth::TokenSource;

const BATCH_API: &str = "https://batch.googleapis.com/v1";
const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";

/// Inventory location inside the job container
pub const CONTAINER_INVENTORY_PATH: &str = "/app/data/inventories/inventory.ndjson";
/// Plan location inside the job container
pub const CONTAINER_PLAN_PATH: &str = "/app/data/plans/plan.db";

/// Longest job ID Batch accepts
const MAX_JOB_ID_LEN: usize = 63;

/// CPU and memory of a Compute Engine machine type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineType {
    pub name: String,
    pub guest_cpus: u64,
    /// Memory in megabytes as reported by Compute Engine
    pub memory_mb: u64,
}

impl MachineType {
    pub fn cpu_milli(&self) -> u64 {
        self.guest_cpus * 1000
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_mb * 1_000_000 / (1 << 20)
    }
}

/// A job accepted by Batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    /// Full resource name, `projects/.../locations/.../jobs/...`
    pub name: String,
    pub tracking_url: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchApi: Send + Sync {
    async fn machine_type(&self, project: &str, zone: &str, machine_type: &str)
    -> Result<MachineType>;

    /// Create a job and return its resource name
    async fn create_job(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
        job: &Value,
    ) -> Result<String>;
}

/// Batch and Compute REST endpoints
pub struct GcpRestClient {
    http: reqwest::Client,
    tokens: TokenSource,
}

#[derive(Deserialize)]
struct CreatedJob {
    name: String,
}

impl GcpRestClient {
    pub fn new(tokens: TokenSource) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            tokens,
        })
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("HTTP {status} error: {body}")
    }
}

#[async_trait]
impl BatchApi for GcpRestClient {
    async fn machine_type(
        &self,
        project: &str,
        zone: &str,
        machine_type: &str,
    ) -> Result<MachineType> {
        let url = format!("{COMPUTE_API}/projects/{project}/zones/{zone}/machineTypes/{machine_type}");
        let token = self.tokens.token().await?;
        let resp = self.http.get(&url).bearer_auth(token).send().await?;
        let resp = Self::check(resp)
            .await
            .with_context(|| format!("Failed to look up machine type {machine_type} in {zone}"))?;
        Ok(resp.json().await?)
    }

    async fn create_job(
        &self,
        project: &str,
        region: &str,
        job_id: &str,
        job: &Value,
    ) -> Result<String> {
        let url = format!("{BATCH_API}/projects/{project}/locations/{region}/jobs");
        let token = self.tokens.token().await?;
        let resp = self
            .http
            .post(&url)
            .query(&[("job_id", job_id)])
            .bearer_auth(token)
            .json(job)
            .send()
            .await?;
        let resp = Self::check(resp)
            .await
            .with_context(|| format!("Failed to create Batch job {job_id}"))?;
        let created: CreatedJob = resp.json().await?;
        Ok(created.name)
    }
}

/// `blobsweep-{workspace}-{date}-{suffix}`, lowercased and cut to 63 characters
pub fn job_id(workspace_name: &str, date: NaiveDate, suffix: &str) -> String {
    let tail = format!("-{}-{suffix}", date.format("%Y-%m-%d"));
    let budget = MAX_JOB_ID_LEN.saturating_sub("blobsweep-".len() + tail.len());

    let mut slug = String::with_capacity(workspace_name.len());
    for c in workspace_name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.truncate(budget);
    let slug = slug.trim_end_matches('-');
    let slug = if slug.is_empty() { "workspace" } else { slug };

    let mut id = format!("blobsweep-{slug}{tail}");
    id.truncate(MAX_JOB_ID_LEN);
    id
}

/// Quote `arg` for `bash -c` unless it is made only of safe characters
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Arguments of the `run-all` invocation inside the container
pub fn run_all_args(config: &Configuration) -> Vec<String> {
    let mut args = vec![
        "run-all".to_string(),
        "--workspace-namespace".to_string(),
        config.workspace.namespace.clone(),
        "--workspace-name".to_string(),
        config.workspace.name.clone(),
        "--gcp-project-id".to_string(),
        config.gcp.project_id.clone(),
        "--inventory-path".to_string(),
        CONTAINER_INVENTORY_PATH.to_string(),
        "--plan-path".to_string(),
        CONTAINER_PLAN_PATH.to_string(),
        "--days-considered-old".to_string(),
        config.plan.days_considered_old.to_string(),
        "--bytes-considered-large".to_string(),
        config.plan.bytes_considered_large.to_string(),
    ];
    for other in &config.workspace.other_workspaces {
        args.push("--other-workspaces".to_string());
        args.push(other.to_string());
    }
    if config.clean.dry_run {
        args.push("--dry-run".to_string());
    }
    args
}

/// Batch job definition running `run-all` on `machine`
pub fn job_definition(config: &Configuration, machine: &MachineType) -> Value {
    let command = std::iter::once("blobsweep".to_string())
        .chain(run_all_args(config))
        .map(|a| shell_quote(&a))
        .collect::<Vec<_>>()
        .join(" ");
    let batch = &config.batch;

    json!({
        "taskGroups": [{
            "taskCount": 1,
            "parallelism": 1,
            "taskSpec": {
                "runnables": [{
                    "container": {
                        "imageUri": batch.container_image_uri,
                        "entrypoint": "/bin/bash",
                        "commands": ["-c", command],
                    }
                }],
                "computeResource": {
                    "cpuMilli": machine.cpu_milli(),
                    "memoryMib": machine.memory_mib(),
                    "bootDiskMib": batch.boot_disk_mib,
                },
                "maxRetryCount": 0,
                "maxRunDuration": format!("{}s", batch.max_run_duration.as_secs()),
            }
        }],
        "allocationPolicy": {
            "instances": [{
                "policy": {
                    "machineType": batch.machine_type,
                    "provisioningModel": batch.provisioning_model,
                }
            }],
            "serviceAccount": {
                "email": batch.service_account_email,
            }
        },
        "logsPolicy": {
            "destination": "CLOUD_LOGGING",
        }
    })
}

pub fn tracking_url(project: &str, region: &str, job_id: &str) -> String {
    format!(
        "https://console.cloud.google.com/batch/jobsDetail/regions/{region}/jobs/{job_id}/details?project={project}"
    )
}

/// Builds and submits the `run-all` job
pub struct RemoteJobSubmitter {
    api: Arc<dyn BatchApi>,
}

impl RemoteJobSubmitter {
    pub fn new(api: Arc<dyn BatchApi>) -> Self {
        Self { api }
    }

    pub async fn submit(&self, config: &Configuration, today: NaiveDate) -> Result<SubmittedJob> {
        let batch = &config.batch;
        let project = &config.gcp.project_id;

        let machine = self
            .api
            .machine_type(project, &batch.zone, &batch.machine_type)
            .await?;
        log::info!(
            "Machine type {}: {} vCPUs, {} MiB",
            machine.name,
            machine.guest_cpus,
            machine.memory_mib()
        );

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let job_id = job_id(&config.workspace.name, today, &suffix[..8]);
        let job = job_definition(config, &machine);
        tracing::debug!(job_id = %job_id, job = %job, "Submitting Batch job");

        let name = self
            .api
            .create_job(project, &batch.region, &job_id, &job)
            .await?;

        let tracking_url = tracking_url(project, &batch.region, &job_id);
        tracing::info!(job_id = %job_id, name = %name, "Submitted job, track it at {tracking_url}");

        Ok(SubmittedJob {
            job_id,
            name,
            tracking_url,
        })
    }
}
