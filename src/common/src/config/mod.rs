use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "blobsweep.toml";

/// Environment prefix, e.g. `BLOBSWEEP__PLAN__DAYS_CONSIDERED_OLD=30`
pub const ENV_PREFIX: &str = "BLOBSWEEP__";

/// Most objects a single batched delete request may carry
pub const MAX_OBJECTS_PER_BATCH: usize = 1000;

/// A `namespace/name` pair identifying a workspace
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub namespace: String,
    pub name: String,
}

impl WorkspaceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkspaceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for WorkspaceRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => anyhow::bail!("Expected a workspace as \"namespace/name\", got {s:?}"),
        }
    }
}

/// Workspace (Terra) API configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Namespace (billing project) of the workspace whose bucket is swept
    pub namespace: String,
    /// Name of the workspace whose bucket is swept
    pub name: String,
    /// Sibling workspaces whose tables may also reference blobs in the bucket
    pub other_workspaces: Vec<WorkspaceRef>,
    /// Base URL of the workspace API
    pub api_url: String,
    /// Static bearer token; when unset, one is obtained from the environment or gcloud
    pub access_token: Option<String>,
    /// Retries for transient connection errors
    pub max_retries: u32,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            name: String::new(),
            other_workspaces: Vec::new(),
            api_url: String::from("https://api.firecloud.org"),
            access_token: None,
            max_retries: 4,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl WorkspaceConfig {
    pub fn primary(&self) -> WorkspaceRef {
        WorkspaceRef::new(&self.namespace, &self.name)
    }

    /// The primary workspace followed by every sibling, without duplicates
    pub fn all_workspaces(&self) -> Vec<WorkspaceRef> {
        let mut workspaces = vec![self.primary()];
        for other in &self.other_workspaces {
            if !workspaces.contains(other) {
                workspaces.push(other.clone());
            }
        }
        workspaces
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct GcpConfig {
    /// Project billed for storage and batch requests
    pub project_id: String,
}

/// Object storage override; normally the bucket comes from the workspace
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// `gs://bucket`, `file:///path` or `memory://`
    pub url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Destination NDJSON file
    pub path: PathBuf,
    /// Workers persisting pages
    pub workers: usize,
    /// Pages allowed to wait in the submission queue
    pub queue_size: usize,
    /// Objects per page of the listing
    pub page_size: usize,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/inventories/inventory.ndjson"),
            workers: default_workers(),
            queue_size: 250,
            page_size: 1000,
        }
    }
}

/// How deletion decisions are reported
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// One decision per object
    #[default]
    PerObject,
    /// Additionally roll uniform decisions up to directory prefixes
    Rollup,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanConfig {
    /// SQLite plan store
    pub path: PathBuf,
    /// Objects last modified longer ago than this are old
    pub days_considered_old: u32,
    /// Objects bigger than this are large
    pub bytes_considered_large: u64,
    pub mode: PlanMode,
    /// Optional Parquet copy of the `blobs` table for review
    pub snapshot_path: Option<PathBuf>,
    /// Workers fetching entity tables
    pub resolver_workers: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/plans/plan.db"),
            days_considered_old: 90,
            bytes_considered_large: 1024 * 1024 * 1024, // 1 GiB
            mode: PlanMode::PerObject,
            snapshot_path: None,
            resolver_workers: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanConfig {
    /// Objects per batched delete request (at most 1000)
    pub max_batch_size: usize,
    /// Batches deleting concurrently
    pub workers: usize,
    /// Batches allowed to wait in the submission queue
    pub queue_size: usize,
    /// Log what would be deleted without deleting
    pub dry_run: bool,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_OBJECTS_PER_BATCH,
            workers: default_workers(),
            queue_size: 16,
            dry_run: false,
        }
    }
}

/// GCP Batch job settings for `submit-remote-job`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    pub region: String,
    /// Zone queried for machine type details
    pub zone: String,
    pub machine_type: String,
    pub boot_disk_mib: u64,
    #[serde(with = "humantime_serde")]
    pub max_run_duration: Duration,
    /// `STANDARD` or `SPOT`
    pub provisioning_model: String,
    pub service_account_email: String,
    pub container_image_uri: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            region: String::from("us-central1"),
            zone: String::from("us-central1-a"),
            machine_type: String::from("n2-highcpu-4"),
            boot_disk_mib: 20 * 1024,
            max_run_duration: Duration::from_secs(24 * 3600),
            provisioning_model: String::from("STANDARD"),
            service_account_email: String::new(),
            container_image_uri: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    pub workspace: WorkspaceConfig,
    pub gcp: GcpConfig,
    pub storage: StorageConfig,
    pub inventory: InventoryConfig,
    pub plan: PlanConfig,
    pub clean: CleanConfig,
    pub batch: BatchConfig,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

fn figment_with_defaults() -> Figment {
    Figment::from(Serialized::defaults(Configuration::default()))
}

impl Configuration {
    /// Load from `blobsweep.toml` (if present) and the environment
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = figment_with_defaults()
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Load from an explicit TOML file, which must exist
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Configuration file not found: {}", path.display());
        }

        let config = figment_with_defaults()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        Ok(config)
    }

    /// Checks shared by every subcommand touching the workspace
    pub fn validate(&self) -> Result<()> {
        if self.workspace.namespace.trim().is_empty() {
            anyhow::bail!("workspace.namespace must be set");
        }

        if self.workspace.name.trim().is_empty() {
            anyhow::bail!("workspace.name must be set");
        }

        if self.gcp.project_id.trim().is_empty() {
            anyhow::bail!("gcp.project_id must be set");
        }

        if self.inventory.workers == 0 || self.clean.workers == 0 {
            anyhow::bail!("worker counts must be positive");
        }

        if self.plan.resolver_workers == 0 {
            anyhow::bail!("plan.resolver_workers must be positive");
        }

        if self.inventory.queue_size == 0 || self.clean.queue_size == 0 {
            anyhow::bail!("queue sizes must be positive");
        }

        if self.inventory.page_size == 0 {
            anyhow::bail!("inventory.page_size must be positive");
        }

        if self.plan.days_considered_old == 0 {
            anyhow::bail!("plan.days_considered_old must be positive");
        }

        if self.plan.bytes_considered_large == 0 {
            anyhow::bail!("plan.bytes_considered_large must be positive");
        }

        if self.clean.max_batch_size == 0 || self.clean.max_batch_size > MAX_OBJECTS_PER_BATCH {
            anyhow::bail!(
                "clean.max_batch_size must be between 1 and {MAX_OBJECTS_PER_BATCH}, got {}",
                self.clean.max_batch_size
            );
        }

        Ok(())
    }

    /// Additional checks for `submit-remote-job`
    pub fn validate_batch(&self) -> Result<()> {
        self.validate()?;

        let batch = &self.batch;
        for (key, value) in [
            ("batch.region", &batch.region),
            ("batch.zone", &batch.zone),
            ("batch.machine_type", &batch.machine_type),
            ("batch.service_account_email", &batch.service_account_email),
            ("batch.container_image_uri", &batch.container_image_uri),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{key} must be set");
            }
        }

        if !matches!(batch.provisioning_model.as_str(), "STANDARD" | "SPOT") {
            anyhow::bail!(
                "batch.provisioning_model must be STANDARD or SPOT, got {}",
                batch.provisioning_model
            );
        }

        if batch.max_run_duration.as_secs() == 0 {
            anyhow::bail!("batch.max_run_duration must be at least one second");
        }

        Ok(())
    }
}
