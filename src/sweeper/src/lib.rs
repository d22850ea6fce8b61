//! Inventory, planning and deletion of workspace bucket objects.
//!
//! The pipeline runs in three checkpointed phases:
//!
//! 1. [`inventory`] lists the bucket into an NDJSON file.
//! 2. [`plan`] classifies that inventory, subtracts every object still
//!    referenced by a workspace data table ([`references`]), and writes the
//!    decisions to a SQLite plan.
//! 3. [`clean`] re-resolves references, refuses to run if any planned deletion
//!    is referenced, and deletes the rest in batches.
//!
//! Phases can be re-run independently; each one replaces its own output.

pub mod blob;
pub mod clean;
pub mod inventory;
pub mod pipeline;
pub mod plan;
pub mod pool;
pub mod references;
pub mod remote_job;

pub use blob::BlobRecord;
pub use clean::{DeletionExecutor, DeletionReport, SafetyViolation};
pub use inventory::{InventoryCollector, InventorySummary};
pub use pipeline::{Pipeline, RunSummary};
pub use plan::{PlanEngine, PlanEntry, PlanRules, PlanStore, PlanSummary};
pub use references::{ReferenceResolver, ReferenceSet};
pub use remote_job::RemoteJobSubmitter;
