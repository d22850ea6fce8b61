//! Test fixtures for integration testing
//!
//! A storage context stands in for the workspace bucket and a sweep context
//! adds the workspace tables and the pipeline configuration around it.

mod storage_context;
mod sweep_context;

pub use storage_context::StorageTestContext;
pub use sweep_context::{BUCKET, PRIMARY, SIBLING, SweepTestContext};
