//! Registry of long-running asynchronous operations
//!
//! Jobs are created by the caller when an operation starts and advance
//! through `pending → processing → {completed, failed}` (or `cancelled`).
//! Reconciliation links each local job to its server counterpart through a
//! set-once back-reference in [`JobMetadata`].

pub mod error;
pub mod model;
pub mod registry;

pub use error::{JobError, Result};
pub use model::{Job, JobDescriptor, JobMetadata, JobStatus, JobType};
pub use registry::{JobRegistry, JobsSnapshot};
