//! Reconciliation against the authoritative server
//!
//! Three polling tiers run as independent tasks owned by [`PollScheduler`]:
//!
//! - **active jobs** (seconds): status and progress of running operations
//! - **full sync** (tens of seconds): every server job plus the balance
//! - **health** (minutes): coarse server status
//!
//! Each tier is skipped while offline or while its previous run is still in
//! flight. Intervals stretch by a fixed multiplier in the background, and
//! every tier runs at once on return to the foreground or on a push
//! notification.

pub mod linking;
pub mod log;
pub mod manager;
pub mod scheduler;

pub use linking::{LinkAction, plan_links};
pub use log::{SyncLog, SyncLogEntry, SyncLogKind};
pub use manager::{HealthReport, PollOutcome, ReconciliationManager};
pub use scheduler::{PollIntervals, PollKind, PollRunner, PollScheduler, TaskState};
