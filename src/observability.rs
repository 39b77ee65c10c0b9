//! Metrics counters and tracing setup

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Install the global `fmt` subscriber, filtered by `RUST_LOG`
/// (default `creditsync=info`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("creditsync=info"));
    // Ignored if a subscriber is already installed (tests, embedding apps)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Counters for polling and reconciliation
#[derive(Debug, Default)]
pub struct Metrics {
    polls_completed: AtomicU64,
    polls_skipped: AtomicU64,
    poll_errors: AtomicU64,
    server_reads_adopted: AtomicU64,
    server_reads_discarded: AtomicU64,
    jobs_linked: AtomicU64,
    jobs_imported: AtomicU64,
    foreign_jobs_ignored: AtomicU64,
    refunds_issued: AtomicU64,
}

macro_rules! counter {
    ($method:ident, $field:ident) => {
        pub fn $method(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(counter = stringify!($field), "Metric incremented");
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(poll_completed, polls_completed);
    counter!(poll_skipped, polls_skipped);
    counter!(poll_error, poll_errors);
    counter!(server_read_adopted, server_reads_adopted);
    counter!(server_read_discarded, server_reads_discarded);
    counter!(job_linked, jobs_linked);
    counter!(job_imported, jobs_imported);
    counter!(foreign_job_ignored, foreign_jobs_ignored);
    counter!(refund_issued, refunds_issued);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls_completed: self.polls_completed.load(Ordering::Relaxed),
            polls_skipped: self.polls_skipped.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
            server_reads_adopted: self.server_reads_adopted.load(Ordering::Relaxed),
            server_reads_discarded: self.server_reads_discarded.load(Ordering::Relaxed),
            jobs_linked: self.jobs_linked.load(Ordering::Relaxed),
            jobs_imported: self.jobs_imported.load(Ordering::Relaxed),
            foreign_jobs_ignored: self.foreign_jobs_ignored.load(Ordering::Relaxed),
            refunds_issued: self.refunds_issued.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub polls_completed: u64,
    pub polls_skipped: u64,
    pub poll_errors: u64,
    pub server_reads_adopted: u64,
    pub server_reads_discarded: u64,
    pub jobs_linked: u64,
    pub jobs_imported: u64,
    pub foreign_jobs_ignored: u64,
    pub refunds_issued: u64,
}
