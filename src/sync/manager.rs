use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::jobs::{JobRegistry, JobStatus};
use crate::ledger::{CreditLedger, ReconcileOutcome, ReconcilePolicy};
use crate::observability::Metrics;
use crate::persist::Persisted;
use crate::remote::{HealthStatus, JobScope, RefundRequest, RemoteError, ServerJob, SyncApi};

use super::linking::{LinkAction, plan_links};
use super::log::{SyncLog, SyncLogKind};
use super::scheduler::{PollKind, PollRunner};

/// How one poll invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    Completed,
    SkippedOffline,
    SkippedInFlight,
    Failed,
}

/// Result of the last coarse health poll
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct InFlight {
    active_jobs: AtomicBool,
    full_sync: AtomicBool,
    health: AtomicBool,
}

impl InFlight {
    fn flag(&self, kind: PollKind) -> &AtomicBool {
        match kind {
            PollKind::ActiveJobs => &self.active_jobs,
            PollKind::FullSync => &self.full_sync,
            PollKind::Health => &self.health,
        }
    }

    fn try_begin(&self, kind: PollKind) -> Option<InFlightGuard<'_>> {
        let flag = self.flag(kind);
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(flag))
    }
}

/// Clears the in-flight flag on drop, including when the poll is aborted
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Folds authoritative server reads into the ledger and the job registry.
///
/// Errors never propagate out of a poll: transient failures go to the
/// [`SyncLog`] and are retried on the next tick.
pub struct ReconciliationManager {
    api: Arc<dyn SyncApi>,
    ledger: Arc<Persisted<CreditLedger>>,
    jobs: Arc<Persisted<JobRegistry>>,
    policy: ReconcilePolicy,
    foreign_window: Duration,
    online: AtomicBool,
    transitioning: AtomicBool,
    in_flight: InFlight,
    last_health: RwLock<Option<HealthReport>>,
    sync_log: Arc<SyncLog>,
    metrics: Arc<Metrics>,
}

impl ReconciliationManager {
    pub fn new(
        config: &Config,
        api: Arc<dyn SyncApi>,
        ledger: Arc<Persisted<CreditLedger>>,
        jobs: Arc<Persisted<JobRegistry>>,
        sync_log: Arc<SyncLog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api,
            ledger,
            jobs,
            policy: ReconcilePolicy::from(&config.policy),
            foreign_window: config.polling.foreign_job_window.as_duration(),
            online: AtomicBool::new(true),
            transitioning: AtomicBool::new(false),
            in_flight: InFlight::default(),
            last_health: RwLock::new(None),
            sync_log,
            metrics,
        }
    }

    pub fn api(&self) -> &Arc<dyn SyncApi> {
        &self.api
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::AcqRel) != online {
            info!(online, "Connectivity changed");
        }
    }

    /// Auth failures during an identity transition are expected and dropped
    pub fn set_transitioning(&self, transitioning: bool) {
        self.transitioning.store(transitioning, Ordering::Release);
    }

    pub async fn last_health(&self) -> Option<HealthReport> {
        self.last_health.read().await.clone()
    }

    /// Run one poll of `kind`, unless offline or one is already in flight
    pub async fn run(&self, kind: PollKind) -> PollOutcome {
        if !self.is_online() {
            debug!(kind = %kind, "Offline, poll skipped");
            self.metrics.poll_skipped();
            return PollOutcome::SkippedOffline;
        }

        let Some(_guard) = self.in_flight.try_begin(kind) else {
            debug!(kind = %kind, "Poll already in flight, skipped");
            self.metrics.poll_skipped();
            return PollOutcome::SkippedInFlight;
        };

        let result = match kind {
            PollKind::ActiveJobs => self.poll_active_jobs().await,
            PollKind::FullSync => self.poll_full().await,
            PollKind::Health => self.poll_health().await,
        };

        match result {
            Ok(()) => {
                self.metrics.poll_completed();
                PollOutcome::Completed
            }
            Err(e) => {
                self.report(kind, &e);
                PollOutcome::Failed
            }
        }
    }

    fn report(&self, kind: PollKind, error: &RemoteError) {
        self.metrics.poll_error();

        if error.is_auth() && self.transitioning.load(Ordering::Acquire) {
            debug!(kind = %kind, error = %error, "Auth failure during identity transition ignored");
            return;
        }

        let log_kind = if error.is_auth() {
            SyncLogKind::Auth
        } else if error.is_transient() {
            SyncLogKind::Network
        } else {
            SyncLogKind::Server
        };
        warn!(kind = %kind, error = %error, "Poll failed");
        self.sync_log.record(log_kind, format!("{kind}: {error}"));
    }

    /// Active-job tier: apply the active list, then look up linked local jobs
    /// that dropped out of it (they finished on the server).
    pub async fn poll_active_jobs(&self) -> Result<(), RemoteError> {
        let server_jobs = self.api.fetch_jobs(JobScope::Active).await?;
        self.apply_server_jobs(&server_jobs).await;

        let reported: HashSet<&str> = server_jobs.iter().map(|job| job.id.as_str()).collect();
        let missing: Vec<String> = self
            .jobs
            .read(|registry| {
                registry
                    .active_jobs()
                    .iter()
                    .filter_map(|job| job.server_job_id().map(str::to_owned))
                    .filter(|server_id| !reported.contains(server_id.as_str()))
                    .collect()
            })
            .await;

        for server_id in missing {
            match self.api.fetch_job(&server_id).await? {
                Some(job) => self.apply_server_jobs(std::slice::from_ref(&job)).await,
                None => debug!(server_job_id = %server_id, "Server no longer knows job"),
            }
        }
        Ok(())
    }

    /// Full tier: every server job, then the credit balance
    pub async fn poll_full(&self) -> Result<(), RemoteError> {
        let server_jobs = self.api.fetch_jobs(JobScope::All).await?;
        self.apply_server_jobs(&server_jobs).await;

        let server_balance = self.api.fetch_balance().await?;
        self.reconcile_balance(server_balance).await;
        Ok(())
    }

    pub async fn poll_health(&self) -> Result<(), RemoteError> {
        let status = self.api.health().await?;
        if !status.is_healthy() {
            warn!(status = %status.status, "Server reports degraded health");
            self.sync_log
                .record(SyncLogKind::Server, format!("server health: {}", status.status));
        }
        *self.last_health.write().await = Some(HealthReport {
            status,
            checked_at: Utc::now(),
        });
        Ok(())
    }

    pub async fn reconcile_balance(&self, server_balance: i64) -> ReconcileOutcome {
        let policy = self.policy;
        let outcome = self
            .ledger
            .mutate(|ledger| {
                let since = ledger.since_last_local_update(Utc::now());
                ledger.reconcile(server_balance, since, &policy)
            })
            .await;

        if outcome.adopted() {
            self.metrics.server_read_adopted();
        } else {
            self.metrics.server_read_discarded();
        }
        outcome
    }

    /// Link, import or update local jobs from a batch of server jobs.
    /// Server-reported failures and cancellations are compensated, along
    /// with any earlier refund that failed to persist.
    pub async fn apply_server_jobs(&self, server_jobs: &[ServerJob]) {
        if server_jobs.is_empty() {
            return;
        }

        let now = Utc::now();
        let foreign_window = self.foreign_window;
        let metrics = Arc::clone(&self.metrics);

        let to_compensate = self
            .jobs
            .mutate(|registry| {
                let actions = plan_links(registry.jobs(), server_jobs, now, foreign_window);
                let mut to_compensate = Vec::new();

                for action in actions {
                    match action {
                        LinkAction::Update { local_id, server } => {
                            if apply_server_status(registry, &local_id, &server) {
                                to_compensate.push(local_id);
                            }
                        }
                        LinkAction::Link { local_id, server } => {
                            match registry.link_server_job(&local_id, &server.id) {
                                Ok(_) => metrics.job_linked(),
                                Err(e) => {
                                    warn!(job_id = %local_id, error = %e, "Link rejected");
                                    continue;
                                }
                            }
                            if apply_server_status(registry, &local_id, &server) {
                                to_compensate.push(local_id);
                            }
                        }
                        LinkAction::Import { server } => {
                            registry.import_server_job(&server);
                            metrics.job_imported();
                        }
                        LinkAction::Foreign { server_id } => {
                            debug!(server_job_id = %server_id, "Ignoring foreign server job");
                            metrics.foreign_job_ignored();
                        }
                    }
                }

                // refunds whose earlier attempt could not be saved
                for job in registry.jobs() {
                    let owed = matches!(job.status, JobStatus::Failed | JobStatus::Cancelled)
                        && job.refundable_credits().is_some();
                    if owed && !to_compensate.contains(&job.id) {
                        to_compensate.push(job.id.clone());
                    }
                }

                to_compensate
            })
            .await;

        for job_id in to_compensate {
            self.compensate(&job_id, "job failed on server").await;
        }
    }

    /// Give back the credits charged for `job_id`, once.
    ///
    /// The refund flag and the ledger credit land together: both stores are
    /// updated and persisted as one unit, so the job stays refundable if
    /// either write fails. The server refund is best effort and a failure
    /// goes to the sync log. Returns the refunded amount.
    pub async fn compensate(&self, job_id: &str, reason: &str) -> Option<i64> {
        let refunded = Persisted::transact(&*self.jobs, &*self.ledger, |registry, ledger| {
            let amount = registry.get(job_id)?.refundable_credits()?;
            ledger.refund(amount, job_id, reason)?;
            registry.take_refund(job_id).ok()?;
            let server_job_id = registry
                .get(job_id)
                .and_then(|job| job.server_job_id())
                .map(str::to_owned);
            Some((amount, server_job_id))
        })
        .await;

        let (amount, server_job_id) = match refunded {
            Ok(refund) => refund?,
            Err(e) => {
                warn!(job_id, error = %e, "Refund not persisted, job stays refundable");
                self.sync_log.record(
                    SyncLogKind::Compensation,
                    format!("refund for {job_id} could not be saved: {e}"),
                );
                return None;
            }
        };

        self.metrics.refund_issued();

        let request = RefundRequest {
            job_id: job_id.to_string(),
            server_job_id,
            amount,
            reason: reason.to_string(),
        };
        if let Err(e) = self.api.request_refund(&request).await {
            warn!(job_id, amount, error = %e, "Server refund failed");
            self.sync_log.record(
                SyncLogKind::Compensation,
                format!("refund of {amount} for {job_id} not confirmed: {e}"),
            );
        }

        Some(amount)
    }
}

/// Apply a server-reported status to a linked local job. Returns whether the
/// job just became failed or cancelled and may owe a refund.
fn apply_server_status(registry: &mut JobRegistry, local_id: &str, server: &ServerJob) -> bool {
    let already_terminal = match registry.get(local_id) {
        Some(job) => job.status.is_terminal(),
        None => return false,
    };
    if already_terminal {
        return false;
    }

    let result = match server.status {
        JobStatus::Completed => registry.complete(local_id, server.result_urls.first().cloned()),
        JobStatus::Failed => registry.fail(
            local_id,
            server
                .error_message
                .clone()
                .unwrap_or_else(|| "failed on server".to_string()),
        ),
        status => registry
            .advance_to(local_id, status, Some(server.progress))
            .map(|(job, _)| job),
    };

    match result {
        Ok(job) => matches!(job.status, JobStatus::Failed | JobStatus::Cancelled),
        Err(e) => {
            debug!(job_id = %local_id, server_job_id = %server.id, error = %e, "Server status not applied");
            false
        }
    }
}

#[async_trait]
impl PollRunner for ReconciliationManager {
    async fn run_poll(&self, kind: PollKind) {
        let outcome = self.run(kind).await;
        debug!(kind = %kind, outcome = ?outcome, "Poll finished");
    }
}
