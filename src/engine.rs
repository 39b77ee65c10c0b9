//! Application root
//!
//! [`SyncContext`] wires the stores, the persistence gateway and the
//! reconciliation manager together and owns their lifecycle. Callers drive
//! paid operations through it so that every deduction is paired with a job
//! record and every failed or cancelled job is compensated exactly once.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::identity::{IdentityProvider, IdentityState};
use crate::jobs::{Job, JobDescriptor, JobError, JobRegistry, JobStatus};
use crate::ledger::{CreditLedger, CreditSnapshot, LedgerError, Transaction};
use crate::observability::{Metrics, MetricsSnapshot};
use crate::persist::{IdentityTransition, KvStore, PersistError, Persisted, PersistedStore, PersistenceGateway};
use crate::remote::{RemoteError, SyncApi};
use crate::sync::{
    HealthReport, PollIntervals, PollKind, PollOutcome, PollScheduler, ReconciliationManager,
    SyncLog, TaskState,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Owned by the application root; `start()` and `stop()` bracket polling
pub struct SyncContext {
    config: Arc<Config>,
    identity: Arc<dyn IdentityProvider>,
    gateway: Arc<PersistenceGateway>,
    ledger: Arc<Persisted<CreditLedger>>,
    jobs: Arc<Persisted<JobRegistry>>,
    manager: Arc<ReconciliationManager>,
    scheduler: PollScheduler,
    sync_log: Arc<SyncLog>,
    metrics: Arc<Metrics>,
    started: AtomicBool,
    transition: Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncContext {
    /// Resolve the identity (bounded wait), then load both stores from that
    /// identity's namespace. Polling does not start until [`start`](Self::start).
    pub async fn initialize(
        config: Config,
        api: Arc<dyn SyncApi>,
        kv: Arc<dyn KvStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Arc<Self>> {
        let gateway = PersistenceGateway::initialize(kv, identity.as_ref(), &config.identity).await;

        let ledger = Persisted::attach(&gateway, CreditLedger::new(&config.retention)).await?;
        let jobs = Persisted::attach(&gateway, JobRegistry::new(&config.retention)).await?;

        let sync_log = Arc::new(SyncLog::new(config.retention.sync_log));
        let metrics = Arc::new(Metrics::new());
        let manager = Arc::new(ReconciliationManager::new(
            &config,
            api,
            Arc::clone(&ledger),
            Arc::clone(&jobs),
            Arc::clone(&sync_log),
            Arc::clone(&metrics),
        ));
        let scheduler = PollScheduler::new(PollIntervals::from(&config.polling), manager.clone());

        info!(
            identity = gateway.current_identity().await.as_deref().unwrap_or("anonymous"),
            balance = ledger.read(|l| l.balance()).await,
            jobs = jobs.read(|r| r.len()).await,
            "Sync context initialized"
        );

        Ok(Arc::new(Self {
            config: Arc::new(config),
            identity,
            gateway,
            ledger,
            jobs,
            manager,
            scheduler,
            sync_log,
            metrics,
            started: AtomicBool::new(false),
            transition: Mutex::new(()),
            watcher: Mutex::new(None),
        }))
    }

    /// Begin following identity changes and, if signed in, start polling
    /// with an immediate full sync.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut rx = self.identity.subscribe();
        let context = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                let IdentityState::Resolved(next) = state else {
                    continue;
                };
                let Some(context) = Weak::upgrade(&context) else {
                    break;
                };
                if let Err(e) = context.apply_identity(next).await {
                    error!(error = %e, "Failed to apply identity change");
                }
            }
        });
        *self.watcher.lock().await = Some(watcher);

        // the provider may have moved on while we were initializing
        if self.identity.is_resolved() {
            let current = self.identity.current();
            if current != self.gateway.current_identity().await {
                if let Err(e) = self.apply_identity(current).await {
                    error!(error = %e, "Failed to apply identity change");
                }
                return;
            }
        }

        self.resume_polling().await;
    }

    /// Stop polling and stop following identity changes. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(watcher) = self.watcher.lock().await.take() {
            watcher.abort();
        }
        self.scheduler.stop().await;
        info!("Sync context stopped");
    }

    async fn resume_polling(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        if self.gateway.current_identity().await.is_none() {
            debug!("Anonymous, polling stays off");
            return;
        }
        self.scheduler.start().await;
        self.scheduler.trigger(PollKind::FullSync);
    }

    /// Move every store to `next`'s namespace.
    ///
    /// Polling is fully stopped first so no read made for the previous
    /// identity lands in the new one. Sign-out leaves polling off, and so
    /// does a failed transition: the gateway stays on the previous identity
    /// and polling resumes only after a later change succeeds.
    pub async fn apply_identity(&self, next: Option<String>) -> Result<IdentityTransition> {
        let _serial = self.transition.lock().await;
        if self.gateway.current_identity().await == next {
            return Ok(IdentityTransition::Unchanged);
        }

        self.manager.set_transitioning(true);
        self.scheduler.stop().await;

        let result = self.gateway.apply_identity(next).await;
        match &result {
            Ok(_) => {
                self.sync_log.clear();
                self.resume_polling().await;
            }
            Err(e) => {
                warn!(error = %e, "Identity transition failed, polling stays off");
            }
        }
        self.manager.set_transitioning(false);

        let transition = result?;
        info!(transition = ?transition, "Identity applied");
        Ok(transition)
    }

    /// Charge `cost` credits and start tracking the operation.
    ///
    /// On `InsufficientBalance` no job is created.
    pub async fn begin_paid_job(&self, descriptor: JobDescriptor, cost: i64) -> Result<String> {
        if cost < 0 {
            return Err(LedgerError::InvalidAmount(cost).into());
        }

        let job_id = JobRegistry::new_job_id();
        let description = format!("{} job", descriptor.job_type);
        self.ledger
            .mutate(|ledger| ledger.deduct(cost, Some(&job_id), &description))
            .await?;

        let descriptor = JobDescriptor {
            credits_charged: Some(cost),
            ..descriptor
        };
        let job_id = self
            .jobs
            .mutate(|registry| registry.create_job_with_id(job_id, descriptor))
            .await;

        info!(job_id = %job_id, cost, "Paid job started");
        Ok(job_id)
    }

    /// Track an operation that costs nothing
    pub async fn begin_job(&self, descriptor: JobDescriptor) -> String {
        self.jobs.mutate(|registry| registry.create_job(descriptor)).await
    }

    pub async fn record_purchase(&self, amount: i64, description: &str) -> Result<Transaction> {
        Ok(self
            .ledger
            .mutate(|ledger| ledger.purchase(amount, description))
            .await?)
    }

    pub async fn update_job(&self, job_id: &str, status: JobStatus, progress: Option<u8>) -> Result<Job> {
        Ok(self
            .jobs
            .mutate(|registry| registry.update_status(job_id, status, progress))
            .await?)
    }

    pub async fn set_progress(&self, job_id: &str, progress: u8) -> Result<Job> {
        Ok(self
            .jobs
            .mutate(|registry| registry.set_progress(job_id, progress))
            .await?)
    }

    /// Record the server id the caller learned when submitting the job
    pub async fn link_job(&self, job_id: &str, server_job_id: &str) -> Result<bool> {
        Ok(self
            .jobs
            .mutate(|registry| registry.link_server_job(job_id, server_job_id))
            .await?)
    }

    pub async fn complete_job(&self, job_id: &str, result_url: Option<String>) -> Result<Job> {
        Ok(self
            .jobs
            .mutate(|registry| registry.complete(job_id, result_url))
            .await?)
    }

    /// Fail the job and refund what it was charged
    pub async fn fail_job(&self, job_id: &str, message: &str) -> Result<Job> {
        self.jobs
            .mutate(|registry| registry.fail(job_id, message))
            .await?;
        self.manager.compensate(job_id, "job failed").await;
        self.job_or_not_found(job_id).await
    }

    /// Cancel the job; it delivered nothing, so it is refunded like a failure
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job> {
        self.jobs
            .mutate(|registry| registry.cancel(job_id))
            .await?;
        self.manager.compensate(job_id, "job cancelled").await;
        self.job_or_not_found(job_id).await
    }

    async fn job_or_not_found(&self, job_id: &str) -> Result<Job> {
        self.job(job_id)
            .await
            .ok_or_else(|| JobError::NotFound(job_id.to_string()).into())
    }

    /// Drive `operation` for `job_id` in the background.
    ///
    /// `Ok(result_url)` completes the job and `Err(message)` fails it (with
    /// compensation). The returned handle can abort the operation, which
    /// cancels the job.
    pub fn spawn_operation<F>(self: &Arc<Self>, job_id: impl Into<String>, operation: F) -> OperationHandle
    where
        F: Future<Output = std::result::Result<Option<String>, String>> + Send + 'static,
    {
        let job_id = job_id.into();
        let context = Arc::clone(self);
        let id = job_id.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = context.update_job(&id, JobStatus::Processing, None).await {
                debug!(job_id = %id, error = %e, "Operation started on a job that is not pending");
            }
            match operation.await {
                Ok(result_url) => context.complete_job(&id, result_url).await,
                Err(message) => context.fail_job(&id, &message).await,
            }
        });

        OperationHandle {
            job_id,
            handle,
            context: Arc::downgrade(self),
        }
    }

    /// Push notification from the server: poll every tier now
    pub fn notify(&self) {
        debug!("Notification received, triggering sync");
        self.scheduler.trigger_all();
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.scheduler.set_foreground(foreground);
    }

    pub fn set_online(&self, online: bool) {
        let was_online = self.manager.is_online();
        self.manager.set_online(online);
        if online && !was_online {
            self.scheduler.trigger_all();
        }
    }

    /// Run one poll in the caller's task
    pub async fn sync_now(&self, kind: PollKind) -> PollOutcome {
        self.manager.run(kind).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn current_identity(&self) -> Option<String> {
        self.gateway.current_identity().await
    }

    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    pub async fn balance(&self) -> i64 {
        self.ledger.read(|ledger| ledger.balance()).await
    }

    pub async fn pending_deductions(&self) -> i64 {
        self.ledger.read(|ledger| ledger.pending_deductions()).await
    }

    pub async fn credit_snapshot(&self) -> CreditSnapshot {
        self.ledger.read(|ledger| ledger.snapshot()).await
    }

    pub async fn active_jobs(&self) -> Vec<Job> {
        self.jobs.read(|registry| registry.active_jobs()).await
    }

    pub async fn any_active(&self) -> bool {
        self.jobs.read(|registry| registry.any_active()).await
    }

    pub async fn jobs(&self) -> Vec<Job> {
        self.jobs.read(|registry| registry.jobs().to_vec()).await
    }

    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.jobs.read(|registry| registry.get(job_id).cloned()).await
    }

    pub fn sync_log(&self) -> &Arc<SyncLog> {
        &self.sync_log
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn health(&self) -> Option<HealthReport> {
        self.manager.last_health().await
    }

    pub fn is_online(&self) -> bool {
        self.manager.is_online()
    }

    pub fn is_foreground(&self) -> bool {
        self.scheduler.is_foreground()
    }

    pub async fn poll_states(&self) -> BTreeMap<PollKind, TaskState> {
        self.scheduler.states().await
    }
}

/// Handle to an operation started with [`SyncContext::spawn_operation`]
pub struct OperationHandle {
    job_id: String,
    handle: JoinHandle<Result<Job>>,
    context: Weak<SyncContext>,
}

impl OperationHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the operation and return the job's final state
    pub async fn join(self) -> Result<Job> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Operation task ended abnormally");
                Err(JobError::NotFound(self.job_id).into())
            }
        }
    }

    /// Abort the operation and cancel (and refund) its job.
    ///
    /// If the operation already reached a terminal state, that state is
    /// returned unchanged.
    pub async fn abort(self) -> Result<Job> {
        self.handle.abort();
        let finished = self.handle.await;

        let Some(context) = self.context.upgrade() else {
            return Err(JobError::NotFound(self.job_id).into());
        };

        if let Ok(Ok(job)) = finished {
            return Ok(job);
        }
        match context.job(&self.job_id).await {
            Some(job) if job.status.is_terminal() => Ok(job),
            _ => {
                info!(job_id = %self.job_id, "Operation aborted");
                context.cancel_job(&self.job_id).await
            }
        }
    }
}
