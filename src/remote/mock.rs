//! Scripted in-process server for tests and offline runs

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::SyncApi;
use super::error::{RemoteError, Result};
use super::models::{HealthStatus, JobScope, RefundRequest, ServerJob};

#[derive(Debug)]
struct MockState {
    balance: i64,
    jobs: Vec<ServerJob>,
    failure: Option<RemoteError>,
    delay: Option<Duration>,
    refunds: Vec<RefundRequest>,
    calls: BTreeMap<&'static str, usize>,
}

/// [`SyncApi`] double whose responses are set by the test
#[derive(Debug)]
pub struct MockSyncApi {
    state: Mutex<MockState>,
}

impl Default for MockSyncApi {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MockSyncApi {
    pub fn new(balance: i64) -> Self {
        Self {
            state: Mutex::new(MockState {
                balance,
                jobs: Vec::new(),
                failure: None,
                delay: None,
                refunds: Vec::new(),
                calls: BTreeMap::new(),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    pub fn set_balance(&self, balance: i64) {
        self.with_state(|s| s.balance = balance);
    }

    pub fn set_jobs(&self, jobs: Vec<ServerJob>) {
        self.with_state(|s| s.jobs = jobs);
    }

    /// Insert or replace a job by server id
    pub fn upsert_job(&self, job: ServerJob) {
        self.with_state(|s| match s.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => s.jobs.push(job),
        });
    }

    /// Every call fails with `error` until cleared with `None`
    pub fn fail_with(&self, error: Option<RemoteError>) {
        self.with_state(|s| s.failure = error);
    }

    /// Hold every response for `delay`
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_state(|s| s.delay = delay);
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.with_state(|s| s.refunds.clone())
    }

    /// Number of calls made to `endpoint` (`balance`, `jobs`, `job`, `health`, `refund`)
    pub fn calls(&self, endpoint: &str) -> usize {
        self.with_state(|s| s.calls.get(endpoint).copied().unwrap_or(0))
    }

    async fn enter(&self, endpoint: &'static str) -> Result<()> {
        let (delay, failure) = self.with_state(|s| {
            *s.calls.entry(endpoint).or_insert(0) += 1;
            (s.delay, s.failure.clone())
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SyncApi for MockSyncApi {
    async fn fetch_balance(&self) -> Result<i64> {
        self.enter("balance").await?;
        Ok(self.with_state(|s| s.balance))
    }

    async fn fetch_jobs(&self, scope: JobScope) -> Result<Vec<ServerJob>> {
        self.enter("jobs").await?;
        Ok(self.with_state(|s| {
            s.jobs
                .iter()
                .filter(|job| scope == JobScope::All || job.status.is_active())
                .cloned()
                .collect()
        }))
    }

    async fn fetch_job(&self, server_id: &str) -> Result<Option<ServerJob>> {
        self.enter("job").await?;
        Ok(self.with_state(|s| s.jobs.iter().find(|job| job.id == server_id).cloned()))
    }

    async fn health(&self) -> Result<HealthStatus> {
        self.enter("health").await?;
        Ok(HealthStatus {
            status: "ok".to_string(),
            components: BTreeMap::new(),
        })
    }

    async fn request_refund(&self, request: &RefundRequest) -> Result<()> {
        self.enter("refund").await?;
        info!(job_id = %request.job_id, amount = request.amount, "Mock refund");
        self.with_state(|s| {
            s.balance += request.amount;
            s.refunds.push(request.clone());
        });
        Ok(())
    }
}
