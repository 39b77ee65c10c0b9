//! Remote collaborators
//!
//! The authoritative server is reached only through [`SyncApi`]. There is no
//! deduct call: spends are applied optimistically and confirmed by reads, and
//! the only write is a compensating refund after a failed paid operation.

use async_trait::async_trait;

pub mod error;
pub mod http;
pub mod mock;
pub mod models;

pub use error::{RemoteError, Result};
pub use http::HttpSyncApi;
pub use mock::MockSyncApi;
pub use models::{BalanceResponse, HealthStatus, JobScope, RefundRequest, ServerJob};

#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn fetch_balance(&self) -> Result<i64>;

    /// Active jobs, or every job the server still knows about
    async fn fetch_jobs(&self, scope: JobScope) -> Result<Vec<ServerJob>>;

    /// `None` if the server does not know the id
    async fn fetch_job(&self, server_id: &str) -> Result<Option<ServerJob>>;

    async fn health(&self) -> Result<HealthStatus>;

    async fn request_refund(&self, request: &RefundRequest) -> Result<()>;
}
