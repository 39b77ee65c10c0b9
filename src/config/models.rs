use crate::humanize::HumanDuration;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Thresholds used when folding a server balance into the local ledger.
///
/// The defaults are empirical; nothing else in the engine depends on their
/// exact values.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Local state older than this is presumed stale and the server wins
    #[serde(default = "default_stale_after")]
    pub stale_after: HumanDuration,
    /// Window after a local mutation in which the server may still be lagging
    #[serde(default = "default_fresh_window")]
    pub fresh_window: HumanDuration,
    #[serde(default = "default_catch_up_tolerance")]
    pub catch_up_tolerance: i64,
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            fresh_window: default_fresh_window(),
            catch_up_tolerance: default_catch_up_tolerance(),
            drift_tolerance: default_drift_tolerance(),
        }
    }
}

fn default_stale_after() -> HumanDuration {
    HumanDuration::from_secs(120)
}

fn default_fresh_window() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_catch_up_tolerance() -> i64 {
    1
}

fn default_drift_tolerance() -> i64 {
    50
}

/// Polling tier intervals
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollingConfig {
    #[serde(default = "default_active_jobs_interval")]
    pub active_jobs: HumanDuration,
    #[serde(default = "default_full_sync_interval")]
    pub full_sync: HumanDuration,
    #[serde(default = "default_health_interval")]
    pub health: HumanDuration,
    /// Applied to every interval while the client is in the background
    #[serde(default = "default_background_multiplier")]
    pub background_multiplier: u32,
    /// Unmatched server jobs older than this belong to someone else
    #[serde(default = "default_foreign_job_window")]
    pub foreign_job_window: HumanDuration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            active_jobs: default_active_jobs_interval(),
            full_sync: default_full_sync_interval(),
            health: default_health_interval(),
            background_multiplier: default_background_multiplier(),
            foreign_job_window: default_foreign_job_window(),
        }
    }
}

fn default_active_jobs_interval() -> HumanDuration {
    HumanDuration::from_secs(3)
}

fn default_full_sync_interval() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_health_interval() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_background_multiplier() -> u32 {
    4
}

fn default_foreign_job_window() -> HumanDuration {
    HumanDuration::from_secs(600)
}

/// History caps
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_transactions_in_memory")]
    pub transactions_in_memory: usize,
    #[serde(default = "default_transactions_persisted")]
    pub transactions_persisted: usize,
    #[serde(default = "default_job_history")]
    pub job_history: usize,
    #[serde(default = "default_sync_log")]
    pub sync_log: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            transactions_in_memory: default_transactions_in_memory(),
            transactions_persisted: default_transactions_persisted(),
            job_history: default_job_history(),
            sync_log: default_sync_log(),
        }
    }
}

fn default_transactions_in_memory() -> usize {
    100
}

fn default_transactions_persisted() -> usize {
    50
}

fn default_job_history() -> usize {
    200
}

fn default_sync_log() -> usize {
    50
}

/// Identity resolution
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// Give up waiting for the provider and continue as anonymous
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout: HumanDuration,
    #[serde(default = "default_identity_poll_interval")]
    pub poll_interval: HumanDuration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: default_resolve_timeout(),
            poll_interval: default_identity_poll_interval(),
        }
    }
}

fn default_resolve_timeout() -> HumanDuration {
    HumanDuration::from_secs(5)
}

fn default_identity_poll_interval() -> HumanDuration {
    HumanDuration::from_millis(50)
}

/// Durable snapshot storage
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_fjall_path")]
    pub fjall_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fjall_path: default_fjall_path(),
        }
    }
}

fn default_fjall_path() -> PathBuf {
    PathBuf::from("data/snapshots")
}

/// Authoritative backend
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: HumanDuration,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Bearer token (loaded from environment, not from config file)
    #[serde(skip)]
    pub api_token: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            api_token: None,
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_connect_timeout() -> HumanDuration {
    HumanDuration::from_secs(5)
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(15)
}

fn default_user_agent() -> String {
    format!("creditsync/{}", env!("CARGO_PKG_VERSION"))
}

/// Local control API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.policy.stale_after.as_duration(), Duration::from_secs(120));
        assert_eq!(config.policy.fresh_window.as_duration(), Duration::from_secs(30));
        assert_eq!(config.policy.drift_tolerance, 50);
        assert_eq!(config.retention.transactions_in_memory, 100);
        assert_eq!(config.retention.transactions_persisted, 50);
        assert_eq!(config.retention.job_history, 200);
        assert_eq!(config.server.bind_addr.to_string(), "127.0.0.1:8787");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[polling]
active_jobs = "1s"
        "#,
        )
        .unwrap();

        assert_eq!(config.polling.active_jobs.as_duration(), Duration::from_secs(1));
        assert_eq!(config.polling.full_sync.as_duration(), Duration::from_secs(30));
        assert_eq!(config.polling.background_multiplier, 4);
    }
}
