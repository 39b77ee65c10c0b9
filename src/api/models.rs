//! Request and response bodies of the local control API.
//!
//! The API is how a host process (or an operator with `curl`) talks to a
//! running sync daemon:
//!
//! - `POST /notify` delivers a server push and triggers an immediate pass
//! - `POST /visibility` and `POST /connectivity` report foreground and
//!   network state, which stretch or pause polling
//! - `GET /state` returns the balance the user sees plus the active jobs
//!
//! ```json
//! { "foreground": false }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::Job;
use crate::sync::{HealthReport, PollKind, TaskState};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NotifyRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VisibilityRequest {
    pub foreground: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ConnectivityRequest {
    pub online: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub identity: Option<String>,
    pub balance: i64,
    pub pending_deductions: i64,
    pub last_server_sync: Option<DateTime<Utc>>,
    pub any_active: bool,
    pub active_jobs: Vec<Job>,
    pub online: bool,
    pub foreground: bool,
    pub polling: BTreeMap<PollKind, TaskState>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, String>,
    pub remote: Option<HealthReport>,
    pub version: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct IdentityRequest {
    pub identity: Option<String>,
}
