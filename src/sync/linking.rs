//! Matching server-reported jobs to local job records
//!
//! Two passes over the server list, oldest server job first:
//!
//! 1. A local job whose stored server id equals the server job's id owns it.
//!    This link is final and is never revisited.
//! 2. Remaining server jobs match the oldest *unlinked* local job with the
//!    same `(image_url, job_type)`. Each local job can be claimed once per
//!    pass, so two server jobs never collapse onto one record.
//!
//! Whatever is left is imported when it is recent, and ignored as foreign
//! (another device, another session) when it is older than the window.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::jobs::Job;
use crate::remote::ServerJob;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    /// Already linked through the stored back-reference
    Update { local_id: String, server: ServerJob },
    /// Matched by `(image_url, job_type)`; the link must be written first
    Link { local_id: String, server: ServerJob },
    /// Recent and unmatched; track it locally
    Import { server: ServerJob },
    /// Unmatched and older than the recency window
    Foreign { server_id: String },
}

/// Plan how a batch of server jobs maps onto local records
pub fn plan_links(
    local: &[Job],
    server: &[ServerJob],
    now: DateTime<Utc>,
    foreign_window: Duration,
) -> Vec<LinkAction> {
    let mut ordered: Vec<&ServerJob> = server.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    ordered.dedup_by(|a, b| a.id == b.id);

    let mut unlinked: Vec<&Job> = local.iter().filter(|job| job.server_job_id().is_none()).collect();
    unlinked.sort_by_key(|job| job.created_at);

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut actions = Vec::with_capacity(ordered.len());
    let mut leftovers = Vec::new();

    for server_job in &ordered {
        match local.iter().find(|job| job.server_job_id() == Some(server_job.id.as_str())) {
            Some(owner) => actions.push(LinkAction::Update {
                local_id: owner.id.clone(),
                server: (*server_job).clone(),
            }),
            None => leftovers.push(*server_job),
        }
    }

    for server_job in leftovers {
        let candidate = unlinked.iter().find(|job| {
            !claimed.contains(job.id.as_str())
                && job.job_type == server_job.job_type
                && job.image_url == server_job.image_url
        });

        if let Some(job) = candidate {
            claimed.insert(job.id.as_str());
            actions.push(LinkAction::Link {
                local_id: job.id.clone(),
                server: server_job.clone(),
            });
            continue;
        }

        let age = (now - server_job.created_at).to_std().unwrap_or(Duration::ZERO);
        if age <= foreign_window {
            actions.push(LinkAction::Import {
                server: server_job.clone(),
            });
        } else {
            actions.push(LinkAction::Foreign {
                server_id: server_job.id.clone(),
            });
        }
    }

    actions
}
