use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::persist::PersistedStore;
use crate::remote::ServerJob;

use super::error::{JobError, Result};
use super::model::{Job, JobDescriptor, JobMetadata, JobStatus, JobType};

/// Local record of asynchronous operations, oldest first.
///
/// Mutations never span an await; the registry is driven by the caller for
/// what it observes directly and by reconciliation for what the server
/// reports.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Vec<Job>,
    any_active: bool,
    history_cap: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(&RetentionConfig::default())
    }
}

impl JobRegistry {
    pub fn new(retention: &RetentionConfig) -> Self {
        Self {
            jobs: Vec::new(),
            any_active: false,
            history_cap: retention.job_history.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All jobs, oldest first
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Job> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Fresh client-local job id
    pub fn new_job_id() -> String {
        format!("job_{}", Uuid::now_v7().simple())
    }

    /// Start tracking a new operation; returns its client-local id
    pub fn create_job(&mut self, descriptor: JobDescriptor) -> String {
        self.create_job_with_id(Self::new_job_id(), descriptor)
    }

    /// Like [`create_job`](Self::create_job) with an id allocated up front,
    /// so a deduction can reference the job before it exists.
    pub fn create_job_with_id(&mut self, id: String, descriptor: JobDescriptor) -> String {
        let now = Utc::now();

        let job = Job {
            id: id.clone(),
            job_type: descriptor.job_type,
            status: JobStatus::Pending,
            image_url: descriptor.image_url,
            result_url: None,
            progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            metadata: JobMetadata::new(descriptor.credits_charged, descriptor.extensions),
        };

        debug!(job_id = %id, job_type = %job.job_type, "Job created");
        self.jobs.push(job);
        self.refresh();
        self.enforce_retention();
        id
    }

    /// Apply one state-machine step. Repeating the current non-terminal
    /// status only updates progress.
    pub fn update_status(&mut self, id: &str, status: JobStatus, progress: Option<u8>) -> Result<Job> {
        let job = self.get_mut(id)?;
        let from = job.status;

        if from != status || from.is_terminal() {
            if !from.can_transition_to(status) {
                return Err(JobError::InvalidTransition {
                    id: id.to_string(),
                    from,
                    to: status,
                });
            }
            job.status = status;
        }

        if status == JobStatus::Completed {
            job.progress = 100;
        } else if let Some(progress) = progress {
            job.progress = progress.min(100);
        }
        job.updated_at = Utc::now();

        let snapshot = job.clone();
        debug!(job_id = %id, from = %from, to = %status, progress = snapshot.progress, "Job status updated");
        self.refresh();
        Ok(snapshot)
    }

    pub fn set_progress(&mut self, id: &str, progress: u8) -> Result<Job> {
        let job = self.get_mut(id)?;
        if job.status.is_terminal() {
            return Err(JobError::InvalidProgress {
                id: id.to_string(),
                status: job.status,
            });
        }

        job.progress = progress.min(100);
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    /// Terminal success; progress becomes 100
    pub fn complete(&mut self, id: &str, result_url: Option<String>) -> Result<Job> {
        self.step_through_processing(id, JobStatus::Completed)?;
        let job = self.get_mut(id)?;
        if result_url.is_some() {
            job.result_url = result_url;
        }
        let snapshot = job.clone();
        info!(job_id = %id, "Job completed");
        Ok(snapshot)
    }

    pub fn fail(&mut self, id: &str, message: impl Into<String>) -> Result<Job> {
        self.step_through_processing(id, JobStatus::Failed)?;
        let job = self.get_mut(id)?;
        job.error_message = Some(message.into());
        let snapshot = job.clone();
        warn!(job_id = %id, error = ?snapshot.error_message, "Job failed");
        Ok(snapshot)
    }

    pub fn cancel(&mut self, id: &str) -> Result<Job> {
        let job = self.update_status(id, JobStatus::Cancelled, None)?;
        info!(job_id = %id, "Job cancelled");
        Ok(job)
    }

    /// Terminal transitions are accepted from `pending` as well; the
    /// implicit `processing` step is applied first.
    fn step_through_processing(&mut self, id: &str, target: JobStatus) -> Result<Job> {
        let current = self.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))?.status;
        if current == JobStatus::Pending {
            self.update_status(id, JobStatus::Processing, None)?;
        }
        self.update_status(id, target, None)
    }

    /// Move a job toward a server-reported status.
    ///
    /// Stale reports (the server is behind local state) and reports about
    /// locally terminal jobs are ignored. Returns the job and whether its
    /// status changed.
    pub fn advance_to(&mut self, id: &str, status: JobStatus, progress: Option<u8>) -> Result<(Job, bool)> {
        let current = self.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))?.status;

        if current.is_terminal() || (current == JobStatus::Processing && status == JobStatus::Pending) {
            let job = self.get_mut(id)?.clone();
            return Ok((job, false));
        }

        if current == status {
            let job = match progress {
                Some(progress) => self.set_progress(id, progress)?,
                None => self.get_mut(id)?.clone(),
            };
            return Ok((job, false));
        }

        if current == JobStatus::Pending && matches!(status, JobStatus::Completed | JobStatus::Failed) {
            self.update_status(id, JobStatus::Processing, None)?;
        }
        let job = self.update_status(id, status, progress)?;
        Ok((job, true))
    }

    /// Attach the server's id to a local job. Returns `false` if it already
    /// carried that same id.
    pub fn link_server_job(&mut self, id: &str, server_id: &str) -> Result<bool> {
        let job = self.get_mut(id)?;
        match job.metadata.server_job_id() {
            Some(existing) if existing == server_id => Ok(false),
            Some(existing) => Err(JobError::AlreadyLinked {
                id: id.to_string(),
                existing: existing.to_string(),
            }),
            None => {
                job.metadata.set_server_job_id(server_id.to_string());
                job.updated_at = Utc::now();
                info!(job_id = %id, server_job_id = %server_id, "Job linked to server job");
                Ok(true)
            }
        }
    }

    pub fn find_by_server_id(&self, server_id: &str) -> Option<&Job> {
        self.jobs
            .iter()
            .find(|job| job.server_job_id() == Some(server_id))
    }

    /// Track a server job that has no local counterpart, already linked
    pub fn import_server_job(&mut self, server_job: &ServerJob) -> String {
        let id = Self::new_job_id();
        let mut metadata = JobMetadata::default();
        metadata.set_server_job_id(server_job.id.clone());

        let progress = if server_job.status == JobStatus::Completed {
            100
        } else {
            server_job.progress.min(100)
        };

        let job = Job {
            id: id.clone(),
            job_type: server_job.job_type,
            status: server_job.status,
            image_url: server_job.image_url.clone(),
            result_url: server_job.result_urls.first().cloned(),
            progress,
            error_message: server_job.error_message.clone(),
            created_at: server_job.created_at,
            updated_at: Utc::now(),
            metadata,
        };

        info!(job_id = %id, server_job_id = %server_job.id, status = %job.status, "Imported server job");

        let position = self
            .jobs
            .iter()
            .position(|existing| existing.created_at > job.created_at)
            .unwrap_or(self.jobs.len());
        self.jobs.insert(position, job);
        self.refresh();
        self.enforce_retention();
        id
    }

    /// Claim the outstanding refund for a job, marking it refunded.
    ///
    /// Returns `None` if nothing was charged or the refund was already taken.
    pub fn take_refund(&mut self, id: &str) -> Result<Option<i64>> {
        let job = self.get_mut(id)?;
        let amount = job.refundable_credits();
        if amount.is_some() {
            job.metadata.refunded = true;
            job.updated_at = Utc::now();
        }
        Ok(amount)
    }

    pub fn by_type(&self, job_type: JobType) -> Vec<&Job> {
        self.jobs.iter().filter(|job| job.job_type == job_type).collect()
    }

    pub fn by_status(&self, status: JobStatus) -> Vec<&Job> {
        self.jobs.iter().filter(|job| job.status == status).collect()
    }

    pub fn latest_of_type(&self, job_type: JobType) -> Option<&Job> {
        self.jobs
            .iter()
            .filter(|job| job.job_type == job_type)
            .max_by_key(|job| job.created_at)
    }

    /// Snapshot of the active set
    pub fn active_jobs(&self) -> Vec<Job> {
        self.jobs.iter().filter(|job| job.is_active()).cloned().collect()
    }

    pub fn any_active(&self) -> bool {
        self.any_active
    }

    fn refresh(&mut self) {
        self.any_active = self.jobs.iter().any(Job::is_active);
    }

    /// Evict oldest terminal jobs until the history fits the cap. Runs when
    /// jobs are added, so a full history of active jobs may briefly exceed it.
    fn enforce_retention(&mut self) {
        while self.jobs.len() > self.history_cap {
            let oldest_terminal = self
                .jobs
                .iter()
                .enumerate()
                .filter(|(_, job)| job.status.is_terminal())
                .min_by_key(|(_, job)| job.created_at)
                .map(|(index, _)| index);

            match oldest_terminal {
                Some(index) => {
                    let evicted = self.jobs.remove(index);
                    debug!(job_id = %evicted.id, status = %evicted.status, "Evicted job from history");
                }
                None => {
                    warn!(
                        len = self.jobs.len(),
                        cap = self.history_cap,
                        "Job history over capacity with no terminal jobs to evict"
                    );
                    break;
                }
            }
        }
    }
}

/// Persisted projection of [`JobRegistry`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsSnapshot {
    pub jobs: Vec<Job>,
}

impl PersistedStore for JobRegistry {
    const STORE_NAME: &'static str = "jobs";
    type Snapshot = JobsSnapshot;

    fn snapshot(&self) -> JobsSnapshot {
        JobsSnapshot {
            jobs: self.jobs.clone(),
        }
    }

    fn restore(&mut self, snapshot: JobsSnapshot) {
        self.jobs = snapshot.jobs;
        self.jobs.sort_by_key(|job| job.created_at);
        self.refresh();
        self.enforce_retention();
    }

    fn reset(&mut self) {
        self.jobs.clear();
        self.any_active = false;
    }

    fn is_meaningful(snapshot: &JobsSnapshot) -> bool {
        !snapshot.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn descriptor(job_type: JobType, image_url: &str) -> JobDescriptor {
        JobDescriptor::builder()
            .job_type(job_type)
            .image_url(image_url)
            .build()
    }

    fn registry_with_cap(cap: usize) -> JobRegistry {
        JobRegistry::new(&RetentionConfig {
            job_history: cap,
            ..RetentionConfig::default()
        })
    }

    #[test]
    fn test_created_job_carries_charge() {
        let mut registry = JobRegistry::default();
        let descriptor = JobDescriptor::builder()
            .job_type(JobType::Upscale)
            .image_url("img://a")
            .credits_charged(12)
            .build();
        let id = registry.create_job_with_id("job_fixed".to_string(), descriptor);

        let job = registry.get(&id).unwrap();
        assert_eq!(id, "job_fixed");
        assert_eq!(job.metadata.credits_charged, Some(12));
        assert_eq!(job.server_job_id(), None);
        assert!(!job.metadata.refunded);
    }

    #[test]
    fn test_job_lifecycle() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(descriptor(JobType::TextToImage, "img://a"));

        let job = registry.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(registry.any_active());
        assert_eq!(registry.active_jobs().len(), 1);

        let job = registry.update_status(&id, JobStatus::Processing, Some(10)).unwrap();
        assert_eq!(job.progress, 10);

        let job = registry.complete(&id, Some("https://cdn/out.png".to_string())).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.result_url.as_deref(), Some("https://cdn/out.png"));
        assert!(!registry.any_active());
        assert!(registry.active_jobs().is_empty());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(descriptor(JobType::Upscale, "img://a"));

        let err = registry.update_status(&id, JobStatus::Completed, None).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));

        registry.cancel(&id).unwrap();
        let err = registry.update_status(&id, JobStatus::Processing, None).unwrap_err();
        assert!(matches!(
            err,
            JobError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            }
        ));
        assert!(registry.cancel(&id).is_err());
        assert!(matches!(
            registry.set_progress(&id, 50),
            Err(JobError::InvalidProgress { .. })
        ));
    }

    #[test]
    fn test_fail_from_pending_steps_through_processing() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(descriptor(JobType::ImageToVideo, "img://v"));

        let job = registry.fail(&id, "provider rejected prompt").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("provider rejected prompt"));
    }

    #[test]
    fn test_unknown_job() {
        let mut registry = JobRegistry::default();
        assert_eq!(
            registry.update_status("missing", JobStatus::Processing, None),
            Err(JobError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn test_progress_clamped() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(descriptor(JobType::Upscale, "img://a"));
        assert_eq!(registry.set_progress(&id, 250).unwrap().progress, 100);
    }

    #[test]
    fn test_server_link_is_set_once() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(descriptor(JobType::Upscale, "img://a"));

        assert!(registry.link_server_job(&id, "S1").unwrap());
        assert!(!registry.link_server_job(&id, "S1").unwrap());
        assert_eq!(
            registry.link_server_job(&id, "S2"),
            Err(JobError::AlreadyLinked {
                id: id.clone(),
                existing: "S1".to_string()
            })
        );
        assert_eq!(registry.find_by_server_id("S1").unwrap().id, id);
        assert!(registry.find_by_server_id("S2").is_none());
    }

    #[test]
    fn test_advance_to_ignores_stale_reports() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(descriptor(JobType::Upscale, "img://a"));

        let (job, changed) = registry.advance_to(&id, JobStatus::Completed, None).unwrap();
        assert!(changed);
        assert_eq!(job.status, JobStatus::Completed);

        let (job, changed) = registry.advance_to(&id, JobStatus::Processing, Some(30)).unwrap();
        assert!(!changed);
        assert_eq!(job.status, JobStatus::Completed);

        let other = registry.create_job(descriptor(JobType::Upscale, "img://b"));
        registry.update_status(&other, JobStatus::Processing, None).unwrap();
        let (job, changed) = registry.advance_to(&other, JobStatus::Pending, None).unwrap();
        assert!(!changed);
        assert_eq!(job.status, JobStatus::Processing);

        let (job, changed) = registry.advance_to(&other, JobStatus::Processing, Some(70)).unwrap();
        assert!(!changed);
        assert_eq!(job.progress, 70);
    }

    #[test]
    fn test_queries() {
        let mut registry = JobRegistry::default();
        let a = registry.create_job(descriptor(JobType::Upscale, "img://a"));
        let b = registry.create_job(descriptor(JobType::Upscale, "img://b"));
        let c = registry.create_job(descriptor(JobType::TextToImage, "img://c"));
        registry.complete(&a, None).unwrap();

        assert_eq!(registry.by_type(JobType::Upscale).len(), 2);
        assert_eq!(registry.by_status(JobStatus::Pending).len(), 2);
        assert_eq!(registry.latest_of_type(JobType::Upscale).unwrap().id, b);
        assert_eq!(registry.latest_of_type(JobType::TextToImage).unwrap().id, c);
        assert!(registry.latest_of_type(JobType::ImageToVideo).is_none());
    }

    #[test]
    fn test_retention_evicts_oldest_terminal_first() {
        let mut registry = registry_with_cap(3);
        let active = registry.create_job(descriptor(JobType::Upscale, "img://0"));
        let done_1 = registry.create_job(descriptor(JobType::Upscale, "img://1"));
        let done_2 = registry.create_job(descriptor(JobType::Upscale, "img://2"));
        registry.complete(&done_1, None).unwrap();
        registry.complete(&done_2, None).unwrap();

        registry.create_job(descriptor(JobType::Upscale, "img://3"));

        assert_eq!(registry.len(), 3);
        assert!(registry.get(&active).is_some());
        assert!(registry.get(&done_1).is_none());
        assert!(registry.get(&done_2).is_some());
    }

    #[test]
    fn test_retention_never_drops_active_jobs() {
        let mut registry = registry_with_cap(2);
        for i in 0..4 {
            registry.create_job(descriptor(JobType::Upscale, &format!("img://{i}")));
        }
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.active_jobs().len(), 4);
    }

    #[test]
    fn test_refund_taken_once() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(
            JobDescriptor::builder()
                .job_type(JobType::Upscale)
                .image_url("img://a")
                .credits_charged(5)
                .build(),
        );

        assert_eq!(registry.take_refund(&id).unwrap(), Some(5));
        assert_eq!(registry.take_refund(&id).unwrap(), None);

        let free = registry.create_job(descriptor(JobType::Upscale, "img://b"));
        assert_eq!(registry.take_refund(&free).unwrap(), None);
    }

    #[test]
    fn test_import_keeps_creation_order() {
        let mut registry = JobRegistry::default();
        let local = registry.create_job(descriptor(JobType::Upscale, "img://local"));

        let server_job = ServerJob {
            id: "S9".to_string(),
            job_type: JobType::TextToImage,
            status: JobStatus::Processing,
            progress: 40,
            result_urls: Vec::new(),
            image_url: "img://remote".to_string(),
            created_at: Utc::now() - ChronoDuration::seconds(60),
            error_message: None,
        };
        let imported = registry.import_server_job(&server_job);

        assert_eq!(registry.jobs()[0].id, imported);
        assert_eq!(registry.jobs()[1].id, local);
        assert_eq!(registry.find_by_server_id("S9").unwrap().progress, 40);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut registry = JobRegistry::default();
        let id = registry.create_job(descriptor(JobType::Upscale, "img://a"));
        registry.link_server_job(&id, "S1").unwrap();

        let snapshot = registry.snapshot();
        assert!(JobRegistry::is_meaningful(&snapshot));

        let mut restored = JobRegistry::default();
        restored.restore(snapshot);
        assert!(restored.any_active());
        assert_eq!(restored.find_by_server_id("S1").unwrap().id, id);

        restored.reset();
        assert!(restored.is_empty());
        assert!(!JobRegistry::is_meaningful(&restored.snapshot()));
    }
}
