use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of an asynchronous operation.
///
/// `pending → processing → {completed, failed}`, and either non-terminal
/// state may be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether a single step from `self` to `next` is part of the state machine
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Cancelled)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Kind of generation operation a job tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    TextToImage,
    ImageToImage,
    Upscale,
    BackgroundRemoval,
    ImageToVideo,
    /// Reported by the server but not known to this client
    #[serde(other)]
    Unknown,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextToImage => "text_to_image",
            Self::ImageToImage => "image_to_image",
            Self::Upscale => "upscale",
            Self::BackgroundRemoval => "background_removal",
            Self::ImageToVideo => "image_to_video",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text_to_image" => Ok(Self::TextToImage),
            "image_to_image" => Ok(Self::ImageToImage),
            "upscale" => Ok(Self::Upscale),
            "background_removal" => Ok(Self::BackgroundRemoval),
            "image_to_video" => Ok(Self::ImageToVideo),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Typed job metadata plus a narrow extension map.
///
/// The server back-reference is set at most once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    server_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credits_charged: Option<i64>,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, Value>,
}

impl JobMetadata {
    /// Metadata for a job that is not linked to a server job yet
    pub fn new(credits_charged: Option<i64>, extensions: BTreeMap<String, Value>) -> Self {
        Self {
            server_job_id: None,
            credits_charged,
            refunded: false,
            extensions,
        }
    }

    pub fn server_job_id(&self) -> Option<&str> {
        self.server_job_id.as_deref()
    }

    pub(crate) fn set_server_job_id(&mut self, server_id: String) {
        debug_assert!(self.server_job_id.is_none());
        self.server_job_id = Some(server_id);
    }
}

/// One tracked asynchronous operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl Job {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn server_job_id(&self) -> Option<&str> {
        self.metadata.server_job_id()
    }

    /// Credits still owed back to the user if this job delivers nothing
    pub fn refundable_credits(&self) -> Option<i64> {
        match self.metadata.credits_charged {
            Some(amount) if amount > 0 && !self.metadata.refunded => Some(amount),
            _ => None,
        }
    }
}

/// What the caller knows about an operation when it starts
#[derive(Debug, Clone, Builder)]
pub struct JobDescriptor {
    pub job_type: JobType,
    #[builder(into)]
    pub image_url: String,
    pub credits_charged: Option<i64>,
    #[builder(default)]
    pub extensions: BTreeMap<String, Value>,
}
