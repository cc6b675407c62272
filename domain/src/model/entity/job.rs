use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::vo::QueueError;

/// A deconvolution job as it sits in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner: String,
    pub group: String,
    /// Input images, in submission order. Never empty.
    pub files: Vec<String>,
    pub autoseries: bool,
    pub queued: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
    /// Full server name, only while the engine runs for this job.
    pub server: Option<String>,
    /// Engine process id on `server`.
    pub pid: Option<u32>,
    pub status: JobStatus,
    /// Lower is served first. `None` until the scheduler has seen the job.
    pub priority: Option<i64>,
}

/// Queue state of a job.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a free server.
    #[default]
    Queued,
    /// The engine runs on `server` with `pid`.
    Started,
    /// Held back by an operator until the paused jobs are restarted.
    Paused,
    /// Marked for removal before it was started.
    Broken,
    /// Marked for removal while running, the engine still has to be killed.
    Kill,
}

impl Job {
    /// A freshly submitted job with a generated id.
    pub fn new(
        owner: impl Into<String>,
        group: impl Into<String>,
        files: Vec<String>,
        autoseries: bool,
    ) -> Result<Self, QueueError> {
        Self::with_id(
            Uuid::new_v4().simple().to_string(),
            owner,
            group,
            files,
            autoseries,
            Utc::now(),
        )
    }

    pub fn with_id(
        id: impl Into<String>,
        owner: impl Into<String>,
        group: impl Into<String>,
        files: Vec<String>,
        autoseries: bool,
        queued: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        let id = id.into();
        if files.is_empty() {
            return Err(QueueError::InvalidJob {
                id,
                reason: "a job needs at least one input file".to_owned(),
            });
        }
        Ok(Self {
            id,
            owner: owner.into(),
            group: group.into(),
            files,
            autoseries,
            queued,
            start: None,
            stop: None,
            server: None,
            pid: None,
            status: JobStatus::Queued,
            priority: None,
        })
    }

    /// First input file, the secondary ordering key of the queue.
    pub fn first_file(&self) -> &str {
        self.files.first().map(String::as_str).unwrap_or_default()
    }

    /// Name of the task template the engine is started with.
    pub fn template_name(&self) -> String {
        format!("{}.hgsb", self.id)
    }

    /// Ordering of jobs that share a priority: oldest first, then by file name.
    pub fn queue_key(&self) -> (DateTime<Utc>, &str, &str) {
        (self.queued, self.first_file(), self.id.as_str())
    }
}

impl JobStatus {
    /// Removal target when an operator removes a job in this state.
    pub fn removal_target(self) -> Option<JobStatus> {
        match self {
            Self::Queued | Self::Paused => Some(Self::Broken),
            Self::Started => Some(Self::Kill),
            Self::Broken | Self::Kill => None,
        }
    }
}
