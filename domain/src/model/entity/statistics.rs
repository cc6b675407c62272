use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Job;

/// Accounting row written when a job leaves the queue after running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub id: String,
    pub owner: String,
    pub group: String,
    pub start: Option<DateTime<Utc>>,
    pub stop: DateTime<Utc>,
    pub server: Option<String>,
}

impl JobStatistics {
    pub fn finished(job: &Job, stop: DateTime<Utc>) -> Self {
        Self {
            id: job.id.clone(),
            owner: job.owner.clone(),
            group: job.group.clone(),
            start: job.start,
            stop,
            server: job.server.clone(),
        }
    }
}
