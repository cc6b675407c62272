use chrono::{DateTime, Utc};

use crate::model::{
    entity::{Job, JobStatistics, JobStatus, Server},
    vo::SwitchState,
};

/// Rows of the job queue and their input files.
#[async_trait::async_trait]
pub trait JobRepository: Send + Sync {
    /// Inserts the job in `queued` state together with its files.
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()>;

    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> anyhow::Result<Vec<Job>>;

    /// Every job, ordered by priority, queued time, status and first file.
    async fn list_queue(&self) -> anyhow::Result<Vec<Job>>;

    /// The `queued` job with the lowest priority value.
    ///
    /// Ties, and jobs without priority (served last), fall back to queued
    /// time and then to the first input file.
    async fn next_queued_job(&self) -> anyhow::Result<Option<Job>>;

    /// Returns whether a row was changed.
    async fn update_job_status(&self, id: &str, status: JobStatus) -> anyhow::Result<bool>;

    async fn update_priority(&self, id: &str, priority: i64) -> anyhow::Result<()>;

    /// `queued → started`, recording placement. Nothing happens and `false` is
    /// returned when the job is no longer queued.
    async fn start_job(
        &self,
        id: &str,
        server: &str,
        pid: u32,
        start: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `started → queued`, clearing placement.
    async fn requeue_job(&self, id: &str) -> anyhow::Result<bool>;

    /// `queued → paused`.
    async fn pause_job(&self, id: &str) -> anyhow::Result<bool>;

    /// `paused → queued` for every paused job. Returns how many moved.
    async fn restart_paused_jobs(&self) -> anyhow::Result<u64>;

    /// `queued|paused → broken`, `started → kill`. Returns the new status, or
    /// `None` when the job does not exist or is already marked.
    async fn mark_job_removed(&self, id: &str) -> anyhow::Result<Option<JobStatus>>;

    /// Removes the job from every job table in one transaction. Returns
    /// whether the job existed.
    async fn delete_job_everywhere(&self, id: &str) -> anyhow::Result<bool>;
}

/// The compute servers. Claim and release are the only status changes.
#[async_trait::async_trait]
pub trait ServerRepository: Send + Sync {
    /// Atomically moves one `free` server to `busy`, stamps the claim time and
    /// returns it.
    async fn claim_free_server(&self) -> anyhow::Result<Option<Server>>;

    /// Records the engine pid on a claimed server.
    async fn set_server_process(&self, name: &str, pid: u32) -> anyhow::Result<()>;

    /// `busy → free`, clearing pid and claim time, but only while the row still
    /// holds the claim `seen` was read from (same pid and claim time). Returns
    /// whether the server was freed.
    async fn release_server(&self, seen: &Server) -> anyhow::Result<bool>;

    async fn get_server(&self, name: &str) -> anyhow::Result<Option<Server>>;

    async fn list_servers(&self) -> anyhow::Result<Vec<Server>>;

    async fn add_server(&self, server: &Server) -> anyhow::Result<()>;

    async fn remove_server(&self, name: &str) -> anyhow::Result<bool>;
}

/// Queue-wide state: the maintenance switch and the accounting table.
#[async_trait::async_trait]
pub trait QueueStateRepository: Send + Sync {
    async fn get_switch_state(&self) -> anyhow::Result<SwitchState>;

    async fn set_switch_state(&self, state: SwitchState) -> anyhow::Result<()>;

    async fn record_job_statistics(&self, statistics: &JobStatistics) -> anyhow::Result<()>;

    async fn list_statistics(&self) -> anyhow::Result<Vec<JobStatistics>>;
}

/// Everything the scheduler and the coordinator need from the store.
pub trait QueueRepository: JobRepository + ServerRepository + QueueStateRepository {}

impl<T> QueueRepository for T where T: JobRepository + ServerRepository + QueueStateRepository {}
