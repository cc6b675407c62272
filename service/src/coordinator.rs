use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use domain::{
    model::{
        entity::{Job, JobStatistics, JobStatus, Server, ServerStatus},
        vo::{QueueError, SwitchState},
    },
    repository::QueueRepository,
    service::{ExecutionChannel, ExecutionChannelOpener, PriorityService},
};
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, TypedBuilder)]
pub struct CoordinatorConfig {
    /// Directory holding the `<job id>.hgsb` task templates.
    #[builder(setter(into))]
    pub template_dir: PathBuf,

    #[builder(default = Duration::from_secs(30))]
    pub open_timeout: Duration,

    /// Bound on the whole launch, pid scraping included.
    #[builder(default = Duration::from_secs(60))]
    pub launch_timeout: Duration,

    #[builder(default = Duration::from_secs(20))]
    pub probe_timeout: Duration,

    #[builder(default = Duration::from_secs(20))]
    pub kill_timeout: Duration,

    /// Slack added to the longest dispatch before a claim counts as abandoned.
    #[builder(default = Duration::from_secs(30))]
    pub claim_margin: Duration,
}

impl CoordinatorConfig {
    /// How long a busy server may go without a started job before the
    /// consistency sweep frees it. Covers the longest dispatch, including
    /// stopping an engine whose job left the queue during launch.
    pub fn claim_lease(&self) -> Duration {
        self.open_timeout * 2 + self.launch_timeout + self.kill_timeout + self.claim_margin
    }
}

/// A job that was handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub job_id: String,
    pub server: String,
    pub pid: u32,
}

/// What one pass did, for logging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub removed: usize,
    pub killed: usize,
    pub finished: usize,
    pub reconciled: usize,
    pub dispatched: usize,
}

/// Drives jobs from `queued` to completion or removal.
///
/// All state lives in the store; passes may run in several processes at once
/// because claims and starts are conditional updates.
pub struct QueueCoordinator {
    repo: Arc<dyn QueueRepository>,
    opener: Arc<dyn ExecutionChannelOpener>,
    priorities: Arc<dyn PriorityService>,
    config: CoordinatorConfig,
}

impl QueueCoordinator {
    pub fn new(
        repo: Arc<dyn QueueRepository>,
        opener: Arc<dyn ExecutionChannelOpener>,
        priorities: Arc<dyn PriorityService>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            repo,
            opener,
            priorities,
            config,
        }
    }

    /// One polling pass. Only a switched-off queue is an error; everything
    /// else is logged and retried on the next pass.
    pub async fn run_pass(&self) -> Result<PassReport, QueueError> {
        self.check_switch().await?;

        let mut report = PassReport::default();
        match self.remove_broken_jobs().await {
            Ok(n) => report.removed = n,
            Err(e) => tracing::error!("Removing broken jobs failed: {e:#}"),
        }
        match self.kill_marked_jobs().await {
            Ok(n) => report.killed = n,
            Err(e) => tracing::error!("Killing marked jobs failed: {e:#}"),
        }
        match self.check_running().await {
            Ok(n) => report.finished = n,
            Err(e) => tracing::error!("Checking running jobs failed: {e:#}"),
        }
        match self.reconcile().await {
            Ok(n) => report.reconciled = n,
            Err(e) => tracing::error!("Consistency sweep failed: {e:#}"),
        }
        if let Err(e) = self.priorities.recompute_priorities().await {
            tracing::error!("Priority pass failed: {e:#}");
        }
        loop {
            match self.dispatch().await {
                Ok(Some(_)) => report.dispatched += 1,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("{e:#}");
                    break;
                }
            }
        }

        tracing::debug!(?report, "Pass done");
        Ok(report)
    }

    pub async fn check_switch(&self) -> Result<(), QueueError> {
        match self.repo.get_switch_state().await.map_err(QueueError::Store)? {
            SwitchState::On => Ok(()),
            SwitchState::Off => Err(QueueError::SwitchOff),
        }
    }

    /// Starts the best queued job on a free server, if there are both.
    ///
    /// On failure the server is released and the job stays queued.
    pub async fn dispatch(&self) -> anyhow::Result<Option<Dispatched>> {
        let Some(job) = self.repo.next_queued_job().await? else {
            return Ok(None);
        };
        let Some(mut server) = self.repo.claim_free_server().await? else {
            tracing::debug!(job_id = %job.id, "No free server");
            return Ok(None);
        };
        tracing::info!(job_id = %job.id, server = %server.name, "Dispatching job");

        let pid = match self.launch(&job, &server).await {
            Ok(pid) => pid,
            Err(e) => {
                self.release(&server).await?;
                return Err(e.context(format!("Dispatch of job {} failed", job.id)));
            }
        };

        match self.repo.set_server_process(&server.name, pid).await {
            Ok(()) => server.job = Some(pid),
            Err(e) => tracing::warn!(server = %server.name, "Cannot record engine pid {pid}: {e:#}"),
        }
        let started = match self.repo.start_job(&job.id, &server.name, pid, Utc::now()).await {
            Ok(started) => started,
            Err(e) => {
                self.abandon(&server, pid, &job.id).await;
                return Err(e.context(format!("Cannot record start of job {}", job.id)));
            }
        };
        if !started {
            // Removed or paused while the engine was starting.
            tracing::warn!(job_id = %job.id, "Job left the queue during launch, stopping engine");
            self.abandon(&server, pid, &job.id).await;
            return Ok(None);
        }

        tracing::info!(job_id = %job.id, server = %server.name, pid, "Job started");
        Ok(Some(Dispatched {
            job_id: job.id,
            server: server.name,
            pid,
        }))
    }

    /// Finishes every started job whose engine is gone. Returns how many.
    pub async fn check_running(&self) -> anyhow::Result<usize> {
        let mut finished = 0;
        for job in self.repo.list_jobs_by_status(JobStatus::Started).await? {
            let (Some(server), Some(pid)) = (job.server.as_deref(), job.pid) else {
                continue;
            };
            let server = self.server_named(server, pid).await?;
            match self.probe(&server, pid, &job.id).await {
                Ok(true) => {}
                Ok(false) => match self.finish(&job).await {
                    Ok(true) => finished += 1,
                    Ok(false) => {}
                    Err(e) => tracing::error!(job_id = %job.id, "Cleanup failed: {e:#}"),
                },
                Err(e) => tracing::warn!(job_id = %job.id, "Cannot probe engine {pid}: {e:#}"),
            }
        }
        Ok(finished)
    }

    /// Terminates engines of jobs marked `kill` and removes the jobs.
    ///
    /// The server goes back only after this sweep deleted the job, so a sweep
    /// that lost the race to another manager leaves the next claim alone.
    pub async fn kill_marked_jobs(&self) -> anyhow::Result<usize> {
        let mut killed = 0;
        for job in self.repo.list_jobs_by_status(JobStatus::Kill).await? {
            let server = match (job.server.as_deref(), job.pid) {
                (Some(name), Some(pid)) => {
                    let server = self.server_named(name, pid).await?;
                    match self.terminate(&server, pid, &job.id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(job_id = %job.id, "Kill of engine {pid} reported failure")
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, "Cannot kill engine {pid}, retrying later: {e:#}");
                            continue;
                        }
                    }
                    Some(server)
                }
                _ => None,
            };
            if !self.repo.delete_job_everywhere(&job.id).await? {
                continue;
            }
            if let Some(server) = &server {
                self.release(server).await?;
            }
            tracing::info!(job_id = %job.id, "Job killed and removed");
            killed += 1;
        }
        Ok(killed)
    }

    /// Deletes jobs marked `broken`. Returns how many.
    pub async fn remove_broken_jobs(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for job in self.repo.list_jobs_by_status(JobStatus::Broken).await? {
            if self.repo.delete_job_everywhere(&job.id).await? {
                tracing::info!(job_id = %job.id, "Job removed");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Repairs half-finished transitions.
    ///
    /// A busy server no job refers to is freed once its claim is older than
    /// [`CoordinatorConfig::claim_lease`]; a younger claim may belong to a
    /// dispatch still in flight in another process. Started jobs without
    /// placement go back to the queue.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let jobs = self.repo.list_queue().await?;
        let servers = self.repo.list_servers().await?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.claim_lease())?;
        let mut repaired = 0;

        let in_use: HashSet<&str> = jobs
            .iter()
            .filter(|job| matches!(job.status, JobStatus::Started | JobStatus::Kill))
            .filter_map(|job| job.server.as_deref())
            .collect();
        let orphans = servers
            .iter()
            .filter(|server| server.status == ServerStatus::Busy)
            .filter(|server| !in_use.contains(server.name.as_str()))
            .filter(|server| server.claim_expired(now, lease));
        for server in orphans {
            tracing::warn!(server = %server.name, "Busy server has no job, freeing it");
            if self.repo.release_server(server).await? {
                repaired += 1;
            }
        }

        for job in jobs.iter().filter(|job| job.status == JobStatus::Started) {
            if job.server.is_none() || job.pid.is_none() {
                tracing::warn!(job_id = %job.id, "Started job without placement, requeueing");
                if self.repo.requeue_job(&job.id).await? {
                    repaired += 1;
                }
            }
        }
        Ok(repaired)
    }

    async fn launch(&self, job: &Job, server: &Server) -> anyhow::Result<u32> {
        let mut channel = self.open(server, &job.id).await?;
        let template = self.config.template_dir.join(job.template_name());
        let template = template.to_string_lossy();

        let result = bounded(self.config.launch_timeout, "engine launch", server, async {
            if !channel.copy_to_host(&template).await {
                anyhow::bail!(QueueError::Connectivity {
                    host: server.host(),
                    reason: format!("cannot copy {template}"),
                });
            }
            channel.launch_engine(&template).await
        })
        .await;

        channel.close().await;
        result?
    }

    async fn probe(&self, server: &Server, pid: u32, log_name: &str) -> anyhow::Result<bool> {
        let mut channel = self.open(server, log_name).await?;
        let alive = bounded(
            self.config.probe_timeout,
            "liveness probe",
            server,
            channel.is_alive(pid),
        )
        .await;
        channel.close().await;
        alive?
    }

    async fn terminate(&self, server: &Server, pid: u32, log_name: &str) -> anyhow::Result<bool> {
        let mut channel = self.open(server, log_name).await?;
        let killed = bounded(self.config.kill_timeout, "kill", server, channel.kill(pid)).await;
        channel.close().await;
        Ok(killed?)
    }

    async fn open(
        &self,
        server: &Server,
        log_name: &str,
    ) -> anyhow::Result<Box<dyn ExecutionChannel>> {
        bounded(
            self.config.open_timeout,
            "shell start",
            server,
            self.opener.open(server, log_name),
        )
        .await?
        .map_err(|e| {
            QueueError::Connectivity {
                host: server.host(),
                reason: format!("{e:#}"),
            }
            .into()
        })
    }

    /// Removes a finished job. Only the caller that actually deleted the job
    /// records statistics and frees the server, so repeated polls are harmless.
    async fn finish(&self, job: &Job) -> anyhow::Result<bool> {
        if !self.repo.delete_job_everywhere(&job.id).await? {
            return Ok(false);
        }
        let statistics = JobStatistics::finished(job, Utc::now());
        if let Err(e) = self.repo.record_job_statistics(&statistics).await {
            tracing::warn!(job_id = %job.id, "Cannot record statistics: {e:#}");
        }
        if let Some(name) = &job.server {
            if let Some(server) = self.repo.get_server(name).await? {
                self.release(&server).await?;
            }
        }
        tracing::info!(job_id = %job.id, "Job finished");
        Ok(true)
    }

    /// Gives a claim back. A claim that changed meanwhile is left alone.
    async fn release(&self, server: &Server) -> anyhow::Result<()> {
        let released = self
            .repo
            .release_server(server)
            .await
            .with_context(|| format!("Cannot release server {}", server.name))?;
        if !released {
            tracing::warn!(server = %server.name, "Claim changed meanwhile, leaving it");
        }
        Ok(())
    }

    /// Stops an engine no started job refers to and gives its server back.
    /// Failures are logged; the consistency sweep frees what is left busy.
    async fn abandon(&self, server: &Server, pid: u32, job_id: &str) {
        match self.terminate(server, pid, job_id).await {
            Ok(true) => {}
            Ok(false) => tracing::error!(job_id, "Kill of engine {pid} reported failure"),
            Err(e) => tracing::error!(job_id, "Cannot stop engine {pid}: {e:#}"),
        }
        if let Err(e) = self.release(server).await {
            tracing::error!(job_id, "{e:#}");
        }
    }

    /// The server row, or a stand-in when it was unregistered meanwhile.
    async fn server_named(&self, name: &str, pid: u32) -> anyhow::Result<Server> {
        Ok(self.repo.get_server(name).await?.unwrap_or_else(|| Server {
            name: name.to_owned(),
            engine_path: String::new(),
            status: ServerStatus::Busy,
            job: Some(pid),
            gpu_id: None,
            claimed: None,
        }))
    }
}

/// Operator actions. All are plain store updates; the sweeps do the rest.
impl QueueCoordinator {
    pub async fn submit(&self, job: &Job) -> anyhow::Result<()> {
        if job.files.is_empty() {
            return Err(QueueError::InvalidJob {
                id: job.id.clone(),
                reason: "no input files".to_owned(),
            }
            .into());
        }
        self.repo.insert_job(job).await?;
        tracing::info!(job_id = %job.id, owner = %job.owner, "Job queued");
        Ok(())
    }

    /// Marks a job for removal: `broken` before it runs, `kill` while it runs.
    pub async fn mark_job_removed(&self, id: &str) -> anyhow::Result<Option<JobStatus>> {
        if self.repo.get_job(id).await?.is_none() {
            return Err(QueueError::UnknownJob(id.to_owned()).into());
        }
        let marked = self.repo.mark_job_removed(id).await?;
        if let Some(status) = marked {
            tracing::info!(job_id = %id, "Job marked {status}");
        }
        Ok(marked)
    }

    pub async fn pause_job(&self, id: &str) -> anyhow::Result<bool> {
        self.repo.pause_job(id).await
    }

    pub async fn restart_paused_jobs(&self) -> anyhow::Result<u64> {
        let restarted = self.repo.restart_paused_jobs().await?;
        tracing::info!("Restarted {restarted} paused jobs");
        Ok(restarted)
    }

    pub async fn set_switch(&self, state: SwitchState) -> anyhow::Result<()> {
        self.repo.set_switch_state(state).await?;
        tracing::info!("Queue manager switch set {state}");
        Ok(())
    }
}

async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    server: &Server,
    fut: impl Future<Output = T>,
) -> Result<T, QueueError> {
    tokio::time::timeout(limit, fut).await.map_err(|_| QueueError::Timeout {
        operation,
        host: server.host(),
        after: limit,
    })
}

#[cfg(test)]
mod tests {
    use domain::repository::{QueueStateRepository, ServerRepository};
    use mockall::predicate::eq;

    use super::*;
    use crate::priority::PriorityScheduler;
    use crate::test_utils::{free_server, job_at, FakeOpener, MemoryRepo, MockChannel};

    fn coordinator(repo: &Arc<MemoryRepo>, opener: FakeOpener) -> (QueueCoordinator, Arc<FakeOpener>) {
        let opener = Arc::new(opener);
        let config = CoordinatorConfig::builder()
            .template_dir("/var/hrm/jobs")
            .launch_timeout(Duration::from_millis(200))
            .build();
        let coordinator = QueueCoordinator::new(
            repo.clone(),
            opener.clone(),
            Arc::new(PriorityScheduler::new(repo.clone())),
            config,
        );
        (coordinator, opener)
    }

    fn launching(pid: u32) -> MockChannel {
        let mut channel = MockChannel::closing();
        channel.expect_copy_to_host().return_const(true);
        channel
            .expect_launch_engine()
            .withf(|template| template.ends_with("/var/hrm/jobs/A.hgsb"))
            .times(1)
            .returning(move |_| Ok(pid));
        channel
    }

    fn probing(alive: bool) -> MockChannel {
        let mut channel = MockChannel::closing();
        channel.expect_is_alive().returning(move |_| Ok(alive));
        channel
    }

    fn started_job(id: &str, server: &str, pid: u32) -> Job {
        let mut job = job_at(id, "alice", 1, "a.tif");
        job.status = JobStatus::Started;
        job.server = Some(server.to_owned());
        job.pid = Some(pid);
        job.start = Some(Utc::now());
        job
    }

    fn busy_server(name: &str, pid: u32) -> Server {
        let mut server = free_server(name);
        server.status = ServerStatus::Busy;
        server.job = Some(pid);
        server.claimed = Some(Utc::now());
        server
    }

    #[tokio::test]
    async fn dispatch_claims_server_and_starts_job() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        let (coordinator, opener) = coordinator(&repo, FakeOpener::with([launching(4242)]));

        let dispatched = coordinator.dispatch().await.unwrap().unwrap();
        assert_eq!(
            dispatched,
            Dispatched {
                job_id: "A".to_owned(),
                server: "node1".to_owned(),
                pid: 4242
            }
        );

        let server = repo.server("node1").unwrap();
        assert_eq!(server.status, ServerStatus::Busy);
        assert_eq!(server.job, Some(4242));
        let job = repo.job("A").unwrap();
        assert_eq!(job.status, JobStatus::Started);
        assert_eq!(job.server.as_deref(), Some("node1"));
        assert_eq!(job.pid, Some(4242));
        assert!(job.start.is_some());
        assert_eq!(opener.opened(), [("node1".to_owned(), "A".to_owned())]);
    }

    #[tokio::test]
    async fn dispatch_without_free_server_changes_nothing() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(busy_server("node1", 7));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        let (coordinator, opener) = coordinator(&repo, FakeOpener::default());

        assert_eq!(coordinator.dispatch().await.unwrap(), None);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Queued);
        assert!(opener.opened().is_empty());
    }

    #[tokio::test]
    async fn dispatch_without_queued_job_leaves_servers_free() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        let (coordinator, _) = coordinator(&repo, FakeOpener::default());

        assert_eq!(coordinator.dispatch().await.unwrap(), None);
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Free);
    }

    #[tokio::test]
    async fn missing_pid_leaves_job_queued_and_server_free() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        let mut channel = MockChannel::closing();
        channel.expect_copy_to_host().return_const(true);
        channel
            .expect_launch_engine()
            .returning(|_| Err(anyhow::anyhow!("no pid in output log")));
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([channel]));

        assert!(coordinator.dispatch().await.is_err());
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Queued);
        assert!(repo.job("A").unwrap().pid.is_none());
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Free);
    }

    #[tokio::test]
    async fn unreachable_host_releases_the_claim() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        let (coordinator, _) = coordinator(&repo, FakeOpener::default());

        let err = coordinator.dispatch().await.unwrap_err();
        assert!(matches!(
            err.root_cause().downcast_ref::<QueueError>(),
            Some(QueueError::Connectivity { .. })
        ));
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Queued);
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Free);
    }

    #[tokio::test]
    async fn dispatch_picks_lowest_priority_value() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        let mut late = job_at("B", "bob", 9, "b.tif");
        late.priority = Some(5);
        let mut first = job_at("A", "alice", 10, "a.tif");
        first.priority = Some(1);
        repo.put_job(late);
        repo.put_job(first);
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([launching(11)]));

        let dispatched = coordinator.dispatch().await.unwrap().unwrap();
        assert_eq!(dispatched.job_id, "A");
        assert_eq!(repo.job("B").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn job_removed_during_launch_is_stopped() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));

        let mut launch = MockChannel::closing();
        launch.expect_copy_to_host().return_const(true);
        let marker = repo.clone();
        launch.expect_launch_engine().returning(move |_| {
            marker.set_status("A", JobStatus::Broken);
            Ok(99)
        });
        let mut kill = MockChannel::closing();
        kill.expect_kill().with(eq(99)).times(1).return_const(true);
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([launch, kill]));

        assert_eq!(coordinator.dispatch().await.unwrap(), None);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Broken);
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Free);
    }

    #[tokio::test]
    async fn dead_engine_is_cleaned_up_once() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(busy_server("node1", 4242));
        repo.put_job(started_job("A", "node1", 4242));
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([probing(false)]));

        assert_eq!(coordinator.check_running().await.unwrap(), 1);
        assert_eq!(coordinator.check_running().await.unwrap(), 0);

        assert!(repo.job("A").is_none());
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Free);
        let statistics = repo.statistics();
        assert_eq!(statistics.len(), 1);
        assert_eq!(statistics[0].id, "A");
        assert_eq!(statistics[0].server.as_deref(), Some("node1"));
    }

    #[tokio::test]
    async fn live_engine_is_left_running() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(busy_server("node1", 4242));
        repo.put_job(started_job("A", "node1", 4242));
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([probing(true)]));

        assert_eq!(coordinator.check_running().await.unwrap(), 0);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Started);
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Busy);
    }

    #[tokio::test]
    async fn failed_probe_is_not_a_completion() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(busy_server("node1", 4242));
        repo.put_job(started_job("A", "node1", 4242));
        let mut channel = MockChannel::closing();
        channel.expect_is_alive().returning(|_| Err(anyhow::anyhow!("ssh: timed out")));
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([channel]));

        assert_eq!(coordinator.check_running().await.unwrap(), 0);
        assert!(repo.job("A").is_some());
    }

    #[tokio::test]
    async fn kill_sweep_terminates_frees_and_removes() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(busy_server("node1", 4242));
        repo.put_job(started_job("A", "node1", 4242));
        let mut channel = MockChannel::closing();
        channel.expect_kill().with(eq(4242)).times(1).return_const(true);
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([channel]));

        assert_eq!(coordinator.mark_job_removed("A").await.unwrap(), Some(JobStatus::Kill));
        assert_eq!(coordinator.kill_marked_jobs().await.unwrap(), 1);
        assert!(repo.job("A").is_none());
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Free);
    }

    #[tokio::test]
    async fn unreachable_kill_target_is_retried_later() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(busy_server("node1", 4242));
        let mut job = started_job("A", "node1", 4242);
        job.status = JobStatus::Kill;
        repo.put_job(job);
        let (coordinator, _) = coordinator(&repo, FakeOpener::default());

        assert_eq!(coordinator.kill_marked_jobs().await.unwrap(), 0);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Kill);
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Busy);
    }

    #[tokio::test]
    async fn late_kill_sweep_leaves_the_next_claim_alone() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(busy_server("node1", 42));
        let mut job = started_job("A", "node1", 42);
        job.status = JobStatus::Kill;
        repo.put_job(job);

        let mut channel = MockChannel::closing();
        let other = repo.clone();
        channel.expect_kill().with(eq(42)).times(1).returning(move |_| {
            // Another manager removes A and starts B on node1 meanwhile.
            other.remove_job("A");
            other.update_server("node1", |server| {
                server.job = Some(77);
                server.claimed = Some(Utc::now());
            });
            other.put_job(started_job("B", "node1", 77));
            true
        });
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([channel]));

        assert_eq!(coordinator.kill_marked_jobs().await.unwrap(), 0);
        let server = repo.server("node1").unwrap();
        assert_eq!(server.status, ServerStatus::Busy);
        assert_eq!(server.job, Some(77));
        assert_eq!(repo.job("B").unwrap().status, JobStatus::Started);
    }

    #[tokio::test]
    async fn removing_a_queued_job_breaks_it() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        let (coordinator, _) = coordinator(&repo, FakeOpener::default());

        assert_eq!(coordinator.mark_job_removed("A").await.unwrap(), Some(JobStatus::Broken));
        assert_eq!(coordinator.remove_broken_jobs().await.unwrap(), 1);
        assert!(repo.job("A").is_none());

        let err = coordinator.mark_job_removed("A").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<QueueError>(), Some(QueueError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn orphaned_server_is_freed_once_its_claim_expires() {
        let repo = Arc::new(MemoryRepo::default());
        let mut server = busy_server("node1", 4242);
        server.claimed = Some(Utc::now() - chrono::Duration::hours(1));
        repo.put_server(server);
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        let (coordinator, _) = coordinator(&repo, FakeOpener::default());

        assert_eq!(coordinator.reconcile().await.unwrap(), 1);
        let server = repo.server("node1").unwrap();
        assert_eq!(server.status, ServerStatus::Free);
        assert_eq!(server.claimed, None);
    }

    #[tokio::test]
    async fn claim_in_flight_elsewhere_survives_the_sweep() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        repo.put_job(job_at("B", "bob", 2, "b.tif"));
        let (first, _) = coordinator(&repo, FakeOpener::default());
        let (second, opener) = coordinator(&repo, FakeOpener::default());

        // The first manager has claimed node1 and is still launching.
        let claim = repo.claim_free_server().await.unwrap().unwrap();
        assert_eq!(second.reconcile().await.unwrap(), 0);
        assert_eq!(second.reconcile().await.unwrap(), 0);
        assert_eq!(first.reconcile().await.unwrap(), 0);
        assert_eq!(second.dispatch().await.unwrap(), None);

        assert!(opener.opened().is_empty());
        let server = repo.server("node1").unwrap();
        assert_eq!(server.status, ServerStatus::Busy);
        assert_eq!(server.claimed, claim.claimed);
    }

    #[tokio::test]
    async fn failed_start_write_stops_the_engine() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        repo.fail_job_start();
        let mut kill = MockChannel::closing();
        kill.expect_kill().with(eq(5)).times(1).return_const(true);
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([launching(5), kill]));

        assert!(coordinator.dispatch().await.is_err());
        assert_eq!(repo.server("node1").unwrap().status, ServerStatus::Free);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn lease_covers_the_longest_dispatch() {
        let config = CoordinatorConfig::builder().template_dir("/var/hrm/jobs").build();
        assert_eq!(config.claim_lease(), Duration::from_secs(30 * 2 + 60 + 20 + 30));
    }

    #[tokio::test]
    async fn started_job_without_pid_is_requeued() {
        let repo = Arc::new(MemoryRepo::default());
        let mut job = job_at("A", "alice", 1, "a.tif");
        job.status = JobStatus::Started;
        repo.put_job(job);
        let (coordinator, _) = coordinator(&repo, FakeOpener::default());

        assert_eq!(coordinator.reconcile().await.unwrap(), 1);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn switched_off_pass_is_fatal_and_dispatches_nothing() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        repo.set_switch_state(SwitchState::Off).await.unwrap();
        let (coordinator, opener) = coordinator(&repo, FakeOpener::default());

        let err = coordinator.run_pass().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(opener.opened().is_empty());
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn pass_prioritises_and_dispatches() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_server(free_server("node1"));
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        repo.put_job(job_at("B", "bob", 2, "b.tif"));
        let (coordinator, _) = coordinator(&repo, FakeOpener::with([launching(31)]));

        let report = coordinator.run_pass().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Started);
        assert_eq!(repo.job("B").unwrap().priority, Some(1));
        assert_eq!(repo.job("B").unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn restart_requeues_paused_jobs() {
        let repo = Arc::new(MemoryRepo::default());
        repo.put_job(job_at("A", "alice", 1, "a.tif"));
        let (coordinator, _) = coordinator(&repo, FakeOpener::default());

        assert!(coordinator.pause_job("A").await.unwrap());
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Paused);
        assert_eq!(coordinator.restart_paused_jobs().await.unwrap(), 1);
        assert_eq!(repo.job("A").unwrap().status, JobStatus::Queued);
    }
}
