use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use domain::{
    model::{
        entity::{Job, JobStatistics, JobStatus, Server, ServerStatus},
        vo::SwitchState,
    },
    repository::{JobRepository, QueueStateRepository, ServerRepository},
    service::{ExecutionChannel, ExecutionChannelOpener},
};

mockall::mock! {
    pub Channel {}

    #[async_trait]
    impl ExecutionChannel for Channel {
        async fn ping(&mut self) -> bool;
        async fn execute(&mut self, command: &str) -> bool;
        async fn copy_to_host(&mut self, path: &str) -> bool;
        async fn launch_engine(&mut self, template_path: &str) -> anyhow::Result<u32>;
        async fn is_alive(&mut self, pid: u32) -> anyhow::Result<bool>;
        async fn kill(&mut self, pid: u32) -> bool;
        async fn close(&mut self);
    }
}

impl MockChannel {
    /// A channel that expects to be closed exactly once.
    pub fn closing() -> Self {
        let mut channel = Self::new();
        channel.expect_close().times(1).return_const(());
        channel
    }
}

pub fn job_at(id: &str, owner: &str, t: i64, file: &str) -> Job {
    let queued: DateTime<Utc> = Utc.timestamp_opt(1_700_000_000 + t, 0).unwrap();
    Job::with_id(id, owner, "lab", vec![file.to_owned()], false, queued).unwrap()
}

pub fn free_server(name: &str) -> Server {
    Server::new(name, "/opt/hucore/bin/hucore", None).unwrap()
}

/// Hands out prepared channels in order; fails once they are used up.
#[derive(Default)]
pub struct FakeOpener {
    channels: Mutex<VecDeque<MockChannel>>,
    opened: Mutex<Vec<(String, String)>>,
}

impl FakeOpener {
    pub fn with(channels: impl IntoIterator<Item = MockChannel>) -> Self {
        Self {
            channels: Mutex::new(channels.into_iter().collect()),
            ..Default::default()
        }
    }

    /// `(server name, log name)` of every successful open.
    pub fn opened(&self) -> Vec<(String, String)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionChannelOpener for FakeOpener {
    async fn open(
        &self,
        server: &Server,
        log_name: &str,
    ) -> anyhow::Result<Box<dyn ExecutionChannel>> {
        let channel = self
            .channels
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("{} is unreachable", server.host()))?;
        self.opened.lock().unwrap().push((server.name.clone(), log_name.to_owned()));
        Ok(Box::new(channel))
    }
}

#[derive(Default)]
struct State {
    jobs: Vec<Job>,
    servers: Vec<Server>,
    statistics: Vec<JobStatistics>,
    switch: SwitchState,
    failing_priorities: HashSet<String>,
    fail_start: bool,
}

/// In-memory store with inspection helpers and failure injection.
#[derive(Default)]
pub struct MemoryRepo {
    state: Mutex<State>,
}

impl MemoryRepo {
    pub fn put_job(&self, job: Job) {
        self.state.lock().unwrap().jobs.push(job);
    }

    pub fn put_server(&self, server: Server) {
        self.state.lock().unwrap().servers.push(server);
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.state.lock().unwrap().jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn server(&self, name: &str) -> Option<Server> {
        self.state.lock().unwrap().servers.iter().find(|s| s.name == name).cloned()
    }

    pub fn statistics(&self) -> Vec<JobStatistics> {
        self.state.lock().unwrap().statistics.clone()
    }

    pub fn set_status(&self, id: &str, status: JobStatus) {
        self.with_job(id, |job| job.status = status);
    }

    pub fn remove_job(&self, id: &str) {
        self.state.lock().unwrap().jobs.retain(|j| j.id != id);
    }

    pub fn update_server(&self, name: &str, f: impl FnOnce(&mut Server)) {
        if let Some(server) = self.state.lock().unwrap().servers.iter_mut().find(|s| s.name == name) {
            f(server);
        }
    }

    pub fn fail_priority_update_for(&self, id: &str) {
        self.state.lock().unwrap().failing_priorities.insert(id.to_owned());
    }

    pub fn fail_job_start(&self) {
        self.state.lock().unwrap().fail_start = true;
    }

    fn with_job<R>(&self, id: &str, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.state.lock().unwrap().jobs.iter_mut().find(|j| j.id == id).map(f)
    }
}

#[async_trait]
impl JobRepository for MemoryRepo {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        self.put_job(job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        Ok(self.job(id))
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> anyhow::Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.iter().filter(|j| j.status == status).cloned().collect())
    }

    async fn list_queue(&self) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.state.lock().unwrap().jobs.clone();
        jobs.sort_by(|a, b| {
            (a.priority.unwrap_or(i64::MAX), a.queue_key())
                .cmp(&(b.priority.unwrap_or(i64::MAX), b.queue_key()))
        });
        Ok(jobs)
    }

    async fn next_queued_job(&self) -> anyhow::Result<Option<Job>> {
        let jobs = self.list_queue().await?;
        Ok(jobs.into_iter().find(|j| j.status == JobStatus::Queued))
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> anyhow::Result<bool> {
        Ok(self.with_job(id, |job| job.status = status).is_some())
    }

    async fn update_priority(&self, id: &str, priority: i64) -> anyhow::Result<()> {
        if self.state.lock().unwrap().failing_priorities.contains(id) {
            anyhow::bail!("write failed");
        }
        self.with_job(id, |job| job.priority = Some(priority));
        Ok(())
    }

    async fn start_job(
        &self,
        id: &str,
        server: &str,
        pid: u32,
        start: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        if self.state.lock().unwrap().fail_start {
            anyhow::bail!("connection lost");
        }
        Ok(self
            .with_job(id, |job| {
                if job.status != JobStatus::Queued {
                    return false;
                }
                job.status = JobStatus::Started;
                job.server = Some(server.to_owned());
                job.pid = Some(pid);
                job.start = Some(start);
                true
            })
            .unwrap_or(false))
    }

    async fn requeue_job(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .with_job(id, |job| {
                if job.status != JobStatus::Started {
                    return false;
                }
                job.status = JobStatus::Queued;
                job.server = None;
                job.pid = None;
                job.start = None;
                true
            })
            .unwrap_or(false))
    }

    async fn pause_job(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self
            .with_job(id, |job| {
                let queued = job.status == JobStatus::Queued;
                if queued {
                    job.status = JobStatus::Paused;
                }
                queued
            })
            .unwrap_or(false))
    }

    async fn restart_paused_jobs(&self) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for job in state.jobs.iter_mut().filter(|j| j.status == JobStatus::Paused) {
            job.status = JobStatus::Queued;
            count += 1;
        }
        Ok(count)
    }

    async fn mark_job_removed(&self, id: &str) -> anyhow::Result<Option<JobStatus>> {
        Ok(self
            .with_job(id, |job| {
                let target = job.status.removal_target()?;
                job.status = target;
                Some(target)
            })
            .flatten())
    }

    async fn delete_job_everywhere(&self, id: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.jobs.len();
        state.jobs.retain(|j| j.id != id);
        Ok(state.jobs.len() != before)
    }
}

#[async_trait]
impl ServerRepository for MemoryRepo {
    async fn claim_free_server(&self) -> anyhow::Result<Option<Server>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.servers.iter_mut().find(|s| s.status == ServerStatus::Free).map(|server| {
            server.status = ServerStatus::Busy;
            server.claimed = Some(Utc::now());
            server.clone()
        }))
    }

    async fn set_server_process(&self, name: &str, pid: u32) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(server) = state.servers.iter_mut().find(|s| s.name == name) {
            server.job = Some(pid);
        }
        Ok(())
    }

    async fn release_server(&self, seen: &Server) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.iter_mut().find(|s| {
            s.name == seen.name
                && s.status == ServerStatus::Busy
                && s.job == seen.job
                && s.claimed == seen.claimed
        }) else {
            return Ok(false);
        };
        server.status = ServerStatus::Free;
        server.job = None;
        server.claimed = None;
        Ok(true)
    }

    async fn get_server(&self, name: &str) -> anyhow::Result<Option<Server>> {
        Ok(self.server(name))
    }

    async fn list_servers(&self) -> anyhow::Result<Vec<Server>> {
        Ok(self.state.lock().unwrap().servers.clone())
    }

    async fn add_server(&self, server: &Server) -> anyhow::Result<()> {
        self.put_server(server.clone());
        Ok(())
    }

    async fn remove_server(&self, name: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.servers.len();
        state.servers.retain(|s| s.name != name);
        Ok(state.servers.len() != before)
    }
}

#[async_trait]
impl QueueStateRepository for MemoryRepo {
    async fn get_switch_state(&self) -> anyhow::Result<SwitchState> {
        Ok(self.state.lock().unwrap().switch)
    }

    async fn set_switch_state(&self, state: SwitchState) -> anyhow::Result<()> {
        self.state.lock().unwrap().switch = state;
        Ok(())
    }

    async fn record_job_statistics(&self, statistics: &JobStatistics) -> anyhow::Result<()> {
        self.state.lock().unwrap().statistics.push(statistics.clone());
        Ok(())
    }

    async fn list_statistics(&self) -> anyhow::Result<Vec<JobStatistics>> {
        Ok(self.statistics())
    }
}
