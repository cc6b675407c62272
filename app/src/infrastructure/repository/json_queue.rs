use chrono::{DateTime, Utc};
use domain::{
    model::{
        entity::{Job, JobStatistics, JobStatus, Server, ServerStatus},
        vo::SwitchState,
    },
    repository::{JobRepository, QueueStateRepository, ServerRepository},
};

use crate::infrastructure::database::{JsonDb, QueueData};

fn sort_queue(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        (a.priority.unwrap_or(i64::MAX), a.queue_key())
            .cmp(&(b.priority.unwrap_or(i64::MAX), b.queue_key()))
    });
}

impl JsonDb {
    /// Runs `f` on a copy of the data. The copy replaces the data only after
    /// it was saved, so a failed write leaves memory as it is on disk.
    async fn transact<R>(
        &self,
        f: impl FnOnce(&mut QueueData) -> anyhow::Result<(R, bool)>,
    ) -> anyhow::Result<R> {
        let mut data = self.data.lock().await;
        let mut draft = data.clone();
        let (result, changed) = f(&mut draft)?;
        if changed {
            self.save_changed(&draft).await?;
            *data = draft;
        }
        Ok(result)
    }

    /// Applies `f` to one job and saves when it reports a change.
    async fn update_job(&self, id: &str, f: impl FnOnce(&mut Job) -> bool) -> anyhow::Result<bool> {
        self.transact(|data| {
            let changed = data.jobs.iter_mut().find(|x| x.id == id).map_or(false, f);
            Ok((changed, changed))
        })
        .await
    }
}

#[async_trait::async_trait]
impl JobRepository for JsonDb {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        self.transact(|data| {
            if data.jobs.iter().any(|x| x.id == job.id) {
                anyhow::bail!("Job {} already exists", job.id);
            }
            data.jobs.push(Job {
                status: JobStatus::Queued,
                ..job.clone()
            });
            Ok(((), true))
        })
        .await
    }

    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        Ok(self.data.lock().await.jobs.iter().find(|x| x.id == id).cloned())
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> anyhow::Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .data
            .lock()
            .await
            .jobs
            .iter()
            .filter(|x| x.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));
        Ok(jobs)
    }

    async fn list_queue(&self) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.data.lock().await.jobs.clone();
        sort_queue(&mut jobs);
        Ok(jobs)
    }

    async fn next_queued_job(&self) -> anyhow::Result<Option<Job>> {
        let mut jobs = self.list_jobs_by_status(JobStatus::Queued).await?;
        sort_queue(&mut jobs);
        Ok(jobs.into_iter().next())
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> anyhow::Result<bool> {
        self.update_job(id, |job| {
            job.status = status;
            true
        })
        .await
    }

    async fn update_priority(&self, id: &str, priority: i64) -> anyhow::Result<()> {
        self.update_job(id, |job| {
            let changed = job.priority != Some(priority);
            job.priority = Some(priority);
            changed
        })
        .await?;
        Ok(())
    }

    async fn start_job(
        &self,
        id: &str,
        server: &str,
        pid: u32,
        start: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        self.update_job(id, |job| {
            if job.status != JobStatus::Queued {
                return false;
            }
            job.status = JobStatus::Started;
            job.server = Some(server.to_owned());
            job.pid = Some(pid);
            job.start = Some(start);
            true
        })
        .await
    }

    async fn requeue_job(&self, id: &str) -> anyhow::Result<bool> {
        self.update_job(id, |job| {
            if job.status != JobStatus::Started {
                return false;
            }
            job.status = JobStatus::Queued;
            job.server = None;
            job.pid = None;
            job.start = None;
            true
        })
        .await
    }

    async fn pause_job(&self, id: &str) -> anyhow::Result<bool> {
        self.update_job(id, |job| {
            let queued = job.status == JobStatus::Queued;
            if queued {
                job.status = JobStatus::Paused;
            }
            queued
        })
        .await
    }

    async fn restart_paused_jobs(&self) -> anyhow::Result<u64> {
        self.transact(|data| {
            let mut restarted = 0;
            for job in data.jobs.iter_mut().filter(|x| x.status == JobStatus::Paused) {
                job.status = JobStatus::Queued;
                restarted += 1;
            }
            Ok((restarted, restarted > 0))
        })
        .await
    }

    async fn mark_job_removed(&self, id: &str) -> anyhow::Result<Option<JobStatus>> {
        let mut target = None;
        self.update_job(id, |job| {
            target = job.status.removal_target();
            if let Some(status) = target {
                job.status = status;
            }
            target.is_some()
        })
        .await?;
        Ok(target)
    }

    async fn delete_job_everywhere(&self, id: &str) -> anyhow::Result<bool> {
        self.transact(|data| {
            let before = data.jobs.len();
            data.jobs.retain(|x| x.id != id);
            let deleted = data.jobs.len() != before;
            Ok((deleted, deleted))
        })
        .await
    }
}

#[async_trait::async_trait]
impl ServerRepository for JsonDb {
    async fn claim_free_server(&self) -> anyhow::Result<Option<Server>> {
        self.transact(|data| {
            let Some(server) = data
                .servers
                .iter_mut()
                .filter(|x| x.status == ServerStatus::Free)
                .min_by(|a, b| a.name.cmp(&b.name))
            else {
                return Ok((None, false));
            };
            server.status = ServerStatus::Busy;
            server.claimed = Some(Utc::now());
            Ok((Some(server.clone()), true))
        })
        .await
    }

    async fn set_server_process(&self, name: &str, pid: u32) -> anyhow::Result<()> {
        self.transact(|data| {
            let server = data.servers.iter_mut().find(|x| x.name == name);
            let changed = server.is_some();
            if let Some(server) = server {
                server.job = Some(pid);
            }
            Ok(((), changed))
        })
        .await
    }

    async fn release_server(&self, seen: &Server) -> anyhow::Result<bool> {
        self.transact(|data| {
            let Some(server) = data.servers.iter_mut().find(|x| {
                x.name == seen.name
                    && x.status == ServerStatus::Busy
                    && x.job == seen.job
                    && x.claimed == seen.claimed
            }) else {
                return Ok((false, false));
            };
            server.status = ServerStatus::Free;
            server.job = None;
            server.claimed = None;
            Ok((true, true))
        })
        .await
    }

    async fn get_server(&self, name: &str) -> anyhow::Result<Option<Server>> {
        Ok(self.data.lock().await.servers.iter().find(|x| x.name == name).cloned())
    }

    async fn list_servers(&self) -> anyhow::Result<Vec<Server>> {
        let mut servers = self.data.lock().await.servers.clone();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn add_server(&self, server: &Server) -> anyhow::Result<()> {
        self.transact(|data| {
            if data.servers.iter().any(|x| x.name == server.name) {
                anyhow::bail!("Server {} already exists", server.name);
            }
            data.servers.push(server.clone());
            Ok(((), true))
        })
        .await
    }

    async fn remove_server(&self, name: &str) -> anyhow::Result<bool> {
        self.transact(|data| {
            let before = data.servers.len();
            data.servers.retain(|x| x.name != name);
            let removed = data.servers.len() != before;
            Ok((removed, removed))
        })
        .await
    }
}

#[async_trait::async_trait]
impl QueueStateRepository for JsonDb {
    async fn get_switch_state(&self) -> anyhow::Result<SwitchState> {
        Ok(self.data.lock().await.switch)
    }

    async fn set_switch_state(&self, state: SwitchState) -> anyhow::Result<()> {
        self.transact(|data| {
            data.switch = state;
            Ok(((), true))
        })
        .await
    }

    async fn record_job_statistics(&self, statistics: &JobStatistics) -> anyhow::Result<()> {
        self.transact(|data| {
            data.statistics.push(statistics.clone());
            Ok(((), true))
        })
        .await
    }

    async fn list_statistics(&self) -> anyhow::Result<Vec<JobStatistics>> {
        Ok(self.data.lock().await.statistics.clone())
    }
}
