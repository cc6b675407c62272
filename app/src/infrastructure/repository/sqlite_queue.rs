use std::collections::HashMap;

use chrono::{DateTime, Utc};
use domain::{
    model::{
        entity::{Job, JobStatistics, JobStatus, Server, ServerStatus},
        vo::SwitchState,
    },
    repository::{JobRepository, QueueStateRepository, ServerRepository},
};

use crate::infrastructure::database::SqliteDb;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    owner: String,
    grp: String,
    autoseries: bool,
    queued: DateTime<Utc>,
    start: Option<DateTime<Utc>>,
    stop: Option<DateTime<Utc>>,
    server: Option<String>,
    process_id: Option<i64>,
    status: String,
    priority: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct FileRow {
    job_id: String,
    file: String,
}

#[derive(sqlx::FromRow)]
struct ServerRow {
    name: String,
    engine_path: String,
    status: String,
    job: Option<i64>,
    gpu_id: Option<i64>,
    claimed: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct StatisticsRow {
    id: String,
    owner: String,
    grp: String,
    start: Option<DateTime<Utc>>,
    stop: DateTime<Utc>,
    server: Option<String>,
}

const JOB_COLUMNS: &str =
    "id, owner, grp, autoseries, queued, start, stop, server, process_id, status, priority";

const SERVER_COLUMNS: &str = "name, engine_path, status, job, gpu_id, claimed";

impl JobRow {
    fn into_job(self, files: Vec<String>) -> anyhow::Result<Job> {
        Ok(Job {
            id: self.id,
            owner: self.owner,
            group: self.grp,
            files,
            autoseries: self.autoseries,
            queued: self.queued,
            start: self.start,
            stop: self.stop,
            server: self.server,
            pid: self.process_id.map(u32::try_from).transpose()?,
            status: self.status.parse()?,
            priority: self.priority,
        })
    }
}

impl TryFrom<ServerRow> for Server {
    type Error = anyhow::Error;

    fn try_from(row: ServerRow) -> anyhow::Result<Self> {
        Ok(Self {
            name: row.name,
            engine_path: row.engine_path,
            status: row.status.parse()?,
            job: row.job.map(u32::try_from).transpose()?,
            gpu_id: row.gpu_id.map(u32::try_from).transpose()?,
            claimed: row.claimed,
        })
    }
}

impl SqliteDb {
    /// Attaches the input files to job rows, keeping their stored order.
    async fn with_files(&self, rows: Vec<JobRow>) -> anyhow::Result<Vec<Job>> {
        let file_rows: Vec<FileRow> =
            sqlx::query_as("SELECT job_id, file FROM job_files ORDER BY job_id, position")
                .fetch_all(&self.pool)
                .await?;
        let mut files: HashMap<String, Vec<String>> = HashMap::new();
        for row in file_rows {
            files.entry(row.job_id).or_default().push(row.file);
        }
        rows.into_iter()
            .map(|row| {
                let job_files = files.remove(&row.id).unwrap_or_default();
                row.into_job(job_files)
            })
            .collect()
    }

    async fn jobs_where(&self, filter: &str, status: Option<JobStatus>) -> anyhow::Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_queue {filter}");
        let mut query = sqlx::query_as::<_, JobRow>(&sql);
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        self.with_files(rows).await
    }
}

/// Jobs without priority go last; ties fall back to queued time and file.
fn sort_queue(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| {
        (a.priority.unwrap_or(i64::MAX), a.queue_key())
            .cmp(&(b.priority.unwrap_or(i64::MAX), b.queue_key()))
    });
}

#[async_trait::async_trait]
impl JobRepository for SqliteDb {
    async fn insert_job(&self, job: &Job) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO job_queue (id, owner, grp, autoseries, queued, status, priority)
             VALUES (?, ?, ?, ?, ?, 'queued', ?)",
        )
        .bind(&job.id)
        .bind(&job.owner)
        .bind(&job.group)
        .bind(job.autoseries)
        .bind(job.queued)
        .bind(job.priority)
        .execute(&mut *tx)
        .await?;
        for (position, file) in (0_i64..).zip(&job.files) {
            sqlx::query("INSERT INTO job_files (job_id, position, file) VALUES (?, ?, ?)")
                .bind(&job.id)
                .bind(position)
                .bind(file)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = ?");
        let Some(row) = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let files: Vec<String> =
            sqlx::query_scalar("SELECT file FROM job_files WHERE job_id = ? ORDER BY position")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;
        Ok(Some(row.into_job(files)?))
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.jobs_where("WHERE status = ?", Some(status)).await?;
        jobs.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));
        Ok(jobs)
    }

    async fn list_queue(&self) -> anyhow::Result<Vec<Job>> {
        let mut jobs = self.jobs_where("", None).await?;
        sort_queue(&mut jobs);
        Ok(jobs)
    }

    async fn next_queued_job(&self) -> anyhow::Result<Option<Job>> {
        let mut jobs = self.list_jobs_by_status(JobStatus::Queued).await?;
        sort_queue(&mut jobs);
        Ok(jobs.into_iter().next())
    }

    async fn update_job_status(&self, id: &str, status: JobStatus) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE job_queue SET status = ? WHERE id = ?")
            .bind(status.as_ref())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_priority(&self, id: &str, priority: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE job_queue SET priority = ? WHERE id = ?")
            .bind(priority)
            .bind(id)
            .execute(&self.pool)
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
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'started', server = ?, process_id = ?, start = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(server)
        .bind(i64::from(pid))
        .bind(start)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_job(&self, id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = 'queued', server = NULL, process_id = NULL, start = NULL
             WHERE id = ? AND status = 'started'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn pause_job(&self, id: &str) -> anyhow::Result<bool> {
        let result =
            sqlx::query("UPDATE job_queue SET status = 'paused' WHERE id = ? AND status = 'queued'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn restart_paused_jobs(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("UPDATE job_queue SET status = 'queued' WHERE status = 'paused'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn mark_job_removed(&self, id: &str) -> anyhow::Result<Option<JobStatus>> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM job_queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(current) = status else {
            return Ok(None);
        };
        let current: JobStatus = current.parse()?;
        let Some(target) = current.removal_target() else {
            return Ok(None);
        };
        let result = sqlx::query("UPDATE job_queue SET status = ? WHERE id = ? AND status = ?")
            .bind(target.as_ref())
            .bind(id)
            .bind(current.as_ref())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((result.rows_affected() > 0).then_some(target))
    }

    async fn delete_job_everywhere(&self, id: &str) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_files WHERE job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM job_queue WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl ServerRepository for SqliteDb {
    async fn claim_free_server(&self) -> anyhow::Result<Option<Server>> {
        let sql = format!(
            "UPDATE server SET status = 'busy', claimed = ?
             WHERE name = (SELECT name FROM server WHERE status = 'free' ORDER BY name LIMIT 1)
               AND status = 'free'
             RETURNING {SERVER_COLUMNS}"
        );
        let row: Option<ServerRow> = sqlx::query_as(&sql)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Server::try_from).transpose()
    }

    async fn set_server_process(&self, name: &str, pid: u32) -> anyhow::Result<()> {
        sqlx::query("UPDATE server SET job = ? WHERE name = ?")
            .bind(i64::from(pid))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_server(&self, seen: &Server) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE server SET status = ?, job = NULL, claimed = NULL
             WHERE name = ? AND status = 'busy' AND job IS ? AND claimed IS ?",
        )
        .bind(ServerStatus::Free.as_ref())
        .bind(&seen.name)
        .bind(seen.job.map(i64::from))
        .bind(seen.claimed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_server(&self, name: &str) -> anyhow::Result<Option<Server>> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM server WHERE name = ?");
        let row: Option<ServerRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Server::try_from).transpose()
    }

    async fn list_servers(&self) -> anyhow::Result<Vec<Server>> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM server ORDER BY name");
        let rows: Vec<ServerRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(Server::try_from).collect()
    }

    async fn add_server(&self, server: &Server) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO server (name, engine_path, status, job, gpu_id) VALUES (?, ?, ?, NULL, ?)",
        )
        .bind(&server.name)
        .bind(&server.engine_path)
        .bind(server.status.as_ref())
        .bind(server.gpu_id.map(i64::from))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_server(&self, name: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM server WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl QueueStateRepository for SqliteDb {
    async fn get_switch_state(&self) -> anyhow::Result<SwitchState> {
        let switch: Option<String> =
            sqlx::query_scalar("SELECT switch FROM queuemanager WHERE id = 0")
                .fetch_optional(&self.pool)
                .await?;
        Ok(match switch {
            Some(switch) => switch.parse()?,
            None => SwitchState::default(),
        })
    }

    async fn set_switch_state(&self, state: SwitchState) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO queuemanager (id, switch) VALUES (0, ?)
             ON CONFLICT (id) DO UPDATE SET switch = excluded.switch",
        )
        .bind(state.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_job_statistics(&self, statistics: &JobStatistics) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO statistics (id, owner, grp, start, stop, server) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&statistics.id)
        .bind(&statistics.owner)
        .bind(&statistics.group)
        .bind(statistics.start)
        .bind(statistics.stop)
        .bind(&statistics.server)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_statistics(&self) -> anyhow::Result<Vec<JobStatistics>> {
        let rows: Vec<StatisticsRow> =
            sqlx::query_as("SELECT id, owner, grp, start, stop, server FROM statistics ORDER BY stop")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|row| JobStatistics {
                id: row.id,
                owner: row.owner,
                group: row.grp,
                start: row.start,
                stop: row.stop,
                server: row.server,
            })
            .collect())
    }
}
