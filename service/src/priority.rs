use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Context;
use domain::{
    model::entity::{Job, JobStatus},
    repository::QueueRepository,
    service::PriorityService,
};

/// Assigns queue priorities from the current store content.
///
/// Nothing is carried between passes, so a failed pass is repaired by the
/// next one.
pub struct PriorityScheduler {
    repo: Arc<dyn QueueRepository>,
}

impl PriorityScheduler {
    pub fn new(repo: Arc<dyn QueueRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait::async_trait]
impl PriorityService for PriorityScheduler {
    async fn recompute_priorities(&self) -> anyhow::Result<()> {
        let jobs = self.repo.list_queue().await.context("Cannot read the job queue")?;
        let order = priority_order(&jobs);
        tracing::debug!("Assigning priorities to {} jobs", order.len());

        for (priority, job) in (0_i64..).zip(order) {
            if let Err(e) = self.repo.update_priority(&job.id, priority).await {
                tracing::error!(job_id = %job.id, "Could not update priority: {e:#}");
                return Err(e.context(format!("Priority pass aborted at job {}", job.id)));
            }
        }
        Ok(())
    }
}

/// Service order of all non-terminal jobs; the position is the priority.
///
/// Held jobs (broken, paused) come first, then running ones. Queued jobs are
/// interleaved round-robin across owners so nobody monopolises the head of
/// the queue; an owner without remaining jobs is skipped.
pub fn priority_order(jobs: &[Job]) -> Vec<&Job> {
    let stable = |a: &&Job, b: &&Job| (a.queued, &a.id).cmp(&(b.queued, &b.id));

    let mut held: Vec<&Job> = jobs
        .iter()
        .filter(|job| matches!(job.status, JobStatus::Broken | JobStatus::Paused))
        .collect();
    held.sort_by(stable);

    let mut running: Vec<&Job> =
        jobs.iter().filter(|job| job.status == JobStatus::Started).collect();
    running.sort_by(stable);

    let mut queued: Vec<&Job> = jobs.iter().filter(|job| job.status == JobStatus::Queued).collect();
    queued.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));

    // Owners are visited in the order of their oldest job.
    let mut owner_index: HashMap<&str, usize> = HashMap::new();
    let mut per_owner: Vec<VecDeque<&Job>> = Vec::new();
    for job in queued {
        let index = *owner_index.entry(job.owner.as_str()).or_insert_with(|| {
            per_owner.push(VecDeque::new());
            per_owner.len() - 1
        });
        per_owner[index].push_back(job);
    }

    let mut order = held;
    order.append(&mut running);
    while per_owner.iter().any(|jobs| !jobs.is_empty()) {
        for jobs in per_owner.iter_mut() {
            if let Some(job) = jobs.pop_front() {
                order.push(job);
            }
        }
    }
    order
}
