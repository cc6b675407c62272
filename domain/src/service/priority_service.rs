#[async_trait::async_trait]
pub trait PriorityService: Send + Sync {
    /// Recomputes and stores the priority of every non-terminal job.
    async fn recompute_priorities(&self) -> anyhow::Result<()>;
}
