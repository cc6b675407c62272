mod container;

use std::sync::Arc;
use std::time::Duration;

use domain::repository::QueueRepository;
use service::prelude::*;

use crate::{
    config::QueueManagerConfig,
    infrastructure::{
        channel::ShellChannelOpener,
        database::{JsonDb, SqliteDb},
    },
};

pub use self::container::Container;

impl Container {
    /// Opens the configured store and wires the services on top of it.
    pub async fn new(config: &QueueManagerConfig) -> anyhow::Result<Self> {
        let repo: Arc<dyn QueueRepository> = match config.store.r#type.to_lowercase().as_str() {
            "sqlite" => Arc::new(SqliteDb::connect(&config.store.url).await?),
            "json" => Arc::new(JsonDb::new(&config.store.save_dir).await?),
            t => {
                anyhow::bail!("Unsupported `store.type`: {t}");
            }
        };
        Self::with_store(config, repo)
    }

    pub fn with_store(
        config: &QueueManagerConfig,
        repo: Arc<dyn QueueRepository>,
    ) -> anyhow::Result<Self> {
        let timeouts = &config.timeouts;
        let coordinator_config = CoordinatorConfig::builder()
            .template_dir(config.template_dir.clone())
            .open_timeout(Duration::from_secs(timeouts.open))
            .launch_timeout(Duration::from_secs(timeouts.launch.max(timeouts.pid)))
            .probe_timeout(Duration::from_secs(timeouts.probe))
            .kill_timeout(Duration::from_secs(timeouts.kill))
            .build();
        let coordinator = Arc::new(QueueCoordinator::new(
            repo.clone(),
            Arc::new(ShellChannelOpener::new(config)?),
            Arc::new(PriorityScheduler::new(repo.clone())),
            coordinator_config,
        ));

        let container = Container::builder()
            .repo(repo)
            .coordinator(coordinator)
            .build();
        Ok(container)
    }
}
