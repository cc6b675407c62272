use std::path::PathBuf;

use domain::model::{
    entity::{Job, JobStatistics, Server},
    vo::SwitchState,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(in crate::infrastructure) struct QueueData {
    pub jobs: Vec<Job>,
    pub servers: Vec<Server>,
    #[serde(default)]
    pub switch: SwitchState,
    #[serde(default)]
    pub statistics: Vec<JobStatistics>,
}

/// Whole queue kept in memory and written to `queue.json` after each change.
///
/// Only one process may use a save directory at a time.
pub struct JsonDb {
    pub(in crate::infrastructure) data: Mutex<QueueData>,
    path: PathBuf,
}

impl JsonDb {
    pub async fn new(save_dir: &str) -> anyhow::Result<Self> {
        let path = PathBuf::from(save_dir).join("queue.json");
        let data = match path.is_file() {
            true => serde_json::from_slice(&tokio::fs::read(&path).await?)?,
            false => QueueData::default(),
        };
        Ok(Self {
            data: Mutex::new(data),
            path,
        })
    }

    pub(in crate::infrastructure) async fn save_changed(
        &self,
        data: &QueueData,
    ) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
