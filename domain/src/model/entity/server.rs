use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::vo::QueueError;

/// A compute node able to run the deconvolution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Unique name. `"<host> <gpu>"` when the entry is bound to an accelerator.
    pub name: String,
    /// Engine executable on that host.
    pub engine_path: String,
    pub status: ServerStatus,
    /// Pid of the engine process, only while busy.
    pub job: Option<u32>,
    pub gpu_id: Option<u32>,
    /// When the current claim was taken, only while busy.
    #[serde(default)]
    pub claimed: Option<DateTime<Utc>>,
}

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Free,
    Busy,
    Paused,
}

impl Server {
    /// Register entry for a host, optionally pinned to a GPU.
    ///
    /// The same machine may be registered once per GPU, the device id is
    /// appended to the name after a blank.
    pub fn new(host: &str, engine_path: &str, gpu_id: Option<&str>) -> Result<Self, QueueError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(QueueError::InvalidServer("empty server name".to_owned()));
        }
        let gpu_id = match gpu_id.map(str::trim).filter(|g| !g.is_empty()) {
            Some(gpu) => Some(
                gpu.parse::<u32>()
                    .map_err(|_| QueueError::InvalidServer(format!("invalid GPU ID `{gpu}`")))?,
            ),
            None => None,
        };
        let name = match gpu_id {
            Some(gpu) => format!("{host} {gpu}"),
            None => host.to_owned(),
        };
        Ok(Self {
            name,
            engine_path: engine_path.to_owned(),
            status: ServerStatus::Free,
            job: None,
            gpu_id,
            claimed: None,
        })
    }

    /// Host part of the name, the one to connect to.
    pub fn host(&self) -> String {
        host_of(&self.name).to_owned()
    }

    /// Whether the claim was taken more than `lease` before `now`. A busy
    /// server without claim time counts as expired.
    pub fn claim_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        self.claimed.map_or(true, |claimed| now - claimed > lease)
    }
}

/// Strips the trailing device token from a server name.
///
/// `"gpu-node 1"` connects to `gpu-node`; a name without a blank is a host.
pub fn host_of(name: &str) -> &str {
    name.rsplit_once(' ').map_or(name, |(host, _)| host)
}
