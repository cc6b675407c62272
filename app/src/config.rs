use std::path::PathBuf;
use std::time::Duration;

use serde::*;

#[derive(Debug, Clone, Deserialize)]
pub struct QueueManagerConfig {
    #[serde(default = "Default::default")]
    pub store: StoreConfig,

    /// Per-job shell logs are written here.
    #[serde(default = "QueueManagerConfig::default_log_dir")]
    pub log_dir: PathBuf,

    /// Task templates, one `<job id>.hgsb` per job.
    #[serde(default = "QueueManagerConfig::default_template_dir")]
    pub template_dir: PathBuf,

    #[serde(default = "Default::default")]
    pub engine: EngineConfig,

    /// Host the queue manager runs on. Servers with this name get a local shell.
    #[serde(default = "QueueManagerConfig::default_local_host")]
    pub local_host: String,

    #[serde(default = "Default::default")]
    pub ssh_proxy: SshProxyConfig,

    #[serde(default = "QueueManagerConfig::default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default = "Default::default")]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `sqlite` or `json`.
    #[serde(default = "StoreConfig::default_type")]
    pub r#type: String,

    #[serde(default = "StoreConfig::default_url")]
    pub url: String,

    /// Directory of the json store.
    #[serde(default = "StoreConfig::default_save_dir")]
    pub save_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Name the engine shows up with in `ps`.
    #[serde(default = "EngineConfig::default_process_name")]
    pub process_name: String,

    /// Arguments put between the executable and the template path.
    #[serde(default = "EngineConfig::default_task_args")]
    pub task_args: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshProxyConfig {
    #[serde(default = "SshProxyConfig::default_username")]
    pub username: String,

    #[serde(default = "SshProxyConfig::default_port")]
    pub port: u16,

    #[serde(default = "SshProxyConfig::default_ping_command")]
    pub ping_command: String,

    #[serde(default = "SshProxyConfig::default_ping_parameter")]
    pub ping_parameter: String,
}

/// All values in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "TimeoutConfig::default_open")]
    pub open: u64,

    /// How long the output log is polled for the engine pid.
    #[serde(default = "TimeoutConfig::default_pid")]
    pub pid: u64,

    #[serde(default = "TimeoutConfig::default_launch")]
    pub launch: u64,

    #[serde(default = "TimeoutConfig::default_probe")]
    pub probe: u64,

    #[serde(default = "TimeoutConfig::default_kill")]
    pub kill: u64,
}

impl QueueManagerConfig {
    pub fn default_log_dir() -> PathBuf {
        PathBuf::from("log")
    }

    pub fn default_template_dir() -> PathBuf {
        PathBuf::from("templates")
    }

    pub fn default_local_host() -> String {
        "localhost".to_owned()
    }

    pub fn default_poll_interval() -> u64 {
        5
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval.max(1))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            r#type: Self::default_type(),
            url: Self::default_url(),
            save_dir: Self::default_save_dir(),
        }
    }
}

impl StoreConfig {
    pub fn default_type() -> String {
        "sqlite".to_owned()
    }

    pub fn default_url() -> String {
        "sqlite://hrmd.db?mode=rwc".to_owned()
    }

    pub fn default_save_dir() -> String {
        ".".to_owned()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_name: Self::default_process_name(),
            task_args: Self::default_task_args(),
        }
    }
}

impl EngineConfig {
    pub fn default_process_name() -> String {
        "hucore".to_owned()
    }

    pub fn default_task_args() -> String {
        "-noExecLog -checkUpdates disable -template".to_owned()
    }
}

impl Default for SshProxyConfig {
    fn default() -> Self {
        Self {
            username: Self::default_username(),
            port: Self::default_port(),
            ping_command: Self::default_ping_command(),
            ping_parameter: Self::default_ping_parameter(),
        }
    }
}

impl SshProxyConfig {
    pub fn default_username() -> String {
        "hrm".to_owned()
    }

    pub fn default_port() -> u16 {
        22
    }

    pub fn default_ping_command() -> String {
        "ping".to_owned()
    }

    pub fn default_ping_parameter() -> String {
        "-c 1 -W 2".to_owned()
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            open: Self::default_open(),
            pid: Self::default_pid(),
            launch: Self::default_launch(),
            probe: Self::default_probe(),
            kill: Self::default_kill(),
        }
    }
}

impl TimeoutConfig {
    pub fn default_open() -> u64 {
        30
    }

    pub fn default_pid() -> u64 {
        30
    }

    pub fn default_launch() -> u64 {
        60
    }

    pub fn default_probe() -> u64 {
        20
    }

    pub fn default_kill() -> u64 {
        20
    }
}

/// Reads the optional config file and overlays `HRMD__*` variables.
pub fn build_config(path: &str) -> anyhow::Result<QueueManagerConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("HRMD").separator("__"))
        .build()?;
    Ok(config.try_deserialize()?)
}
