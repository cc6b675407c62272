use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use domain::{
    model::{entity::Server, vo::QueueError},
    service::{ExecutionChannel, ExecutionChannelOpener},
};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;

use super::command::Transport;
use crate::config::{QueueManagerConfig, SshProxyConfig};

const SHELL_EXIT_GRACE: Duration = Duration::from_secs(2);

/// What every channel needs besides its host.
struct ChannelSettings {
    process_name: String,
    task_args: String,
    ping_command: String,
    ping_parameter: String,
    pid_timeout: Duration,
    pid_poll: Duration,
    pid_line: Regex,
}

/// Opens [`ShellChannel`]s, local or through ssh depending on the host.
pub struct ShellChannelOpener {
    log_dir: PathBuf,
    local_host: String,
    ssh: SshProxyConfig,
    settings: Arc<ChannelSettings>,
}

impl ShellChannelOpener {
    pub fn new(config: &QueueManagerConfig) -> anyhow::Result<Self> {
        let settings = ChannelSettings {
            process_name: config.engine.process_name.clone(),
            task_args: config.engine.task_args.clone(),
            ping_command: config.ssh_proxy.ping_command.clone(),
            ping_parameter: config.ssh_proxy.ping_parameter.clone(),
            pid_timeout: Duration::from_secs(config.timeouts.pid),
            pid_poll: Duration::from_millis(250),
            pid_line: Regex::new(r"(?m)^\s*([1-9][0-9]*)\s*$")?,
        };
        Ok(Self {
            log_dir: config.log_dir.clone(),
            local_host: config.local_host.clone(),
            ssh: config.ssh_proxy.clone(),
            settings: Arc::new(settings),
        })
    }
}

#[async_trait::async_trait]
impl ExecutionChannelOpener for ShellChannelOpener {
    async fn open(
        &self,
        server: &Server,
        log_name: &str,
    ) -> anyhow::Result<Box<dyn ExecutionChannel>> {
        let host = server.host();
        let transport = Transport::new(&host, &self.local_host, &self.ssh);
        let out_log = self.log_dir.join(format!("{log_name}_out.log"));
        let error_log = self.log_dir.join(format!("{log_name}_error.log"));

        let shell = spawn_shell(&transport, &out_log, &error_log).await.map_err(|e| {
            QueueError::Connectivity {
                host: host.clone(),
                reason: format!("cannot start shell: {e:#}"),
            }
        })?;
        let mut channel = ShellChannel {
            stdin: None,
            shell: Some(shell),
            transport,
            host,
            engine_path: server.engine_path.clone(),
            out_log,
            settings: self.settings.clone(),
        };
        channel.stdin = channel.shell.as_mut().and_then(|shell| shell.stdin.take());

        if !channel.ping().await {
            channel.close().await;
            return Err(QueueError::Connectivity {
                host: channel.host.clone(),
                reason: "host does not answer".to_owned(),
            }
            .into());
        }
        tracing::debug!(host = %channel.host, "Channel opened");
        Ok(Box::new(channel))
    }
}

/// A long-lived shell on one host with its output appended to log files.
///
/// Background commands print their pid into the output log, which is how
/// [`ExecutionChannel::launch_engine`] learns it.
pub struct ShellChannel {
    transport: Transport,
    host: String,
    engine_path: String,
    out_log: PathBuf,
    shell: Option<Child>,
    stdin: Option<ChildStdin>,
    settings: Arc<ChannelSettings>,
}

impl ShellChannel {
    async fn log_len(&self) -> u64 {
        tokio::fs::metadata(&self.out_log).await.map(|m| m.len()).unwrap_or(0)
    }

    /// First pid printed into the output log after `offset`.
    async fn pid_after(&self, offset: u64) -> anyhow::Result<Option<u32>> {
        let content = tokio::fs::read(&self.out_log).await?;
        let offset = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
        let text = String::from_utf8_lossy(&content[offset..]);
        Ok(first_pid(&self.settings.pid_line, &text))
    }

    async fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<std::process::Output> {
        let output = self
            .transport
            .command(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Cannot run `{program}` for {}", self.host))?;
        // ssh reserves 255 for its own failures.
        if self.transport.is_ssh() && output.status.code() == Some(255) {
            return Err(QueueError::Connectivity {
                host: self.host.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .into());
        }
        Ok(output)
    }

    async fn signal(&self, pid: u32) -> bool {
        match self.run("kill", &["-15", &pid.to_string()]).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::warn!(host = %self.host, "Cannot signal {pid}: {e:#}");
                false
            }
        }
    }
}

async fn spawn_shell(transport: &Transport, out_log: &Path, error_log: &Path) -> anyhow::Result<Child> {
    if let Some(dir) = out_log.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Cannot create log directory {}", dir.display()))?;
    }
    Command::new(transport.shell())
        .stdin(Stdio::piped())
        .stdout(append(out_log)?)
        .stderr(append(error_log)?)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Cannot spawn `{}`", transport.shell()))
}

#[async_trait::async_trait]
impl ExecutionChannel for ShellChannel {
    async fn ping(&mut self) -> bool {
        if !self.transport.is_ssh() {
            return true;
        }
        let program = &self.settings.ping_command;
        match Command::new(program)
            .args(self.settings.ping_parameter.split_whitespace())
            .arg(&self.host)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::warn!(host = %self.host, "Cannot run `{program}`: {e}");
                false
            }
        }
    }

    async fn execute(&mut self, command: &str) -> bool {
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };
        let line = format!("{}\n", self.transport.background(command));
        tracing::debug!(host = %self.host, "{}", line.trim_end());
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(host = %self.host, "Cannot write to shell: {e}");
                false
            }
        }
    }

    async fn copy_to_host(&mut self, path: &str) -> bool {
        let Some(mut scp) = self.transport.scp() else {
            return true;
        };
        scp.local_path(path).remote_path(path);
        match scp.stdin(Stdio::null()).status().await {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::warn!(host = %self.host, "scp of {path} failed: {e}");
                false
            }
        }
    }

    async fn launch_engine(&mut self, template_path: &str) -> anyhow::Result<u32> {
        let offset = self.log_len().await;
        let command = format!(
            "{} {} \"{template_path}\"",
            self.engine_path, self.settings.task_args
        );
        if !self.execute(&command).await {
            return Err(QueueError::Connectivity {
                host: self.host.clone(),
                reason: "shell is gone".to_owned(),
            }
            .into());
        }

        let deadline = Instant::now() + self.settings.pid_timeout;
        loop {
            if let Some(pid) = self.pid_after(offset).await? {
                tracing::debug!(host = %self.host, pid, "Engine launched");
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                return Err(QueueError::PidNotFound {
                    host: self.host.clone(),
                    waited: self.settings.pid_timeout,
                }
                .into());
            }
            tokio::time::sleep(self.settings.pid_poll).await;
        }
    }

    async fn is_alive(&mut self, pid: u32) -> anyhow::Result<bool> {
        let output = self.run("ps", &["-p", &pid.to_string(), "-o", "comm="]).await?;
        let comm = String::from_utf8_lossy(&output.stdout);
        Ok(comm.lines().any(|line| line.contains(&self.settings.process_name)))
    }

    async fn kill(&mut self, pid: u32) -> bool {
        let children: Vec<u32> = match self.run("pgrep", &["-P", &pid.to_string()]).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| line.trim().parse::<u32>().ok())
                .collect(),
            Err(e) => {
                tracing::warn!(host = %self.host, "Cannot list children of {pid}: {e:#}");
                Vec::new()
            }
        };

        let mut killed = true;
        for child in children {
            killed &= self.signal(child).await;
        }
        killed & self.signal(pid).await
    }

    async fn close(&mut self) {
        drop(self.stdin.take());
        let Some(mut shell) = self.shell.take() else {
            return;
        };
        if tokio::time::timeout(SHELL_EXIT_GRACE, shell.wait()).await.is_err() {
            tracing::debug!(host = %self.host, "Shell did not exit, killing it");
            if let Err(e) = shell.kill().await {
                tracing::warn!(host = %self.host, "Cannot kill shell: {e}");
            }
        }
    }
}

fn append(path: &Path) -> anyhow::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open log {}", path.display()))
}

fn first_pid(pid_line: &Regex, text: &str) -> Option<u32> {
    pid_line
        .captures_iter(text)
        .find_map(|captures| captures.get(1)?.as_str().parse().ok())
}
