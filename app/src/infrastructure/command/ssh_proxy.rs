use tokio::process::Command;

use crate::config::SshProxyConfig;

/// Where the commands of a channel run. Transparent for the local host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Local,
    Ssh { port: String, username_host: String },
}

impl Transport {
    /// Local when `host` is the machine the queue manager runs on.
    pub fn new(host: &str, local_host: &str, config: &SshProxyConfig) -> Self {
        if host == local_host || host == "localhost" {
            return Self::Local;
        }
        Self::Ssh {
            port: config.port.to_string(),
            username_host: format!("{}@{host}", config.username),
        }
    }

    /// A one-shot command on the host. Arguments added later are passed
    /// through to the remote side.
    pub fn command(&self, cmd: &str) -> Command {
        let Self::Ssh { port, username_host } = self else {
            return Command::new(cmd);
        };

        let mut command = Command::new("ssh");
        command.args(["-p", port, username_host, cmd]);
        command
    }

    /// Line for the long-lived shell that starts `cmd` in the background and
    /// prints its pid.
    pub fn background(&self, cmd: &str) -> String {
        match self {
            Self::Local => format!("{cmd} & echo $!"),
            Self::Ssh { port, username_host } => {
                format!("ssh -f -p {port} {username_host} '{cmd} & echo $!'")
            }
        }
    }

    /// Program of the long-lived shell.
    pub fn shell(&self) -> &'static str {
        match self {
            Self::Local => "sh",
            Self::Ssh { .. } => "bash",
        }
    }

    pub fn is_ssh(&self) -> bool {
        matches!(self, Self::Ssh { .. })
    }
}
