use std::ops::{Deref, DerefMut};
use std::path::Path;

use tokio::process::Command;

use super::ssh_proxy::Transport;

impl Transport {
    /// `None` for the local host, where nothing needs copying.
    pub fn scp(&self) -> Option<ScpCommand<'_>> {
        let Self::Ssh { port, username_host } = self else {
            return None;
        };
        let mut base = Command::new("scp");
        base.args(["-q", "-P", port]);
        Some(ScpCommand { username_host, base })
    }
}

pub struct ScpCommand<'a> {
    username_host: &'a str,
    base: Command,
}

impl Deref for ScpCommand<'_> {
    type Target = Command;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.base
    }
}

impl DerefMut for ScpCommand<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.base
    }
}

impl ScpCommand<'_> {
    #[inline]
    pub fn local_path(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.base.arg(p.as_ref());
        self
    }

    pub fn remote_path(&mut self, p: impl AsRef<Path>) -> &mut Self {
        self.base.arg(format!("{}:{}", self.username_host, p.as_ref().to_string_lossy()));
        self
    }
}
