use crate::model::entity::Server;

/// A shell bound to one compute host, used to start, probe and kill the engine.
///
/// Commands are fire-and-forget: completion is observed through `is_alive`.
/// `close` releases the shell and its pipes and may be called more than once.
#[async_trait::async_trait]
pub trait ExecutionChannel: Send {
    /// Whether the host answers. Always true for the local host.
    async fn ping(&mut self) -> bool;

    /// Writes a command line to the shell. Returns whether the write succeeded.
    async fn execute(&mut self, command: &str) -> bool;

    /// Makes a local file available under the same path on the host.
    async fn copy_to_host(&mut self, path: &str) -> bool;

    /// Starts the engine on a task template and returns its pid.
    async fn launch_engine(&mut self, template_path: &str) -> anyhow::Result<u32>;

    /// Whether an engine process with this pid exists on the host.
    async fn is_alive(&mut self, pid: u32) -> anyhow::Result<bool>;

    /// Terminates the engine's worker child, then the engine itself.
    async fn kill(&mut self, pid: u32) -> bool;

    async fn close(&mut self);
}

/// Opens channels. Local or secure-remote transport is the opener's business.
#[async_trait::async_trait]
pub trait ExecutionChannelOpener: Send + Sync {
    /// `log_name` names the per-job output and error logs of the shell.
    async fn open(
        &self,
        server: &Server,
        log_name: &str,
    ) -> anyhow::Result<Box<dyn ExecutionChannel>>;
}
