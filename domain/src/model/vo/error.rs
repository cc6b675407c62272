use std::time::Duration;

/// Failures the queue manager has to tell apart.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store failure: {0:#}")]
    Store(anyhow::Error),

    #[error("cannot reach {host}: {reason}")]
    Connectivity { host: String, reason: String },

    #[error("no engine pid showed up on {host} within {waited:?}")]
    PidNotFound { host: String, waited: Duration },

    #[error("{operation} on {host} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        host: String,
        after: Duration,
    },

    #[error("the queue manager switch is off")]
    SwitchOff,

    #[error("invalid job {id}: {reason}")]
    InvalidJob { id: String, reason: String },

    #[error("invalid server: {0}")]
    InvalidServer(String),

    #[error("no job with id {0}")]
    UnknownJob(String),
}

impl QueueError {
    /// Errors that must stop the polling loop instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SwitchOff)
    }
}
