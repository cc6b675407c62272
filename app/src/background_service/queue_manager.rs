use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use domain::model::vo::QueueError;
use infrastructure::sync::timer;
use service::prelude::*;
use tracing::Instrument;

use crate::infrastructure::ioc::Container;

/// Polls the queue until the switch is turned off.
pub struct QueueManager {
    coordinator: Arc<QueueCoordinator>,
    interval: Duration,
}

impl QueueManager {
    pub fn new(container: &Container, interval: Duration) -> Self {
        Self {
            coordinator: container.coordinator.clone(),
            interval,
        }
    }

    /// Runs until a fatal error, or for `passes` passes when given.
    pub async fn run(&self, passes: Option<u64>) -> Result<(), QueueError> {
        tracing::info!(interval = ?self.interval, "Queue manager started");
        match passes {
            Some(passes) => timer::bounded(self.interval, passes, || self.pass()).await,
            None => Err(timer::new(self.interval, || self.pass()).await),
        }
    }

    async fn pass(&self) -> ControlFlow<QueueError> {
        let result = self
            .coordinator
            .run_pass()
            .instrument(tracing::debug_span!("queue_pass"))
            .await;
        match result {
            Ok(_) => ControlFlow::Continue(()),
            Err(e) if e.is_fatal() => ControlFlow::Break(e),
            Err(e) => {
                tracing::error!("Queue pass failed: {e}");
                ControlFlow::Continue(())
            }
        }
    }
}
