use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

/// Runs `f` on every tick until it breaks, returning the break value.
///
/// The first tick fires immediately. A pass that overruns the period delays
/// the next tick instead of triggering a burst of catch-up passes.
pub async fn new<T, F, Fut>(interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<T>>,
{
    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        if let ControlFlow::Break(ret) = f().await {
            break ret;
        }
    }
}

/// Like [`new`], but stops with `Ok(())` after `passes` ticks.
pub async fn bounded<E, F, Fut>(interval: Duration, passes: u64, mut f: F) -> Result<(), E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<E>>,
{
    let mut done = 0;
    new(interval, || {
        done += 1;
        let pass = f();
        let last = done >= passes;
        async move {
            match pass.await {
                ControlFlow::Break(e) => ControlFlow::Break(Err(e)),
                ControlFlow::Continue(()) if last => ControlFlow::Break(Ok(())),
                ControlFlow::Continue(()) => ControlFlow::Continue(()),
            }
        }
    })
    .await
}
