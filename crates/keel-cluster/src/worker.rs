//! Periodic background workers.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::ClusterError;

/// Spawn a task that runs `tick` every `period` until `shutdown` flips.
///
/// The first run happens one full period after spawning. A failed tick is
/// logged and retried on the next wake. The stop signal is observed while
/// sleeping, so the task exits no later than the end of the current tick.
pub(crate) fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ClusterError>> + Send,
{
    tokio::spawn(async move {
        info!(worker = name, period_ms = period.as_millis() as u64, "cluster worker started");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(e) = tick().await {
                        warn!(worker = name, error = %e, "cluster worker tick failed");
                    }
                }
            }
        }

        debug!(worker = name, "cluster worker stopped");
    })
}
