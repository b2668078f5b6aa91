//! Periodic idle-app reaper. Installed by the supervisor at startup and
//! cancelled on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ClusterController;

/// Run [`ClusterController::stop_inactive_apps`] on every tick until the
/// token is cancelled. The first tick fires after one full period.
pub fn install(
    controller: Arc<dyn ClusterController>,
    period: Duration,
    inactive_threshold: chrono::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; skip the startup tick
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("idle-app reaper stopped");
                    break;
                }
                _ = ticks.tick() => {
                    debug!("reaping idle apps");
                    if let Err(err) = controller.stop_inactive_apps(inactive_threshold).await {
                        warn!(%err, "idle-app reap failed");
                    }
                }
            }
        }
    })
}
