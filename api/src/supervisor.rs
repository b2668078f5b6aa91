//! Lifecycle of the long-lived pieces: the log daemon child process, the
//! idle-app reaper and the shutdown ladder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use binder_cluster::{reaper, ClusterController};
use binder_logd::protocol::{ModuleResponse, LOG_WRITER};
use binder_logd::stream::broker_request;
use binder_logd::LogClient;
use serde_json::json;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::build::BuildManager;

const READINESS_ATTEMPTS: usize = 50;
const READINESS_PAUSE: Duration = Duration::from_millis(100);

pub struct Supervisor {
    cancel: CancellationToken,
    logd: Option<Child>,
    reaper: Option<JoinHandle<()>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            logd: None,
            reaper: None,
        }
    }

    /// Token observed by WebSocket handlers, the reaper and admission.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the log daemon as a child process and wait briefly for its
    /// modules to register with the broker.
    pub async fn start_log_daemon(
        &mut self,
        command: &str,
        broker: SocketAddr,
        pubsub: SocketAddr,
    ) -> std::io::Result<()> {
        let child = Command::new(command)
            .arg("--broker-address")
            .arg(broker.to_string())
            .arg("--pubsub-address")
            .arg(pubsub.to_string())
            .spawn()?;
        self.logd = Some(child);

        for _ in 0..READINESS_ATTEMPTS {
            sleep(READINESS_PAUSE).await;
            if let Ok(body) = broker_request(broker, LOG_WRITER, json!({"type": "noop"})).await {
                match serde_json::from_value::<ModuleResponse>(body) {
                    Ok(ModuleResponse::Error { msg })
                        if msg.starts_with("no worker registered") =>
                    {
                        continue
                    }
                    _ => {
                        info!("log daemon ready");
                        return Ok(());
                    }
                }
            }
        }

        warn!("log daemon did not confirm readiness, continuing anyway");
        Ok(())
    }

    /// Install the periodic idle-app reaper.
    pub fn install_reaper(
        &mut self,
        controller: Arc<dyn ClusterController>,
        period: Duration,
        inactive_threshold: chrono::Duration,
    ) {
        self.reaper = Some(reaper::install(
            controller,
            period,
            inactive_threshold,
            self.cancel.clone(),
        ));
    }

    /// The shutdown ladder: signal WebSocket handlers and the reaper, stop
    /// admitting builds, wait for in-flight jobs up to the grace period,
    /// flush the log client, then take the daemon down.
    pub async fn shutdown(mut self, builds: &BuildManager, log: &LogClient, grace: Duration) {
        info!("shutting down");
        self.cancel.cancel();

        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.await;
        }

        builds.drain(grace).await;
        log.flush().await;

        if let Some(mut child) = self.logd.take() {
            if let Err(err) = child.kill().await {
                warn!(%err, "could not stop the log daemon");
            }
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing the SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
