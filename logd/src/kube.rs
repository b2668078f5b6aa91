//! The `kube_proxy` module: keeps a local proxy to the orchestrator API
//! alive for the lifetime of the daemon and reports on it over the broker.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::warn;

use crate::module::DaemonModule;
use crate::protocol::{ModuleResponse, KUBE_PROXY};

pub struct KubeProxy {
    port: u16,
    proxy: Option<Child>,
}

impl KubeProxy {
    /// Spawn `kubectl proxy` on the given port. A spawn failure is reported
    /// over the broker rather than failing the daemon.
    pub fn start(port: u16) -> Self {
        let proxy = Command::new("kubectl")
            .arg("proxy")
            .arg(format!("--port={port}"))
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| warn!(%err, "could not start the orchestrator API proxy"))
            .ok();

        Self { port, proxy }
    }

    fn status(&mut self) -> ModuleResponse {
        let Some(proxy) = self.proxy.as_mut() else {
            return ModuleResponse::error("orchestrator API proxy did not start");
        };

        match proxy.try_wait() {
            Ok(None) => ModuleResponse::success(format!("proxying on port {}", self.port)),
            Ok(Some(status)) => {
                ModuleResponse::error(format!("orchestrator API proxy exited: {status}"))
            }
            Err(err) => ModuleResponse::error(format!("could not poll proxy process: {err}")),
        }
    }
}

#[async_trait]
impl DaemonModule for KubeProxy {
    fn tag(&self) -> &'static str {
        KUBE_PROXY
    }

    async fn handle(&mut self, body: Value) -> ModuleResponse {
        match body.get("type").and_then(Value::as_str) {
            Some("status") => self.status(),
            other => ModuleResponse::error(format!("unsupported kube_proxy request: {other:?}")),
        }
    }
}
