pub mod kube;
pub mod proxy;
pub mod reaper;

use std::path::Path;

use async_trait::async_trait;

pub use kube::KubeController;
pub use proxy::ProxyClient;

/// Namespaces that belong to the platform itself. The reaper and the
/// running-apps listing never touch them.
pub const SYSTEM_NAMESPACES: &[&str] = &["default", "kube-system", "binder"];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("orchestrator command failed: {0}")]
    Command(String),
    #[error("I/O error: {0}")]
    InputOutput(#[from] std::io::Error),
    #[error("could not create resource {0}")]
    ResourceCreate(String),
    #[error("no address assigned to the notebook pod of {0}")]
    NoPodAddress(String),
    #[error("could not register a proxy route for {0}")]
    RouteRegistration(String),
    #[error("proxy API request failed: {0}")]
    Proxy(#[from] reqwest::Error),
    #[error("proxy route {0} was refused: status {1}")]
    RouteRefused(String, u16),
    #[error("proxy info is missing or malformed; has the cluster been started?")]
    ProxyInfo,
    #[error("could not determine the external URL of {0}")]
    NoExternalUrl(String),
    #[error("provider {0} is not supported for this operation")]
    UnsupportedProvider(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An app currently deployed on the cluster.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct RunningApp {
    pub deployment_id: String,
    pub image: String,
}

/// Operations the control plane needs from the cluster, independent of the
/// concrete orchestrator. The implementation is selected at startup.
#[async_trait]
pub trait ClusterController: Send + Sync + 'static {
    /// Deploy the manifests in `deploy_dir` under a fresh namespace and
    /// register the proxy route. Returns the user-facing URL.
    async fn deploy_app(&self, deployment_id: &str, deploy_dir: &Path) -> Result<String>;

    /// Remove the proxy route, then tear down the app's resources.
    async fn stop_app(&self, deployment_id: &str) -> Result<()>;

    /// Stop every app whose route has been inactive for longer than the
    /// threshold.
    async fn stop_inactive_apps(&self, inactive_for: chrono::Duration) -> Result<()>;

    /// Deployed apps, system namespaces excluded.
    async fn list_running(&self) -> Result<Vec<RunningApp>>;

    /// Sum of per-node pod capacity over the worker nodes.
    async fn get_total_capacity(&self) -> Result<u64>;

    /// Pull an image onto every worker node's local store.
    async fn preload_image(&self, image: &str) -> Result<()>;
}
