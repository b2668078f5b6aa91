//! Cluster warm-up: pre-pull the base image and every known app image onto
//! all worker nodes so first launches skip the registry round trip.

use std::sync::Arc;

use binder_cluster::ClusterController;
use binder_common::config::BASE_IMAGE;
use tracing::{info, warn};

use crate::persistence::AppRegistry;

/// Preload failures are logged and skipped; a node that misses an image
/// just pulls it lazily on first launch.
pub async fn preload_all_apps(
    registry: &Arc<dyn AppRegistry>,
    cluster: &Arc<dyn ClusterController>,
) -> crate::persistence::Result<()> {
    if let Err(err) = cluster.preload_image(BASE_IMAGE).await {
        warn!(%err, "could not preload the base image");
    }

    for record in registry.find_all().await? {
        info!(app = record.name(), "preloading app image");
        if let Err(err) = cluster.preload_image(record.name()).await {
            warn!(app = record.name(), %err, "could not preload app image");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use binder_cluster::{Result, RunningApp};
    use binder_common::app::AppSpec;
    use binder_common::storage::StateDir;

    use super::*;
    use crate::persistence::FileRegistry;

    #[derive(Default)]
    struct RecordingCluster {
        pulls: Mutex<Vec<String>>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ClusterController for RecordingCluster {
        async fn deploy_app(&self, _: &str, _: &Path) -> Result<String> {
            unimplemented!()
        }

        async fn stop_app(&self, _: &str) -> Result<()> {
            unimplemented!()
        }

        async fn stop_inactive_apps(&self, _: chrono::Duration) -> Result<()> {
            unimplemented!()
        }

        async fn list_running(&self) -> Result<Vec<RunningApp>> {
            unimplemented!()
        }

        async fn get_total_capacity(&self) -> Result<u64> {
            unimplemented!()
        }

        async fn preload_image(&self, image: &str) -> Result<()> {
            self.pulls.lock().unwrap().push(image.to_string());
            if image == BASE_IMAGE {
                self.failures.fetch_add(1, Ordering::SeqCst);
                return Err(binder_cluster::Error::Command("node offline".to_string()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn preloads_base_and_every_app_despite_failures() {
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<dyn AppRegistry> = Arc::new(
            FileRegistry::new(StateDir::new(dir.path()), None)
                .await
                .unwrap(),
        );
        for name in ["acme-demo", "acme-other"] {
            registry
                .create(AppSpec::new(name, format!("https://github.com/acme/{name}")))
                .await
                .unwrap();
        }

        let cluster = Arc::new(RecordingCluster::default());
        preload_all_apps(&registry, &(Arc::clone(&cluster) as Arc<dyn ClusterController>))
            .await
            .unwrap();

        assert_eq!(
            *cluster.pulls.lock().unwrap(),
            vec![BASE_IMAGE, "acme-demo", "acme-other"]
        );
        assert_eq!(cluster.failures.load(Ordering::SeqCst), 1);
    }
}
