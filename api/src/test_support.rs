use std::path::Path;

use async_trait::async_trait;
use binder_cluster::{ClusterController, Result, RunningApp};

/// A cluster that accepts everything and runs nothing.
pub struct NullCluster;

#[async_trait]
impl ClusterController for NullCluster {
    async fn deploy_app(&self, deployment_id: &str, _deploy_dir: &Path) -> Result<String> {
        Ok(format!("https://cluster.example/{deployment_id}"))
    }

    async fn stop_app(&self, _deployment_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop_inactive_apps(&self, _inactive_for: chrono::Duration) -> Result<()> {
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RunningApp>> {
        Ok(Vec::new())
    }

    async fn get_total_capacity(&self) -> Result<u64> {
        Ok(0)
    }

    async fn preload_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }
}
