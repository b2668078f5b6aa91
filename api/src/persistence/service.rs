//! Services on disk: `{services}/{name}/{version}/` holds the spec
//! (`conf.json`), per-mode deployment templates, component templates, an
//! optional client snippet and the spec of the last successful build.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use binder_common::storage::StateDir;
use binder_common::template::Params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{Error, Result};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceImage {
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceSpec {
    #[serde(default)]
    pub images: Vec<ServiceImage>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// File name of the snippet appended to app images using this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl ServiceSpec {
    pub fn string_params(&self) -> Params {
        self.parameters
            .iter()
            .map(|(key, value)| (key.clone(), stringify(value)))
            .collect()
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct ServiceRecord {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub spec: ServiceSpec,
    pub last_build: Option<ServiceSpec>,
}

impl ServiceRecord {
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// A service is rebuilt only when its spec differs from the one that
    /// produced the last successful build.
    pub fn needs_build(&self) -> bool {
        self.last_build.as_ref() != Some(&self.spec)
    }

    /// Deployment templates by mode (`single-node`, `multi-node`).
    pub async fn deployments(&self) -> Result<HashMap<String, String>> {
        let mut deployments = HashMap::new();
        let mut entries = tokio::fs::read_dir(self.path.join("deployments")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(mode) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
            else {
                continue;
            };
            deployments.insert(mode, tokio::fs::read_to_string(path).await?);
        }

        Ok(deployments)
    }

    /// Component templates by file name.
    pub async fn components(&self) -> Result<HashMap<String, String>> {
        let mut components = HashMap::new();
        let mut entries = tokio::fs::read_dir(self.path.join("components")).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            components.insert(name, tokio::fs::read_to_string(entry.path()).await?);
        }

        Ok(components)
    }

    pub async fn client_snippet(&self) -> Result<Option<String>> {
        match &self.spec.client {
            None => Ok(None),
            Some(file) => Ok(Some(
                tokio::fs::read_to_string(self.path.join(file)).await?,
            )),
        }
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<ServiceRecord>>;

    async fn get(&self, name: &str, version: &str) -> Result<Option<ServiceRecord>>;

    /// Record the spec that just built successfully, enabling the
    /// change-detection skip on the next build.
    async fn save_last_build(&self, service: &ServiceRecord) -> Result<()>;
}

pub struct FileServiceRegistry {
    dirs: StateDir,
}

impl FileServiceRegistry {
    pub fn new(dirs: StateDir) -> Self {
        Self { dirs }
    }
}

#[async_trait]
impl ServiceRegistry for FileServiceRegistry {
    async fn list(&self) -> Result<Vec<ServiceRecord>> {
        let mut services = Vec::new();

        let mut names = match tokio::fs::read_dir(self.dirs.services()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(services),
            Err(err) => return Err(err.into()),
        };

        while let Some(name_entry) = names.next_entry().await? {
            if !name_entry.file_type().await?.is_dir() {
                continue;
            }
            let name = name_entry.file_name().to_string_lossy().into_owned();

            let mut versions = tokio::fs::read_dir(name_entry.path()).await?;
            while let Some(version_entry) = versions.next_entry().await? {
                if !version_entry.file_type().await?.is_dir() {
                    continue;
                }
                let version = version_entry.file_name().to_string_lossy().into_owned();

                match self.get(&name, &version).await {
                    Ok(Some(service)) => services.push(service),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(service = %format!("{name}-{version}"), %err, "skipping unreadable service")
                    }
                }
            }
        }

        services.sort_by_key(ServiceRecord::full_name);
        Ok(services)
    }

    async fn get(&self, name: &str, version: &str) -> Result<Option<ServiceRecord>> {
        let path = self.dirs.service(name, version);
        let full_name = format!("{name}-{version}");

        let spec = match tokio::fs::read_to_string(path.join("conf.json")).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| Error::Corrupt(full_name, err))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let last_build = match tokio::fs::read_to_string(path.join(".last_build.json")).await {
            Ok(raw) => serde_json::from_str(&raw).ok(),
            Err(_) => None,
        };

        Ok(Some(ServiceRecord {
            name: name.to_string(),
            version: version.to_string(),
            path,
            spec,
            last_build,
        }))
    }

    async fn save_last_build(&self, service: &ServiceRecord) -> Result<()> {
        let contents = serde_json::to_string(&service.spec)
            .map_err(|err| Error::Corrupt(service.full_name(), err))?;
        tokio::fs::write(service.path.join(".last_build.json"), contents).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed_service(root: &std::path::Path) -> FileServiceRegistry {
        let dirs = StateDir::new(root);
        let path = dirs.service("spark", "1.4.1");
        tokio::fs::create_dir_all(path.join("deployments"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(path.join("components"))
            .await
            .unwrap();

        tokio::fs::write(
            path.join("conf.json"),
            r#"{
                "images": [{"name": "master"}, {"name": "worker"}],
                "parameters": {"spark-version": "1.4.1", "workers": 2},
                "client": "client.sh"
            }"#,
        )
        .await
        .unwrap();
        tokio::fs::write(
            path.join("deployments/single-node.json"),
            r#"{"components": []}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(path.join("components/master.json"), "{}")
            .await
            .unwrap();
        tokio::fs::write(path.join("client.sh"), "RUN install-spark-client\n")
            .await
            .unwrap();

        FileServiceRegistry::new(dirs)
    }

    #[tokio::test]
    async fn list_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let registry = seed_service(dir.path()).await;

        let services = registry.list().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].full_name(), "spark-1.4.1");

        let service = registry.get("spark", "1.4.1").await.unwrap().unwrap();
        assert_eq!(service.spec.images.len(), 2);
        assert_eq!(
            service.spec.string_params().get("workers").unwrap(),
            "2"
        );
        assert_eq!(
            service.client_snippet().await.unwrap().unwrap(),
            "RUN install-spark-client\n"
        );
        assert!(service
            .deployments()
            .await
            .unwrap()
            .contains_key("single-node"));

        assert!(registry.get("spark", "9.9.9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn change_detection_skips_unchanged_specs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = seed_service(dir.path()).await;

        let service = registry.get("spark", "1.4.1").await.unwrap().unwrap();
        assert!(service.needs_build());

        registry.save_last_build(&service).await.unwrap();
        let service = registry.get("spark", "1.4.1").await.unwrap().unwrap();
        assert!(!service.needs_build());

        // Changing the spec invalidates the last build
        let path = service.path.join("conf.json");
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::write(&path, raw.replace("\"workers\": 2", "\"workers\": 3"))
            .await
            .unwrap();
        let service = registry.get("spark", "1.4.1").await.unwrap().unwrap();
        assert!(service.needs_build());
    }
}
