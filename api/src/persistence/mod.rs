//! App records on disk. The state directory is the source of truth: every
//! write goes to a temporary sibling file first and is renamed over the
//! target, and writers for the same app are serialized, so readers always
//! observe the last completed transition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use binder_common::app::AppSpec;
use binder_common::build::BuildState;
use binder_common::storage::{make_dir, StateDir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

pub mod service;
pub mod time_index;

pub use service::{FileServiceRegistry, ServiceRecord, ServiceRegistry, ServiceSpec};
pub use time_index::TimeIndex;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("registry I/O failure: {0}")]
    InputOutput(#[from] std::io::Error),
    #[error("corrupt record for {0}: {1}")]
    Corrupt(String, serde_json::Error),
    #[error("time index error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Serialize)]
pub struct AppRecord {
    pub spec: AppSpec,
    pub dir: PathBuf,
    pub build_state: BuildState,
    pub last_build_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
}

impl AppRecord {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// The persisted build-state document, one JSON doc per app so a state
/// transition and its build-time stamp land in a single rename.
#[derive(Debug, Default, Deserialize, Serialize)]
struct StateDoc {
    #[serde(default)]
    build_state: BuildState,
    #[serde(default)]
    last_build_time: Option<DateTime<Utc>>,
    #[serde(default)]
    deployment_id: Option<String>,
}

#[async_trait]
pub trait AppRegistry: Send + Sync + 'static {
    /// Idempotent by name: an existing record gets its stored spec
    /// overwritten; filesystem state under the app directory is preserved.
    async fn create(&self, spec: AppSpec) -> Result<AppRecord>;

    async fn find(&self, name: &str) -> Result<Option<AppRecord>>;

    async fn find_all(&self) -> Result<Vec<AppRecord>>;

    /// Enter `Building` and stamp the build time in one atomic transition.
    /// Returns false when a build is already running for the app.
    async fn begin_build(&self, name: &str) -> Result<bool>;

    async fn update_build_state(&self, name: &str, state: BuildState) -> Result<()>;

    async fn get_build_state(&self, name: &str) -> Result<BuildState>;

    async fn last_build_time(&self, name: &str) -> Result<Option<DateTime<Utc>>>;

    async fn set_deployment_id(&self, name: &str, deployment_id: &str) -> Result<()>;
}

pub struct FileRegistry {
    dirs: StateDir,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    time_index: Option<TimeIndex>,
}

impl FileRegistry {
    pub async fn new(dirs: StateDir, time_index: Option<TimeIndex>) -> Result<Self> {
        make_dir(&dirs.apps(), false).await?;

        Ok(Self {
            dirs,
            locks: Mutex::new(HashMap::new()),
            time_index,
        })
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    async fn read_state(&self, name: &str) -> Result<StateDoc> {
        match tokio::fs::read_to_string(self.dirs.build_state(name)).await {
            Ok(raw) => {
                serde_json::from_str(&raw).map_err(|err| Error::Corrupt(name.to_string(), err))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StateDoc::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_state(&self, name: &str, doc: &StateDoc) -> Result<()> {
        make_dir(&self.dirs.app_build(name), false).await?;
        let contents =
            serde_json::to_string(doc).map_err(|err| Error::Corrupt(name.to_string(), err))?;
        write_atomic(&self.dirs.build_state(name), contents).await?;
        Ok(())
    }

    async fn mutate_state<F>(&self, name: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut StateDoc),
    {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        let mut doc = self.read_state(name).await?;
        mutate(&mut doc);
        self.write_state(name, &doc).await
    }

    async fn record(&self, name: &str, spec: AppSpec) -> Result<AppRecord> {
        let state = self.read_state(name).await?;

        Ok(AppRecord {
            spec,
            dir: self.dirs.app(name),
            build_state: state.build_state,
            last_build_time: state.last_build_time,
            deployment_id: state.deployment_id,
        })
    }
}

#[async_trait]
impl AppRegistry for FileRegistry {
    async fn create(&self, spec: AppSpec) -> Result<AppRecord> {
        let name = spec.name.clone();
        let lock = self.name_lock(&name).await;
        let _guard = lock.lock().await;

        make_dir(&self.dirs.app(&name), false).await?;
        let contents =
            serde_json::to_string(&spec).map_err(|err| Error::Corrupt(name.clone(), err))?;
        write_atomic(&self.dirs.app_spec(&name), contents).await?;

        drop(_guard);
        self.record(&name, spec).await
    }

    async fn find(&self, name: &str) -> Result<Option<AppRecord>> {
        let spec = match tokio::fs::read_to_string(self.dirs.app_spec(name)).await {
            Ok(raw) => {
                serde_json::from_str(&raw).map_err(|err| Error::Corrupt(name.to_string(), err))?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        self.record(name, spec).await.map(Some)
    }

    async fn find_all(&self) -> Result<Vec<AppRecord>> {
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(self.dirs.apps()).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.find(&name).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(app = %name, %err, "skipping unreadable app record"),
            }
        }

        records.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        Ok(records)
    }

    async fn begin_build(&self, name: &str) -> Result<bool> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        let mut doc = self.read_state(name).await?;
        if doc.build_state == BuildState::Building {
            return Ok(false);
        }

        let now = Utc::now();
        doc.build_state = BuildState::Building;
        doc.last_build_time = Some(now);
        self.write_state(name, &doc).await?;

        if let Some(index) = &self.time_index {
            // The index is a cache; a failed mirror never fails the build
            if let Err(err) = index.stamp(name, now).await {
                warn!(app = %name, %err, "could not mirror build time");
            }
        }

        Ok(true)
    }

    async fn update_build_state(&self, name: &str, state: BuildState) -> Result<()> {
        let stamp = (state == BuildState::Building).then(Utc::now);

        self.mutate_state(name, |doc| {
            doc.build_state = state;
            if let Some(now) = stamp {
                doc.last_build_time = Some(now);
            }
        })
        .await?;

        if let (Some(index), Some(now)) = (&self.time_index, stamp) {
            if let Err(err) = index.stamp(name, now).await {
                warn!(app = %name, %err, "could not mirror build time");
            }
        }

        Ok(())
    }

    async fn get_build_state(&self, name: &str) -> Result<BuildState> {
        Ok(self.read_state(name).await?.build_state)
    }

    async fn last_build_time(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        if let Some(index) = &self.time_index {
            match index.last_build_time(name).await {
                Ok(Some(time)) => return Ok(Some(time)),
                Ok(None) => {}
                Err(err) => warn!(app = %name, %err, "time index read failed"),
            }
        }

        Ok(self.read_state(name).await?.last_build_time)
    }

    async fn set_deployment_id(&self, name: &str, deployment_id: &str) -> Result<()> {
        let deployment_id = deployment_id.to_string();
        self.mutate_state(name, move |doc| doc.deployment_id = Some(deployment_id))
            .await
    }
}

/// Temp-sibling-then-rename write; the rename makes the update atomic with
/// respect to concurrent readers.
async fn write_atomic(path: &Path, contents: String) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry(dir: &Path) -> FileRegistry {
        FileRegistry::new(StateDir::new(dir), None).await.unwrap()
    }

    fn spec(name: &str) -> AppSpec {
        AppSpec::new(name, format!("https://github.com/acme/{name}"))
    }

    #[tokio::test]
    async fn create_is_idempotent_and_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;

        registry.create(spec("acme-demo")).await.unwrap();
        tokio::fs::write(dir.path().join("apps/acme-demo/keep"), "x")
            .await
            .unwrap();

        let mut updated = spec("acme-demo");
        updated.notebooks = Some("notebooks".to_string());
        let record = registry.create(updated.clone()).await.unwrap();

        assert_eq!(record.spec, updated);
        assert_eq!(
            registry.find("acme-demo").await.unwrap().unwrap().spec,
            updated
        );
        assert!(dir.path().join("apps/acme-demo/keep").exists());
    }

    #[tokio::test]
    async fn missing_records_are_absent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;

        assert!(registry.find("ghost").await.unwrap().is_none());
        assert_eq!(
            registry.get_build_state("ghost").await.unwrap(),
            BuildState::None
        );
        assert!(registry.last_build_time("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn build_time_is_stamped_with_the_building_transition_only() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry.create(spec("acme-demo")).await.unwrap();

        assert!(registry.begin_build("acme-demo").await.unwrap());
        let stamped = registry.last_build_time("acme-demo").await.unwrap().unwrap();

        registry
            .update_build_state("acme-demo", BuildState::Completed)
            .await
            .unwrap();
        assert_eq!(
            registry.get_build_state("acme-demo").await.unwrap(),
            BuildState::Completed
        );
        assert_eq!(
            registry.last_build_time("acme-demo").await.unwrap(),
            Some(stamped)
        );
    }

    #[tokio::test]
    async fn a_running_build_blocks_a_second_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry.create(spec("acme-demo")).await.unwrap();

        assert!(registry.begin_build("acme-demo").await.unwrap());
        assert!(!registry.begin_build("acme-demo").await.unwrap());

        registry
            .update_build_state("acme-demo", BuildState::Failed)
            .await
            .unwrap();
        assert!(registry.begin_build("acme-demo").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_begin_build_admits_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry(dir.path()).await);
        registry.create(spec("acme-demo")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(
                async move { registry.begin_build("acme-demo").await },
            ));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn writes_leave_no_temporary_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry.create(spec("acme-demo")).await.unwrap();
        registry.begin_build("acme-demo").await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path().join("apps/acme-demo/build"))
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        assert_eq!(names, vec![".build_state"]);
    }

    #[tokio::test]
    async fn find_all_enumerates_records() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry.create(spec("acme-demo")).await.unwrap();
        registry.create(spec("acme-other")).await.unwrap();

        let names: Vec<String> = registry
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|record| record.spec.name)
            .collect();

        assert_eq!(names, vec!["acme-demo", "acme-other"]);
    }
}
