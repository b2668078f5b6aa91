use std::path::{Path, PathBuf};

/// Layout of the persistent state directory rooted at `HOME_DIR`.
///
/// Every component resolves its paths through this type so the on-disk
/// contract stays in one place:
///
/// ```text
/// {root}/apps/{name}/spec.json
/// {root}/apps/{name}/build/.build_state
/// {root}/apps/{name}/repo/
/// {root}/services/{name}/{version}/...
/// {root}/logs/binder/root/binder.log
/// {root}/logs/binder/apps/{name}.log
/// {root}/.proxy_info
/// {root}/.registry_info
/// ```
#[derive(Clone, Debug)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apps(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn app(&self, name: &str) -> PathBuf {
        self.apps().join(name)
    }

    pub fn app_spec(&self, name: &str) -> PathBuf {
        self.app(name).join("spec.json")
    }

    pub fn app_repo(&self, name: &str) -> PathBuf {
        self.app(name).join("repo")
    }

    pub fn app_build(&self, name: &str) -> PathBuf {
        self.app(name).join("build")
    }

    pub fn app_deploy(&self, name: &str) -> PathBuf {
        self.app(name).join("deploy")
    }

    pub fn build_state(&self, name: &str) -> PathBuf {
        self.app_build(name).join(".build_state")
    }

    pub fn services(&self) -> PathBuf {
        self.root.join("services")
    }

    pub fn service(&self, name: &str, version: &str) -> PathBuf {
        self.services().join(name).join(version)
    }

    /// The shipped image-template tree copied into every build context.
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// The shipped per-resource manifest templates used at deploy time.
    pub fn templates(&self) -> PathBuf {
        self.root.join("templates")
    }

    /// Helper scripts shipped with the platform (`squash-and-push`,
    /// `handle-requirements.py`).
    pub fn util(&self) -> PathBuf {
        self.root.join("util")
    }

    pub fn squash_and_push(&self) -> PathBuf {
        self.util().join("squash-and-push")
    }

    /// Manifests for the front-end proxy pods, launched at cluster start.
    pub fn proxy_deployment(&self) -> PathBuf {
        self.root.join("proxy").join("deployment")
    }

    /// Manifests for the private registry pods.
    pub fn registry_deployment(&self) -> PathBuf {
        self.root.join("registry").join("deployment")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs").join("binder")
    }

    pub fn root_log_dir(&self) -> PathBuf {
        self.logs().join("root")
    }

    pub fn root_log(&self) -> PathBuf {
        self.root_log_dir().join("binder.log")
    }

    pub fn app_log_dir(&self) -> PathBuf {
        self.logs().join("apps")
    }

    pub fn app_log(&self, app: &str, filtered: bool) -> PathBuf {
        let file = if filtered {
            format!("{app}-filtered.log")
        } else {
            format!("{app}.log")
        };
        self.app_log_dir().join(file)
    }

    pub fn proxy_info(&self) -> PathBuf {
        self.root.join(".proxy_info")
    }

    pub fn registry_info(&self) -> PathBuf {
        self.root.join(".registry_info")
    }
}

/// Create a directory and all parents, first removing any existing content
/// when `clean` is set.
pub async fn make_dir(path: &Path, clean: bool) -> std::io::Result<()> {
    if clean && path.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    }
    tokio::fs::create_dir_all(path).await
}
