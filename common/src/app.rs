use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Port the notebook server listens on inside every app container.
pub const NOTEBOOK_PORT: u16 = 8888;

/// Derive the globally unique app name for a repository-sourced app.
pub fn app_name(org: &str, repo: &str) -> String {
    format!("{org}-{repo}").to_lowercase()
}

/// Tokens recognized in a spec's `dependencies` list. They control how the
/// image build context for the app is assembled.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Display, EnumString, PartialEq, Eq)]
pub enum Dependency {
    #[serde(rename = "requirements.txt")]
    #[strum(serialize = "requirements.txt")]
    Requirements,
    #[serde(rename = "environment.yml")]
    #[strum(serialize = "environment.yml")]
    CondaEnvironment,
    #[serde(rename = "dockerfile")]
    #[strum(serialize = "dockerfile", ascii_case_insensitive)]
    Dockerfile,
}

/// Reference to a versioned service an app composes in at deploy time.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceRef {
    pub name: String,
    pub version: String,
}

impl ServiceRef {
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// The persisted description of an app: where its source lives and how to
/// turn that source into a notebook image.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    pub repo: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    /// Path within the repository holding the notebooks to mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebooks: Option<String>,
    /// Path to the repository's container build file, when it ships one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    /// Path to the repository's requirements file, when not at the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
}

impl AppSpec {
    pub fn new(name: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo: repo.into(),
            services: Vec::new(),
            dependencies: Vec::new(),
            notebooks: None,
            dockerfile: None,
            requirements: None,
        }
    }

    pub fn has_dependency(&self, dependency: Dependency) -> bool {
        self.dependencies.contains(&dependency)
    }
}
