use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::storage::StateDir;

/// Name of the shared base image every app layers on top of.
pub const BASE_IMAGE: &str = "binder-base";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("mandatory environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("unrecognized orchestrator provider: {0}")]
    UnknownProvider(String),
}

/// Cluster provider the orchestrator CLI targets.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Display, EnumString, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    Gce,
    Aws,
}

/// Environment-sourced configuration shared by every binary.
#[derive(Clone, Debug)]
pub struct Config {
    pub state: StateDir,
    pub project: String,
    pub provider: Provider,
}

impl Config {
    /// Read `HOME_DIR`, `PROJECT` and `ORCHESTRATOR_PROVIDER` from the
    /// environment. The first two are mandatory; the provider defaults to
    /// `gce`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home =
            std::env::var("HOME_DIR").map_err(|_| ConfigError::MissingVar("HOME_DIR"))?;
        let project =
            std::env::var("PROJECT").map_err(|_| ConfigError::MissingVar("PROJECT"))?;
        let provider = match std::env::var("ORCHESTRATOR_PROVIDER") {
            Ok(raw) => {
                Provider::from_str(&raw).map_err(|_| ConfigError::UnknownProvider(raw))?
            }
            Err(_) => Provider::Gce,
        };

        Ok(Self {
            state: StateDir::new(home),
            project,
            provider,
        })
    }

    /// Address of the private registry within the provider's registry
    /// namespace.
    pub fn registry(&self) -> String {
        format!("gcr.io/{}", self.project)
    }

    pub fn image_name(&self, app: &str) -> String {
        format!("{}/{}", self.registry(), app).to_lowercase()
    }

    pub fn base_image_name(&self) -> String {
        format!("{}/{}", self.registry(), BASE_IMAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names_are_lowercase() {
        let config = Config {
            state: StateDir::new("/tmp/binder"),
            project: "proj".to_string(),
            provider: Provider::Gce,
        };

        assert_eq!(config.image_name("Acme-Demo"), "gcr.io/proj/acme-demo");
        assert_eq!(config.base_image_name(), "gcr.io/proj/binder-base");
    }

    #[test]
    fn provider_parse() {
        assert_eq!(Provider::from_str("gce").unwrap(), Provider::Gce);
        assert!(Provider::from_str("azure").is_err());
    }
}
