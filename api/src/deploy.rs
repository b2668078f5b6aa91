//! Per-app deployment: render the manifest set for an app and its services
//! into the app's deploy directory, then hand the directory to the cluster
//! controller.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use binder_cluster::ClusterController;
use binder_common::app::NOTEBOOK_PORT;
use binder_common::config::Config;
use binder_common::storage::{make_dir, StateDir};
use binder_common::template::{namespace_params, render_str, Params};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};
use ulid::Ulid;

use crate::persistence::{AppRecord, ServiceRecord, ServiceRegistry};

pub const DEFAULT_MODE: &str = "single-node";

/// Manifest templates shipped with the platform, one per resource type.
const MANIFEST_TEMPLATES: &[&str] = &[
    "namespace.json",
    "pod.json",
    "service-pod.json",
    "notebook.json",
    "controller.json",
    "service.json",
];

#[derive(thiserror::Error, Debug)]
pub enum DeployError {
    #[error("service {service} does not support {mode} deployment")]
    UnsupportedMode { service: String, mode: String },
    #[error("unknown service {0}")]
    UnknownService(String),
    #[error("missing manifest template {0}")]
    MissingTemplate(String),
    #[error("missing component template {0}")]
    MissingComponent(String),
    #[error("malformed deployment document for {0}: {1}")]
    Malformed(String, serde_json::Error),
    #[error("registry failure: {0}")]
    Persistence(#[from] crate::persistence::Error),
    #[error("cluster failure: {0}")]
    Cluster(#[from] binder_cluster::Error),
    #[error("deploy I/O failure: {0}")]
    InputOutput(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug)]
pub struct DeployOutcome {
    pub deployment_id: String,
    pub redirect_url: String,
}

/// Deploy a built app. Assigns a fresh deployment id, renders the manifest
/// set and returns the user-facing URL from the cluster controller.
#[instrument(skip_all, fields(app = %record.spec.name, %mode))]
pub async fn deploy_app(
    config: &Config,
    services: &Arc<dyn ServiceRegistry>,
    cluster: &Arc<dyn ClusterController>,
    record: &AppRecord,
    mode: &str,
) -> Result<DeployOutcome> {
    let name = record.name();
    // Lowercased so the id can double as a namespace
    let deployment_id = Ulid::new().to_string().to_lowercase();

    let deploy_path = config.state.app_deploy(name);
    make_dir(&deploy_path, true).await?;

    let app_params = app_params(config, name, &deployment_id);
    let templates = load_templates(&config.state).await?;

    // Every app gets its namespace and the notebook pod; services add the rest
    for manifest in ["namespace.json", "notebook.json"] {
        let rendered = render_str(&templates[manifest], &app_params);
        tokio::fs::write(deploy_path.join(manifest), rendered).await?;
    }

    for service_ref in &record.spec.services {
        let service = services
            .get(&service_ref.name, &service_ref.version)
            .await?
            .ok_or_else(|| DeployError::UnknownService(service_ref.full_name()))?;
        deploy_service(config, &service, mode, &deploy_path, &app_params, &templates).await?;
    }

    let redirect_url = cluster.deploy_app(&deployment_id, &deploy_path).await?;

    info!(%deployment_id, %redirect_url, "app deployed");
    Ok(DeployOutcome {
        deployment_id,
        redirect_url,
    })
}

fn app_params(config: &Config, name: &str, deployment_id: &str) -> Params {
    namespace_params(
        "app",
        Params::from([
            ("name".to_string(), name.to_string()),
            ("id".to_string(), deployment_id.to_string()),
            ("notebooks-image".to_string(), config.image_name(name)),
            ("notebooks-port".to_string(), NOTEBOOK_PORT.to_string()),
        ]),
    )
}

async fn load_templates(dirs: &StateDir) -> Result<HashMap<String, String>> {
    let mut templates = HashMap::new();

    for name in MANIFEST_TEMPLATES {
        let raw = tokio::fs::read_to_string(dirs.templates().join(name))
            .await
            .map_err(|_| DeployError::MissingTemplate(name.to_string()))?;
        templates.insert(name.to_string(), raw);
    }

    Ok(templates)
}

/// The rendered shape of a per-mode deployment document.
#[derive(Deserialize)]
struct DeploymentDoc {
    #[serde(default)]
    components: Vec<ComponentDoc>,
}

#[derive(Deserialize)]
struct ComponentDoc {
    name: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    #[serde(default)]
    deployments: Vec<TargetDoc>,
}

#[derive(Deserialize)]
struct TargetDoc {
    r#type: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
}

/// Render one service into the deploy directory: pick the per-mode
/// deployment document, then inject every rendered component into the
/// manifest template of its target type.
async fn deploy_service(
    config: &Config,
    service: &ServiceRecord,
    mode: &str,
    deploy_path: &Path,
    app_params: &Params,
    templates: &HashMap<String, String>,
) -> Result<()> {
    let deployments = service.deployments().await?;
    let Some(deployment) = deployments.get(mode) else {
        return Err(DeployError::UnsupportedMode {
            service: service.full_name(),
            mode: mode.to_string(),
        });
    };

    let mut service_params = app_params.clone();
    service_params.extend(namespace_params("service", service.spec.string_params()));

    let rendered = render_str(deployment, &service_params);
    let doc: DeploymentDoc = serde_json::from_str(&rendered)
        .map_err(|err| DeployError::Malformed(service.full_name(), err))?;

    let components = service.components().await?;

    for component in &doc.components {
        for target in &component.deployments {
            let mut component_params: BTreeMap<String, Value> = target.parameters.clone();
            component_params.extend(component.parameters.clone());

            let mut string_params: Params = component_params
                .iter()
                .map(|(key, value)| (key.clone(), stringify(value)))
                .collect();
            string_params.insert("name".to_string(), component.name.clone());
            string_params.insert(
                "image-name".to_string(),
                format!(
                    "{}/{}-{}",
                    config.registry(),
                    service.full_name(),
                    component.name
                ),
            );

            let mut final_params = service_params.clone();
            final_params.extend(namespace_params("component", string_params));

            let component_key = format!("{}.json", component.name);
            let component_template = components
                .get(&component_key)
                .ok_or(DeployError::MissingComponent(component_key))?;
            let containers = render_str(component_template, &final_params);
            final_params.insert("containers".to_string(), containers);

            let manifest_key = format!("{}.json", target.r#type);
            let manifest_template = templates
                .get(&manifest_key)
                .ok_or(DeployError::MissingTemplate(manifest_key))?;
            let manifest = render_str(manifest_template, &final_params);

            tokio::fs::write(
                deploy_path.join(format!("{}-{}.json", component.name, target.r#type)),
                manifest,
            )
            .await?;
        }
    }

    Ok(())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use binder_common::config::Provider;

    use super::*;
    use crate::persistence::{AppRegistry, FileRegistry, FileServiceRegistry};
    use crate::test_support::NullCluster;
    use binder_common::app::{AppSpec, ServiceRef};

    async fn seed_state(root: &Path) -> Config {
        let dirs = StateDir::new(root);
        tokio::fs::create_dir_all(dirs.templates()).await.unwrap();

        let templates = [
            ("namespace.json", r#"{"kind": "Namespace", "name": "{{app.id}}"}"#),
            ("notebook.json", r#"{"kind": "Pod", "image": "{{app.notebooks-image}}", "port": {{app.notebooks-port}}}"#),
            ("pod.json", r#"{"kind": "Pod", "name": "{{component.name}}", "containers": {{containers}}}"#),
            ("service-pod.json", r#"{"kind": "Pod"}"#),
            ("controller.json", r#"{"kind": "ReplicationController", "name": "{{component.name}}"}"#),
            ("service.json", r#"{"kind": "Service", "name": "{{component.name}}"}"#),
        ];
        for (name, contents) in templates {
            tokio::fs::write(dirs.templates().join(name), contents)
                .await
                .unwrap();
        }

        let service_path = dirs.service("spark", "1.4.1");
        tokio::fs::create_dir_all(service_path.join("deployments"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(service_path.join("components"))
            .await
            .unwrap();
        tokio::fs::write(
            service_path.join("conf.json"),
            r#"{"images": [{"name": "master"}], "parameters": {"version": "1.4.1"}}"#,
        )
        .await
        .unwrap();
        tokio::fs::write(
            service_path.join("deployments/single-node.json"),
            r#"{
                "components": [{
                    "name": "master",
                    "parameters": {"cores": 2},
                    "deployments": [{"type": "pod"}, {"type": "service"}]
                }]
            }"#,
        )
        .await
        .unwrap();
        tokio::fs::write(
            service_path.join("components/master.json"),
            r#"[{"image": "{{component.image-name}}", "cores": "{{component.cores}}", "app": "{{app.name}}"}]"#,
        )
        .await
        .unwrap();

        Config {
            state: dirs,
            project: "proj".to_string(),
            provider: Provider::Gce,
        }
    }

    #[tokio::test]
    async fn renders_the_full_manifest_set() {
        let dir = tempfile::tempdir().unwrap();
        let config = seed_state(dir.path()).await;

        let registry = FileRegistry::new(config.state.clone(), None).await.unwrap();
        let mut spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        spec.services = vec![ServiceRef {
            name: "spark".to_string(),
            version: "1.4.1".to_string(),
        }];
        let record = registry.create(spec).await.unwrap();

        let services: Arc<dyn ServiceRegistry> =
            Arc::new(FileServiceRegistry::new(config.state.clone()));
        let cluster: Arc<dyn ClusterController> = Arc::new(NullCluster);

        let outcome = deploy_app(&config, &services, &cluster, &record, DEFAULT_MODE)
            .await
            .unwrap();

        assert_eq!(
            outcome.redirect_url,
            format!("https://cluster.example/{}", outcome.deployment_id)
        );

        let deploy_path = config.state.app_deploy("acme-demo");
        let namespace = tokio::fs::read_to_string(deploy_path.join("namespace.json"))
            .await
            .unwrap();
        assert!(namespace.contains(&outcome.deployment_id));

        let notebook = tokio::fs::read_to_string(deploy_path.join("notebook.json"))
            .await
            .unwrap();
        assert!(notebook.contains("gcr.io/proj/acme-demo"));
        assert!(notebook.contains("8888"));

        let pod = tokio::fs::read_to_string(deploy_path.join("master-pod.json"))
            .await
            .unwrap();
        assert!(pod.contains("gcr.io/proj/spark-1.4.1-master"));
        assert!(pod.contains("\"cores\": \"2\""));
        assert!(pod.contains("\"app\": \"acme-demo\""));

        assert!(deploy_path.join("master-service.json").exists());
    }

    #[tokio::test]
    async fn unsupported_mode_is_fatal_for_the_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = seed_state(dir.path()).await;

        let registry = FileRegistry::new(config.state.clone(), None).await.unwrap();
        let mut spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        spec.services = vec![ServiceRef {
            name: "spark".to_string(),
            version: "1.4.1".to_string(),
        }];
        let record = registry.create(spec).await.unwrap();

        let services: Arc<dyn ServiceRegistry> =
            Arc::new(FileServiceRegistry::new(config.state.clone()));
        let cluster: Arc<dyn ClusterController> = Arc::new(NullCluster);

        let err = deploy_app(&config, &services, &cluster, &record, "multi-node")
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::UnsupportedMode { .. }));
    }
}
