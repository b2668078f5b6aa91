//! Kubernetes-backed [`ClusterController`]. Every interaction with the
//! orchestrator goes through its CLI; the cluster is otherwise opaque.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use binder_common::config::{Config, Provider, BASE_IMAGE};
use binder_common::storage::make_dir;
use binder_common::template::{render_str, Params};
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::proxy::ProxyClient;
use crate::{ClusterController, Error, Result, RunningApp, SYSTEM_NAMESPACES};

/// Name of the notebook pod inside every app namespace.
const NOTEBOOK_POD: &str = "notebook-server";

const ROUTE_RETRIES: usize = 30;
const ROUTE_RETRY_PAUSE: Duration = Duration::from_secs(1);
const URL_POLL_RETRIES: usize = 5;
const URL_POLL_PAUSE: Duration = Duration::from_secs(20);

/// Public image the private registry is seeded from at bring-up.
const PUBLIC_BASE_IMAGE: &str = "binder/binder-base";

static SERVICE_INGRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"LoadBalancer Ingress:\s*(?P<ip>\S+)").unwrap());
static POD_IP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^IP:\s*(?P<ip>\S+)").unwrap());
static POD_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Image:\s*(?P<image>\S+)").unwrap());
static POD_CAPACITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"pods:\s*(?P<pods>\d+)").unwrap());

pub struct KubeController {
    config: Config,
    proxy: ProxyClient,
}

impl KubeController {
    pub fn new(config: Config) -> Self {
        let proxy = ProxyClient::new(config.state.clone());
        Self { config, proxy }
    }

    pub fn proxy(&self) -> &ProxyClient {
        &self.proxy
    }

    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("kubectl").args(args).output().await?;

        if !output.status.success() {
            return Err(Error::Command(format!(
                "kubectl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn create_resource(&self, file: &Path, namespace: Option<&str>) -> Result<()> {
        let file = file.to_string_lossy().into_owned();
        let mut args = vec!["create", "-f", file.as_str()];
        let scoped;
        if let Some(namespace) = namespace {
            scoped = format!("--namespace={namespace}");
            args.push(&scoped);
        }

        self.kubectl(&args)
            .await
            .map(|_| ())
            .map_err(|err| Error::ResourceCreate(format!("{file}: {err}")))
    }

    /// External address of a platform service, once the provider has
    /// assigned its load balancer.
    async fn service_url(&self, service: &str) -> Result<String> {
        let description = self.kubectl(&["describe", "service", service]).await?;

        SERVICE_INGRESS
            .captures(&description)
            .map(|caps| caps["ip"].to_string())
            .ok_or_else(|| Error::NoExternalUrl(service.to_string()))
    }

    async fn pod_ip(&self, deployment_id: &str) -> Option<String> {
        let namespace = format!("--namespace={deployment_id}");
        let description = self
            .kubectl(&["describe", "pod", NOTEBOOK_POD, &namespace])
            .await
            .ok()?;

        POD_IP
            .captures(&description)
            .map(|caps| caps["ip"].to_string())
    }

    async fn nodes(&self) -> Result<Vec<String>> {
        let output = self.kubectl(&["get", "nodes"]).await?;

        Ok(output
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    fn worker_nodes(nodes: Vec<String>) -> Vec<String> {
        nodes
            .into_iter()
            .filter(|name| !name.contains("master") && !name.contains("control-plane"))
            .collect()
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let output = self.kubectl(&["get", "namespaces"]).await?;

        Ok(output
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .filter(|name| !SYSTEM_NAMESPACES.contains(name))
            .map(str::to_string)
            .collect())
    }

    /// Wait for the proxy route to come up: the pod address is re-read from
    /// the orchestrator on every attempt since it is assigned asynchronously.
    async fn register_route(&self, deployment_id: &str) -> Result<()> {
        for _ in 0..ROUTE_RETRIES {
            if let Some(ip) = self.pod_ip(deployment_id).await {
                let target = format!("http://{ip}:{}", binder_common::app::NOTEBOOK_PORT);
                match self.proxy.register(deployment_id, &target).await {
                    Ok(()) => {
                        info!(%deployment_id, %target, "proxy route registered");
                        return Ok(());
                    }
                    Err(err) => warn!(%deployment_id, %err, "route registration attempt failed"),
                }
            }
            sleep(ROUTE_RETRY_PAUSE).await;
        }

        Err(Error::RouteRegistration(deployment_id.to_string()))
    }

    /// Render the shipped manifests of a platform component (proxy pods,
    /// registry pods) and create them all.
    async fn launch_platform_pods(&self, templates: &Path, params: &Params) -> Result<()> {
        let deploy_dir = templates
            .parent()
            .unwrap_or(templates)
            .join("deploy");
        make_dir(&deploy_dir, true).await?;

        let mut entries = tokio::fs::read_dir(templates).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let raw = tokio::fs::read_to_string(entry.path()).await?;
            let target = deploy_dir.join(entry.file_name());
            tokio::fs::write(&target, render_str(&raw, params)).await?;
            self.create_resource(&target, None).await?;
        }

        Ok(())
    }

    async fn poll_service_url(&self, service: &str) -> Result<String> {
        for _ in 0..URL_POLL_RETRIES {
            sleep(URL_POLL_PAUSE).await;
            match self.service_url(service).await {
                Ok(url) => return Ok(url),
                Err(err) => info!(%service, %err, "external URL not assigned yet"),
            }
        }

        Err(Error::NoExternalUrl(service.to_string()))
    }

    async fn seed_registry(&self) -> Result<()> {
        let base = self.config.base_image_name();

        for args in [
            vec!["pull", PUBLIC_BASE_IMAGE],
            vec!["tag", PUBLIC_BASE_IMAGE, &base],
            vec!["push", &base],
        ] {
            let status = Command::new("docker").args(&args).status().await?;
            if !status.success() {
                return Err(Error::Command(format!(
                    "docker {} exited with {status}",
                    args.join(" ")
                )));
            }
        }

        Ok(())
    }

    /// One-shot cluster bring-up: external cluster start, proxy and registry
    /// pods, connection info persisted, base image preloaded everywhere.
    /// The caller is expected to have the log daemon running and to install
    /// the idle reaper afterwards.
    #[instrument(skip(self))]
    pub async fn start(&self, num_nodes: u32) -> Result<()> {
        let status = Command::new("kube-up.sh")
            .env("NUM_MINIONS", num_nodes.to_string())
            .env("KUBERNETES_PROVIDER", self.config.provider.to_string())
            .status()
            .await?;
        if !status.success() {
            return Err(Error::Command(format!("kube-up.sh exited with {status}")));
        }

        info!("launching the front-end proxy");
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let params = Params::from([("token".to_string(), token.clone())]);
        self.launch_platform_pods(&self.config.state.proxy_deployment(), &params)
            .await?;
        let proxy_host = self.poll_service_url("proxy-registration").await?;
        self.proxy.write_info(&proxy_host, &token).await?;

        info!("launching the private registry");
        self.launch_platform_pods(&self.config.state.registry_deployment(), &Params::new())
            .await?;
        let registry_host = self.poll_service_url("registry").await?;
        tokio::fs::write(
            self.config.state.registry_info(),
            format!("{registry_host}\n"),
        )
        .await?;

        info!("seeding the registry and preloading the base image");
        self.seed_registry().await?;
        self.preload_image(BASE_IMAGE).await?;

        info!("cluster started");
        Ok(())
    }

    /// Tear the external cluster down.
    pub async fn stop(&self) -> Result<()> {
        let status = Command::new("kube-down.sh")
            .env("KUBERNETES_PROVIDER", self.config.provider.to_string())
            .status()
            .await?;
        if !status.success() {
            return Err(Error::Command(format!("kube-down.sh exited with {status}")));
        }

        Ok(())
    }
}

#[async_trait]
impl ClusterController for KubeController {
    #[instrument(skip(self, deploy_dir))]
    async fn deploy_app(&self, deployment_id: &str, deploy_dir: &Path) -> Result<String> {
        // The namespace has to exist before anything inside it
        self.create_resource(&deploy_dir.join("namespace.json"), None)
            .await?;

        let mut entries = tokio::fs::read_dir(deploy_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == "namespace.json" {
                continue;
            }
            // Manifests are independent: deploy what can be deployed
            if let Err(err) = self
                .create_resource(&entry.path(), Some(deployment_id))
                .await
            {
                warn!(%deployment_id, %err, "could not create manifest");
            }
        }

        self.register_route(deployment_id).await?;

        let host = self.service_url("proxy-lookup").await?;
        Ok(format!("https://{host}/{deployment_id}"))
    }

    #[instrument(skip(self))]
    async fn stop_app(&self, deployment_id: &str) -> Result<()> {
        // Stop routing new traffic before tearing anything down
        if let Err(err) = self.proxy.remove(deployment_id).await {
            warn!(%deployment_id, %err, "could not remove proxy route");
        }

        let namespace = format!("--namespace={deployment_id}");
        self.kubectl(&[
            "delete",
            "pods,services,replicationcontrollers",
            "--all",
            &namespace,
        ])
        .await?;
        self.kubectl(&["delete", "namespace", deployment_id]).await?;

        info!(%deployment_id, "app stopped");
        Ok(())
    }

    async fn stop_inactive_apps(&self, inactive_for: chrono::Duration) -> Result<()> {
        let threshold = chrono::Utc::now() - inactive_for;
        let routes = self.proxy.inactive_routes(threshold).await?;

        for deployment_id in routes {
            if SYSTEM_NAMESPACES.contains(&deployment_id.as_str()) {
                continue;
            }
            info!(%deployment_id, "stopping inactive app");
            if let Err(err) = self.stop_app(&deployment_id).await {
                warn!(%deployment_id, %err, "could not stop inactive app");
            }
        }

        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<RunningApp>> {
        let mut running = Vec::new();

        for namespace in self.namespaces().await? {
            let scoped = format!("--namespace={namespace}");
            let Ok(description) = self
                .kubectl(&["describe", "pod", NOTEBOOK_POD, &scoped])
                .await
            else {
                continue;
            };

            if let Some(caps) = POD_IMAGE.captures(&description) {
                running.push(RunningApp {
                    deployment_id: namespace,
                    image: caps["image"].to_string(),
                });
            }
        }

        Ok(running)
    }

    async fn get_total_capacity(&self) -> Result<u64> {
        let mut total = 0;

        for node in Self::worker_nodes(self.nodes().await?) {
            let description = self.kubectl(&["describe", "node", &node]).await?;
            match POD_CAPACITY.captures(&description) {
                Some(caps) => {
                    total += caps["pods"]
                        .parse::<u64>()
                        .map_err(|err| Error::Command(format!("bad capacity for {node}: {err}")))?
                }
                None => warn!(%node, "no pod capacity in node description"),
            }
        }

        Ok(total)
    }

    #[instrument(skip(self))]
    async fn preload_image(&self, image: &str) -> Result<()> {
        if self.config.provider != Provider::Gce {
            return Err(Error::UnsupportedProvider(self.config.provider.to_string()));
        }

        let pull = format!("sudo docker pull {}/{image}", self.config.registry());
        let zone = std::env::var("GCE_ZONE").ok();

        let mut children = Vec::new();
        for node in Self::worker_nodes(self.nodes().await?) {
            info!(%node, %image, "preloading image");
            let mut command = Command::new("gcloud");
            command.args(["compute", "ssh", &node]);
            if let Some(zone) = &zone {
                command.args(["--zone", zone]);
            }
            command.args(["--command", &pull]);
            children.push(command.status());
        }

        for status in futures::future::join_all(children).await {
            let status = status?;
            if !status.success() {
                return Err(Error::Command(format!(
                    "node preload of {image} exited with {status}"
                )));
            }
        }

        info!(%image, "image preloaded onto all nodes");
        Ok(())
    }
}
