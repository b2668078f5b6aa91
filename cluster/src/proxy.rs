//! Client for the front-end proxy's route registry. The proxy's connection
//! info is persisted by cluster bring-up and re-read on every operation, so
//! a restarted control plane keeps working against a running proxy.

use std::collections::HashMap;

use binder_common::storage::StateDir;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::{Error, Result};

#[derive(Serialize)]
struct RouteTarget<'a> {
    target: &'a str,
}

struct ProxyInfo {
    routes_url: String,
    token: String,
}

#[derive(Clone)]
pub struct ProxyClient {
    dirs: StateDir,
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(dirs: StateDir) -> Self {
        Self {
            dirs,
            http: reqwest::Client::new(),
        }
    }

    /// Persist the proxy host and auth token, two lines.
    pub async fn write_info(&self, host: &str, token: &str) -> Result<()> {
        tokio::fs::write(self.dirs.proxy_info(), format!("{host}\n{token}\n")).await?;
        Ok(())
    }

    async fn read_info(&self) -> Result<ProxyInfo> {
        let raw = tokio::fs::read_to_string(self.dirs.proxy_info())
            .await
            .map_err(|_| Error::ProxyInfo)?;
        let mut lines = raw.lines();
        let host = lines.next().ok_or(Error::ProxyInfo)?.trim();
        let token = lines.next().ok_or(Error::ProxyInfo)?.trim();
        if host.is_empty() || token.is_empty() {
            return Err(Error::ProxyInfo);
        }

        Ok(ProxyInfo {
            routes_url: format!("http://{host}/api/routes"),
            token: token.to_string(),
        })
    }

    /// Register `/deployment_id -> target`. The proxy answers 201 when the
    /// route is live; anything else is a refusal the caller may retry.
    pub async fn register(&self, deployment_id: &str, target: &str) -> Result<()> {
        let info = self.read_info().await?;

        let response = self
            .http
            .post(format!("{}/{deployment_id}", info.routes_url))
            .header("Authorization", format!("token {}", info.token))
            .json(&RouteTarget { target })
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => Ok(()),
            status => Err(Error::RouteRefused(
                deployment_id.to_string(),
                status.as_u16(),
            )),
        }
    }

    pub async fn remove(&self, deployment_id: &str) -> Result<()> {
        let info = self.read_info().await?;

        let response = self
            .http
            .delete(format!("{}/{deployment_id}", info.routes_url))
            .header("Authorization", format!("token {}", info.token))
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(()),
            status => Err(Error::RouteRefused(
                deployment_id.to_string(),
                status.as_u16(),
            )),
        }
    }

    /// Deployment ids of routes with no activity since the threshold. Route
    /// keys come back with their leading slash stripped.
    pub async fn inactive_routes(&self, threshold: DateTime<Utc>) -> Result<Vec<String>> {
        let info = self.read_info().await?;

        let routes: HashMap<String, serde_json::Value> = self
            .http
            .get(&info.routes_url)
            .query(&[(
                "inactive_since",
                threshold.to_rfc3339_opts(SecondsFormat::Secs, true),
            )])
            .header("Authorization", format!("token {}", info.token))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(count = routes.len(), "inactive routes fetched");

        Ok(routes
            .into_keys()
            .map(|key| key.trim_start_matches('/').to_string())
            .collect())
    }
}
