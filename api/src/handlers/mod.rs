//! The HTTP/WebSocket surface. Handlers are thin: admission checks here,
//! everything else delegated to the registry, the build manager, the cluster
//! controller and the log plane.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, Query};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use binder_cluster::ClusterController;
use binder_common::app::{app_name, AppSpec};
use binder_common::build::BuildState;
use binder_common::config::Config;
use binder_logd::stream::fetch_logs;
use binder_logd::AppLogStreamer;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, instrument};
use ttl_cache::TtlCache;

use crate::build::{BuildManager, SubmitError};
use crate::deploy;
use crate::persistence::{AppRecord, AppRegistry, ServiceRegistry};

mod error;

pub use error::{Error, Result};

/// Root object handed to every handler through a single extension.
#[derive(Clone)]
pub struct ApiContext {
    pub config: Config,
    pub registry: Arc<dyn AppRegistry>,
    pub services: Arc<dyn ServiceRegistry>,
    pub cluster: Arc<dyn ClusterController>,
    pub builds: BuildManager,
    pub broker: SocketAddr,
    pub pubsub: SocketAddr,
    pub capacity_ttl: Duration,
    pub capacity: Arc<Mutex<TtlCache<&'static str, u64>>>,
    pub shutdown: CancellationToken,
}

impl ApiContext {
    pub fn capacity_cache() -> Arc<Mutex<TtlCache<&'static str, u64>>> {
        Arc::new(Mutex::new(TtlCache::new(1)))
    }
}

pub fn make_router(ctx: ApiContext, allow_origin: bool) -> Router {
    let mut router = Router::new()
        .route("/apps/:org/:repo/status", get(get_build_status))
        .route("/apps/:org/:repo/logs/static", get(get_static_logs))
        .route("/apps/:org/:repo/logs/live", get(get_live_logs))
        .route("/apps/:org/:repo", get(deploy_app).post(submit_build))
        .route("/apps", get(get_apps))
        .route("/services", get(get_services))
        .route("/running", get(get_running))
        .route("/capacity", get(get_capacity))
        .layer(Extension(ctx));

    if allow_origin {
        router = router.layer(CorsLayer::new().allow_origin(Any));
    }

    router
}

#[instrument(skip_all, fields(%org, %repo))]
async fn get_build_status(
    Extension(ctx): Extension<ApiContext>,
    Path((org, repo)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let name = app_name(&org, &repo);
    let record = ctx.registry.find(&name).await?.ok_or(Error::AppNotFound)?;

    Ok(Json(
        json!({ "build_status": record.build_state.status_word() }),
    ))
}

/// Admission: the server derives `name` and `repo` from the path; a spec
/// carrying either is malformed. Accepted specs are enqueued without
/// blocking.
#[instrument(skip_all, fields(%org, %repo))]
async fn submit_build(
    Extension(ctx): Extension<ApiContext>,
    Path((org, repo)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>> {
    if ctx.shutdown.is_cancelled() {
        return Err(Error::ShuttingDown);
    }

    let Some(Json(Value::Object(mut fields))) = body else {
        return Err(Error::MalformedSpec);
    };
    if fields.contains_key("repo") || fields.contains_key("name") {
        return Err(Error::MalformedSpec);
    }

    fields.insert("name".to_string(), Value::String(app_name(&org, &repo)));
    fields.insert(
        "repo".to_string(),
        Value::String(format!("https://github.com/{org}/{repo}")),
    );
    let spec: AppSpec =
        serde_json::from_value(Value::Object(fields)).map_err(|_| Error::MalformedSpec)?;

    ctx.builds.try_submit(spec).map_err(|err| match err {
        SubmitError::QueueFull => Error::QueueFull,
        SubmitError::Closed => Error::ShuttingDown,
    })?;

    Ok(Json(json!({ "success": "app submitted to build queue" })))
}

#[derive(Debug, Deserialize)]
struct DeployQuery {
    mode: Option<String>,
}

/// Deploy a completed build and hand the user its URL.
#[instrument(skip_all, fields(%org, %repo))]
async fn deploy_app(
    Extension(ctx): Extension<ApiContext>,
    Path((org, repo)): Path<(String, String)>,
    Query(query): Query<DeployQuery>,
) -> Result<Json<Value>> {
    let name = app_name(&org, &repo);
    let record = match ctx.registry.find(&name).await? {
        Some(record) if record.build_state == BuildState::Completed => record,
        _ => return Err(Error::NoAppToDeploy),
    };

    let mode = query.mode.as_deref().unwrap_or(deploy::DEFAULT_MODE);
    let outcome =
        deploy::deploy_app(&ctx.config, &ctx.services, &ctx.cluster, &record, mode).await?;

    ctx.registry
        .set_deployment_id(&name, &outcome.deployment_id)
        .await?;

    Ok(Json(json!({ "redirect_url": outcome.redirect_url })))
}

/// Full history since the last build, one line per row.
#[instrument(skip_all, fields(%org, %repo))]
async fn get_static_logs(
    Extension(ctx): Extension<ApiContext>,
    Path((org, repo)): Path<(String, String)>,
) -> Result<String> {
    let name = app_name(&org, &repo);
    let record = ctx.registry.find(&name).await?.ok_or(Error::AppNotFound)?;

    match fetch_logs(ctx.broker, &name, record.last_build_time, false).await {
        Ok(lines) => Ok(lines),
        // An app that never logged has no file yet
        Err(binder_logd::Error::Daemon(_)) => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

#[instrument(skip_all, fields(%org, %repo))]
async fn get_live_logs(
    Extension(ctx): Extension<ApiContext>,
    Path((org, repo)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let name = app_name(&org, &repo);
    let record = ctx.registry.find(&name).await?.ok_or(Error::AppNotFound)?;

    Ok(ws.on_upgrade(move |socket| live_logs_websocket(socket, ctx, record)))
}

async fn live_logs_websocket(mut socket: WebSocket, ctx: ApiContext, record: AppRecord) {
    let mut streamer = AppLogStreamer::new(ctx.broker, ctx.pubsub, record.name());
    if let Some(since) = record.last_build_time {
        streamer = streamer.since(since);
    }

    let mut lines = match streamer.stream().await {
        Ok(lines) => lines,
        Err(err) => {
            error!(%err, "could not open the log stream");
            let _ = socket
                .send(Message::Text("failed to open log stream".to_string()))
                .await;
            let _ = socket.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            line = lines.next() => match line {
                Some(line) => {
                    // Client disconnected?
                    if socket.send(Message::Text(line)).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
        }
    }

    let _ = socket.close().await;
}

#[instrument(skip_all)]
async fn get_apps(Extension(ctx): Extension<ApiContext>) -> Result<Json<Vec<AppRecord>>> {
    Ok(Json(ctx.registry.find_all().await?))
}

#[instrument(skip_all)]
async fn get_services(Extension(ctx): Extension<ApiContext>) -> Result<Json<Vec<String>>> {
    let services = ctx
        .services
        .list()
        .await?
        .iter()
        .map(|service| service.full_name())
        .collect();

    Ok(Json(services))
}

#[instrument(skip_all)]
async fn get_running(
    Extension(ctx): Extension<ApiContext>,
) -> Result<Json<Vec<binder_cluster::RunningApp>>> {
    Ok(Json(ctx.cluster.list_running().await?))
}

/// `{capacity, running}`; the capacity figure is cached since describing
/// every node is expensive.
#[instrument(skip_all)]
async fn get_capacity(Extension(ctx): Extension<ApiContext>) -> Result<Json<Value>> {
    let cached = {
        let mut cache = ctx.capacity.lock().expect("capacity cache lock");
        cache.get("capacity").copied()
    };

    let capacity = match cached {
        Some(capacity) => capacity,
        None => {
            let capacity = ctx.cluster.get_total_capacity().await?;
            let mut cache = ctx.capacity.lock().expect("capacity cache lock");
            cache.insert("capacity", capacity, ctx.capacity_ttl);
            capacity
        }
    };

    let running = ctx.cluster.list_running().await?.len();

    Ok(Json(json!({ "capacity": capacity, "running": running })))
}
