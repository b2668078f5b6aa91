use std::sync::Arc;
use std::time::Duration;

use binder_api::args::Args;
use binder_api::build::{BuildContext, BuildManager, BuildOptions};
use binder_api::handlers::{self, ApiContext};
use binder_api::persistence::{
    AppRegistry, FileRegistry, FileServiceRegistry, ServiceRegistry, TimeIndex,
};
use binder_api::supervisor::{self, Supervisor};
use binder_cluster::{ClusterController, KubeController};
use binder_common::config::Config;
use binder_logd::LogClient;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{error, info, trace, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    trace!(args = ?args, "parsed args");
    info!(version = binder_api::VERSION, "starting binder api");

    let config = Config::from_env().unwrap_or_else(|err| {
        error!(%err, "invalid configuration");
        std::process::exit(1);
    });

    let mut supervisor = Supervisor::new();
    if let Err(err) = supervisor
        .start_log_daemon(&args.logd_command, args.broker_address, args.pubsub_address)
        .await
    {
        error!(%err, "could not start the log daemon");
        std::process::exit(1);
    }
    let log = LogClient::connect(args.broker_address);

    let time_index = if args.time_index {
        match TimeIndex::new(&config.state.root().join("build_times.sqlite")).await {
            Ok(index) => Some(index),
            Err(err) => {
                // The index is only a cache; run without it
                warn!(%err, "could not open the time index");
                None
            }
        }
    } else {
        None
    };

    let registry: Arc<dyn AppRegistry> = Arc::new(
        FileRegistry::new(config.state.clone(), time_index)
            .await
            .unwrap_or_else(|err| {
                error!(%err, "could not open the app registry");
                std::process::exit(1);
            }),
    );
    let services: Arc<dyn ServiceRegistry> =
        Arc::new(FileServiceRegistry::new(config.state.clone()));

    let kube = KubeController::new(config.clone());
    if args.start_cluster {
        if let Err(err) = kube.start(args.num_nodes).await {
            error!(%err, "cluster bring-up failed");
            std::process::exit(1);
        }
    }
    let cluster: Arc<dyn ClusterController> = Arc::new(kube);

    if args.start_cluster {
        if let Err(err) = binder_api::preload::preload_all_apps(&registry, &cluster).await {
            warn!(%err, "could not preload existing app images");
        }
    }

    let builds = BuildManager::new(
        BuildContext {
            config: config.clone(),
            registry: Arc::clone(&registry),
            services: Arc::clone(&services),
            cluster: Arc::clone(&cluster),
            log: log.clone(),
            options: BuildOptions {
                preload: args.preload,
                build_base: args.build_base,
            },
        },
        args.queue_capacity,
        args.builder_workers,
    );

    supervisor.install_reaper(
        Arc::clone(&cluster),
        Duration::from_secs(args.cron_period_minutes * 60),
        chrono::Duration::minutes(args.inactive_threshold_minutes),
    );

    let ctx = ApiContext {
        config,
        registry,
        services,
        cluster,
        builds: builds.clone(),
        broker: args.broker_address,
        pubsub: args.pubsub_address,
        capacity_ttl: Duration::from_secs(args.capacity_poll_period_seconds),
        capacity: ApiContext::capacity_cache(),
        shutdown: supervisor.cancel_token(),
    };
    let router = handlers::make_router(ctx, args.allow_origin);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = axum::Server::bind(&args.api_address)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = stop_rx.await;
        });

    info!(address = %args.api_address, "listening");
    let server_handle = tokio::spawn(server);

    supervisor::wait_for_signal().await;
    supervisor
        .shutdown(
            &builds,
            &log,
            Duration::from_secs(args.shutdown_grace_seconds),
        )
        .await;

    let _ = stop_tx.send(());
    match server_handle.await {
        Ok(Ok(())) => info!("api stopped"),
        Ok(Err(err)) => error!(%err, "server error"),
        Err(err) => error!(%err, "server task panicked"),
    }
}
