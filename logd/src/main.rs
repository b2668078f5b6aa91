use binder_common::config::Config;
use binder_logd::args::Args;
use binder_logd::kube::KubeProxy;
use binder_logd::reader::LogReader;
use binder_logd::writer::LogWriter;
use binder_logd::{broker, module, Publisher};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    trace!(args = ?args, "parsed args");

    let config = Config::from_env().unwrap_or_else(|err| {
        error!(%err, "invalid configuration");
        std::process::exit(1);
    });

    let broker_listener = TcpListener::bind(args.broker_address).await?;
    let pubsub_listener = TcpListener::bind(args.pubsub_address).await?;

    let publisher = Publisher::default();
    let broker_handle = tokio::spawn(broker::serve(broker_listener));
    let publisher_handle = tokio::spawn(publisher.clone().serve(pubsub_listener));

    let writer = LogWriter::new(config.state.clone(), publisher).await?;
    tokio::spawn(module::serve(args.broker_address, writer));
    tokio::spawn(module::serve(
        args.broker_address,
        LogReader::new(config.state.clone()),
    ));
    if !args.no_kube_proxy {
        tokio::spawn(module::serve(
            args.broker_address,
            KubeProxy::start(args.kube_proxy_port),
        ));
    }

    let _ = tokio::join!(broker_handle, publisher_handle);

    Ok(())
}
