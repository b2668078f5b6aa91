use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Address to bind the request/reply broker to
    #[clap(long, default_value = "127.0.0.1:9091")]
    pub broker_address: SocketAddr,
    /// Address to bind the live log feed to
    #[clap(long, default_value = "127.0.0.1:9090")]
    pub pubsub_address: SocketAddr,
    /// Local port for the orchestrator API proxy
    #[clap(long, default_value_t = 8001)]
    pub kube_proxy_port: u16,
    /// Skip starting the orchestrator API proxy module
    #[clap(long, default_value_t = false)]
    pub no_kube_proxy: bool,
}
