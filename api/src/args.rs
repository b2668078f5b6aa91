use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Address to bind the HTTP API to
    #[clap(long, default_value = "0.0.0.0:8080")]
    pub api_address: SocketAddr,
    /// Capacity of the build queue; submissions beyond it fail fast
    #[clap(long, default_value_t = 50)]
    pub queue_capacity: usize,
    /// Number of concurrent builder workers
    #[clap(long, default_value_t = 10)]
    pub builder_workers: usize,
    /// Send `Access-Control-Allow-Origin: *` on every response
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub allow_origin: bool,
    /// Preload freshly built images onto every node
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub preload: bool,
    /// Rebuild the shared base image as part of every app build
    #[clap(long, default_value_t = false)]
    pub build_base: bool,
    /// Minutes between idle-app reaper runs
    #[clap(long, default_value_t = 5)]
    pub cron_period_minutes: u64,
    /// Routes inactive for longer than this many minutes are reaped
    #[clap(long)]
    pub inactive_threshold_minutes: i64,
    /// Seconds the cluster capacity figure is cached for
    #[clap(long, default_value_t = 3600)]
    pub capacity_poll_period_seconds: u64,
    /// Address of the log daemon's request/reply broker
    #[clap(long, default_value = "127.0.0.1:9091")]
    pub broker_address: SocketAddr,
    /// Address of the log daemon's live feed
    #[clap(long, default_value = "127.0.0.1:9090")]
    pub pubsub_address: SocketAddr,
    /// Command used to start the log daemon
    #[clap(long, default_value = "binder-logd")]
    pub logd_command: String,
    /// Mirror last-build times into a SQLite index
    #[clap(long, default_value_t = false)]
    pub time_index: bool,
    /// Bring the cluster up before serving (operator one-shot)
    #[clap(long, default_value_t = false)]
    pub start_cluster: bool,
    /// Number of worker nodes when bringing the cluster up
    #[clap(long, default_value_t = 3)]
    pub num_nodes: u32,
    /// Seconds to wait for in-flight builds on shutdown
    #[clap(long, default_value_t = 30)]
    pub shutdown_grace_seconds: u64,
}
