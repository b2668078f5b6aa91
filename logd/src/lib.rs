pub mod args;
pub mod broker;
pub mod client;
pub mod kube;
pub mod module;
pub mod protocol;
pub mod publisher;
pub mod reader;
pub mod stream;
pub mod writer;

pub use client::LogClient;
pub use module::DaemonModule;
pub use publisher::Publisher;
pub use stream::AppLogStreamer;

/// A wrapper to capture any error possible with this service
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] tokio_util::codec::LinesCodecError),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("the peer closed the connection")]
    ConnectionClosed,
    #[error("daemon replied with an error: {0}")]
    Daemon(String),
}

pub type Result<T> = std::result::Result<T, Error>;
