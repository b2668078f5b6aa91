//! Worker side of the broker protocol. A [`DaemonModule`] only implements
//! request handling; the surrounding loop owns the connection, re-registers
//! after broker restarts and guarantees the one-request-at-a-time contract.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{info, warn};

use crate::protocol::{Frame, ModuleResponse};
use crate::{Error, Result};

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[async_trait]
pub trait DaemonModule: Send {
    /// Service tag the module registers under.
    fn tag(&self) -> &'static str;

    /// Handle a single request body. Modules never see a second request
    /// before replying to the first.
    async fn handle(&mut self, body: Value) -> ModuleResponse;
}

/// Run a module against the broker, reconnecting forever.
pub async fn serve(broker: SocketAddr, mut module: impl DaemonModule) {
    loop {
        match connect_and_serve(broker, &mut module).await {
            Ok(()) => info!(service = module.tag(), "broker closed the connection"),
            Err(err) => warn!(service = module.tag(), %err, "worker connection failed"),
        }
        sleep(RECONNECT_PAUSE).await;
    }
}

async fn connect_and_serve(broker: SocketAddr, module: &mut impl DaemonModule) -> Result<()> {
    let stream = TcpStream::connect(broker).await?;
    let mut framed = Framed::new(stream, LinesCodec::new());

    let ready = Frame::Ready {
        service: module.tag().to_string(),
    };
    framed.send(serde_json::to_string(&ready)?).await?;
    info!(service = module.tag(), "registered with broker");

    loop {
        let line = framed.next().await.ok_or(Error::ConnectionClosed)??;
        let Frame::Request { id, body, .. } = serde_json::from_str::<Frame>(&line)? else {
            warn!(service = module.tag(), "broker sent a non-request frame");
            continue;
        };

        let response = module.handle(body).await;
        let reply = Frame::Reply {
            id,
            body: serde_json::to_value(response)?,
        };
        framed.send(serde_json::to_string(&reply)?).await?;
    }
}
