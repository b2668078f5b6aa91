//! Live feed of accepted log lines. Subscribers connect to a second TCP
//! endpoint and receive every published line as newline-delimited JSON,
//! filtering by topic on their side.

use futures::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info};

use crate::protocol::Published;
use crate::Result;

const FEED_DEPTH: usize = 1024;

#[derive(Clone)]
pub struct Publisher {
    feed: broadcast::Sender<Published>,
}

impl Default for Publisher {
    fn default() -> Self {
        let (feed, _) = broadcast::channel(FEED_DEPTH);
        Self { feed }
    }
}

impl Publisher {
    /// Publish one formatted line under a topic. Dropped silently when no
    /// subscriber is connected.
    pub fn publish(&self, topic: &str, line: &str) {
        let _ = self.feed.send(Published {
            topic: topic.to_string(),
            line: line.to_string(),
        });
    }

    /// Subscribe in-process, ahead of any further publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.feed.subscribe()
    }

    /// Accept subscriber connections until the listener is dropped.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(address = %listener.local_addr()?, "publisher listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let mut feed = self.feed.subscribe();

            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LinesCodec::new());

                loop {
                    let published = match feed.recv().await {
                        Ok(published) => published,
                        // Drop what the subscriber missed and keep tailing
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    let Ok(line) = serde_json::to_string(&published) else {
                        continue;
                    };
                    if framed.send(line).await.is_err() {
                        debug!(%peer, "subscriber disconnected");
                        break;
                    }
                }
            });
        }
    }
}
