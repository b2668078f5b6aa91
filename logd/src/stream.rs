//! History-then-live log streaming. This is the only way a UI tails an
//! app's logs: subscribe to the live feed first, replay the history from the
//! reader module, then let only genuinely new lines through.

use std::net::SocketAddr;

use binder_common::log::parse_line_timestamp;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use crate::protocol::{self, Frame, ModuleResponse, Published, LOG_READER};
use crate::{Error, Result};

const STREAM_BUFFER: usize = 64;

/// One-shot request against a broker service.
pub async fn broker_request(broker: SocketAddr, service: &str, body: Value) -> Result<Value> {
    let stream = TcpStream::connect(broker).await?;
    let mut framed = Framed::new(stream, LinesCodec::new());

    let frame = Frame::Request {
        service: service.to_string(),
        id: None,
        body,
    };
    framed.send(serde_json::to_string(&frame)?).await?;

    let line = framed.next().await.ok_or(Error::ConnectionClosed)??;
    match serde_json::from_str::<Frame>(&line)? {
        Frame::Reply { body, .. } => Ok(body),
        _ => Err(Error::ConnectionClosed),
    }
}

/// Fetch an app's log history as one newline-joined string.
pub async fn fetch_logs(
    broker: SocketAddr,
    app: &str,
    since: Option<DateTime<Utc>>,
    filtered: bool,
) -> Result<String> {
    let body = broker_request(broker, LOG_READER, protocol::get_request(app, since, filtered)).await?;

    match serde_json::from_value::<ModuleResponse>(body)? {
        ModuleResponse::Success { msg } => Ok(msg),
        ModuleResponse::Error { msg } => Err(Error::Daemon(msg)),
    }
}

pub struct AppLogStreamer {
    broker: SocketAddr,
    pubsub: SocketAddr,
    app: String,
    since: Option<DateTime<Utc>>,
}

impl AppLogStreamer {
    pub fn new(broker: SocketAddr, pubsub: SocketAddr, app: impl Into<String>) -> Self {
        Self {
            broker,
            pubsub,
            app: app.into(),
            since: None,
        }
    }

    /// Restrict the historical portion to lines after the given timestamp,
    /// typically the app's last build time.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Open the stream. The subscription is established before the history
    /// is fetched so no line published in between is lost; every yielded
    /// line past the history has a timestamp strictly greater than the last
    /// historical one.
    pub async fn stream(self) -> Result<ReceiverStream<String>> {
        let subscription = TcpStream::connect(self.pubsub).await?;
        let mut live = Framed::new(subscription, LinesCodec::new());

        // An app that has not logged yet has no file; start live-only
        let history = match fetch_logs(self.broker, &self.app, self.since, false).await {
            Ok(lines) => lines,
            Err(Error::Daemon(msg)) => {
                debug!(app = %self.app, %msg, "no log history");
                String::new()
            }
            Err(err) => return Err(err),
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut last = self.since.unwrap_or(DateTime::<Utc>::MIN_UTC);

            for line in history.lines().filter(|line| !line.is_empty()) {
                if let Some(ts) = parse_line_timestamp(line) {
                    last = last.max(ts);
                }
                if tx.send(line.to_string()).await.is_err() {
                    return;
                }
            }

            while let Some(Ok(line)) = live.next().await {
                let Ok(published) = serde_json::from_str::<Published>(&line) else {
                    continue;
                };
                if published.topic != self.app {
                    continue;
                }
                match parse_line_timestamp(&published.line) {
                    Some(ts) if ts > last => {
                        if tx.send(published.line).await.is_err() {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
