//! In-process log client. Level-tagged calls enqueue records onto a local
//! queue; a background task drains the queue into a request/reply connection
//! to the broker, retrying silently on transport failures so callers never
//! block on the log plane.

use std::net::SocketAddr;
use std::time::Duration;

use binder_common::log::{Level, LogRecord};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use crate::protocol::{self, Frame, LOG_WRITER};
use crate::{Error, Result};

const RETRY_PAUSE: Duration = Duration::from_millis(500);
const SEND_ATTEMPTS: usize = 5;

enum ClientMessage {
    Record(LogRecord),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct LogClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl LogClient {
    /// Start the background sender. Records enqueued before the broker is
    /// reachable are held and delivered once it is.
    pub fn connect(broker: SocketAddr) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(broker, rx));

        Self { tx }
    }

    pub fn record(&self, record: LogRecord) {
        let _ = self.tx.send(ClientMessage::Record(record));
    }

    pub fn debug(&self, tag: &str, msg: impl Into<String>, app: Option<&str>) {
        self.log(Level::Debug, tag, msg.into(), app);
    }

    pub fn info(&self, tag: &str, msg: impl Into<String>, app: Option<&str>) {
        self.log(Level::Info, tag, msg.into(), app);
    }

    pub fn warn(&self, tag: &str, msg: impl Into<String>, app: Option<&str>) {
        self.log(Level::Warning, tag, msg.into(), app);
    }

    pub fn error(&self, tag: &str, msg: impl Into<String>, app: Option<&str>) {
        self.log(Level::Error, tag, msg.into(), app);
    }

    fn log(&self, level: Level, tag: &str, msg: String, app: Option<&str>) {
        let mut record = LogRecord::new(level, tag, msg);
        if let Some(app) = app {
            record = record.for_app(app);
        }
        self.record(record);
    }

    /// Forward every line read from a subprocess stream as a record at the
    /// given level.
    pub fn write_stream<R>(
        &self,
        tag: &str,
        level: Level,
        stream: R,
        app: Option<String>,
        file_only: bool,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let client = self.clone();
        let tag = tag.to_string();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut record = LogRecord::new(level, &tag, line);
                record.app = app.clone();
                record.no_publish = file_only;
                client.record(record);
            }
        })
    }

    /// Wait until every record enqueued so far has been handed to the
    /// broker (or given up on). Called once on shutdown.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(ClientMessage::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn drain(broker: SocketAddr, mut rx: mpsc::UnboundedReceiver<ClientMessage>) {
    let mut conn: Option<Framed<TcpStream, LinesCodec>> = None;

    while let Some(message) = rx.recv().await {
        match message {
            // Messages are processed in order, so reaching the marker means
            // everything enqueued before it has been sent
            ClientMessage::Flush(ack) => {
                let _ = ack.send(());
            }
            ClientMessage::Record(record) => {
                let body = protocol::log_request(&record);

                for attempt in 0..SEND_ATTEMPTS {
                    if conn.is_none() {
                        conn = Framed::new(
                            match TcpStream::connect(broker).await {
                                Ok(stream) => stream,
                                Err(err) => {
                                    debug!(%err, "log broker unreachable");
                                    sleep(RETRY_PAUSE).await;
                                    continue;
                                }
                            },
                            LinesCodec::new(),
                        )
                        .into();
                    }

                    let Some(framed) = conn.as_mut() else {
                        continue;
                    };
                    match request(framed, &body).await {
                        Ok(_) => break,
                        Err(err) => {
                            debug!(%err, attempt, "log record send failed");
                            conn = None;
                            sleep(RETRY_PAUSE).await;
                        }
                    }
                }
            }
        }
    }
}

async fn request(framed: &mut Framed<TcpStream, LinesCodec>, body: &Value) -> Result<Value> {
    let frame = Frame::Request {
        service: LOG_WRITER.to_string(),
        id: None,
        body: body.clone(),
    };
    framed.send(serde_json::to_string(&frame)?).await?;

    let line = framed.next().await.ok_or(Error::ConnectionClosed)??;
    match serde_json::from_str::<Frame>(&line)? {
        Frame::Reply { body, .. } => Ok(body),
        _ => Err(Error::ConnectionClosed),
    }
}
