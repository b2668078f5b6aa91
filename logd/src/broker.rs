//! Request/reply broker at the centre of the daemon. Workers connect and
//! announce a service tag; clients connect and address requests to a tag.
//! Each worker is handed one request at a time, with further requests for
//! the same service queueing in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

use crate::protocol::{Frame, ModuleResponse};
use crate::{Error, Result};

const SERVICE_QUEUE_DEPTH: usize = 64;

struct Job {
    body: Value,
    reply: oneshot::Sender<Value>,
}

type ServiceMap = Arc<Mutex<HashMap<String, mpsc::Sender<Job>>>>;

/// Accept broker connections until the listener is dropped.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let services: ServiceMap = Default::default();

    info!(address = %listener.local_addr()?, "broker listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let services = Arc::clone(&services);

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, services).await {
                debug!(%peer, %err, "broker connection ended");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, services: ServiceMap) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new());

    let first = match framed.next().await {
        Some(line) => serde_json::from_str::<Frame>(&line?)?,
        None => return Ok(()),
    };

    match first {
        Frame::Ready { service } => {
            let (tx, rx) = mpsc::channel(SERVICE_QUEUE_DEPTH);
            services.lock().await.insert(service.clone(), tx);
            info!(%service, "worker registered");

            let result = worker_loop(&mut framed, rx, &service).await;

            services.lock().await.remove(&service);
            warn!(%service, "worker gone");
            result
        }
        frame @ Frame::Request { .. } => client_loop(framed, frame, services).await,
        Frame::Reply { .. } => {
            warn!("dropping reply frame from an unregistered connection");
            Ok(())
        }
    }
}

async fn worker_loop(
    framed: &mut Framed<TcpStream, LinesCodec>,
    mut jobs: mpsc::Receiver<Job>,
    service: &str,
) -> Result<()> {
    let mut next_id = 0_u64;

    while let Some(job) = jobs.recv().await {
        next_id += 1;
        let request = Frame::Request {
            service: service.to_string(),
            id: Some(next_id),
            body: job.body,
        };
        framed.send(serde_json::to_string(&request)?).await?;

        loop {
            let line = framed.next().await.ok_or(Error::ConnectionClosed)??;
            match serde_json::from_str::<Frame>(&line)? {
                Frame::Reply { id: Some(id), body } if id == next_id => {
                    // The requester may have given up waiting
                    let _ = job.reply.send(body);
                    break;
                }
                frame => warn!(%service, ?frame, "unexpected frame from worker"),
            }
        }
    }

    Ok(())
}

async fn client_loop(
    mut framed: Framed<TcpStream, LinesCodec>,
    first: Frame,
    services: ServiceMap,
) -> Result<()> {
    let mut pending = Some(first);

    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => match framed.next().await {
                Some(line) => serde_json::from_str::<Frame>(&line?)?,
                None => return Ok(()),
            },
        };

        let Frame::Request { service, body, .. } = frame else {
            warn!(?frame, "client sent a non-request frame");
            continue;
        };

        let body = dispatch(&services, &service, body).await;
        framed
            .send(serde_json::to_string(&Frame::Reply { id: None, body })?)
            .await?;
    }
}

async fn dispatch(services: &ServiceMap, service: &str, body: Value) -> Value {
    let worker = services.lock().await.get(service).cloned();

    let response = match worker {
        None => ModuleResponse::error(format!("no worker registered for {service}")),
        Some(tx) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Job { body, reply: reply_tx }).await.is_err() {
                ModuleResponse::error(format!("worker for {service} is gone"))
            } else {
                match reply_rx.await {
                    Ok(value) => return value,
                    Err(_) => ModuleResponse::error(format!("worker for {service} dropped the request")),
                }
            }
        }
    };

    serde_json::to_value(response).unwrap_or_else(|err| {
        error!(%err, "failed to serialize broker response");
        Value::Null
    })
}
