//! The build pipeline: a bounded queue fed by the HTTP layer and drained
//! into a fixed pool of worker slots. The queue is the only structure shared
//! between the API and the workers.

pub mod containerfile;
pub mod job;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use binder_cluster::ClusterController;
use binder_common::app::AppSpec;
use binder_common::config::Config;
use binder_logd::LogClient;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{info, warn};

use crate::persistence::{AppRegistry, ServiceRegistry};

/// Options applied to every build job.
#[derive(Clone, Copy, Debug)]
pub struct BuildOptions {
    /// Pull the freshly built app image onto every node after the push.
    pub preload: bool,
    /// Rebuild and push the shared base image first.
    pub build_base: bool,
}

/// Everything a build job needs, handed to the worker pool once at startup.
pub struct BuildContext {
    pub config: Config,
    pub registry: Arc<dyn AppRegistry>,
    pub services: Arc<dyn ServiceRegistry>,
    pub cluster: Arc<dyn ClusterController>,
    pub log: LogClient,
    pub options: BuildOptions,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SubmitError {
    #[error("build queue full")]
    QueueFull,
    #[error("builder is shutting down")]
    Closed,
}

#[derive(Clone)]
pub struct BuildManager {
    queue: mpsc::Sender<AppSpec>,
    active: Arc<ActiveJobs>,
}

impl BuildManager {
    /// Start the dispatcher. A queued spec is only taken off the queue once
    /// a worker slot is free for it.
    pub fn new(ctx: BuildContext, queue_capacity: usize, workers: usize) -> Self {
        let (queue, rx) = mpsc::channel(queue_capacity.max(1));
        let active = Arc::new(ActiveJobs::default());

        tokio::spawn(dispatch(rx, Arc::new(ctx), workers, Arc::clone(&active)));

        Self { queue, active }
    }

    /// Non-blocking admission; the HTTP layer fails fast on a full queue.
    pub fn try_submit(&self, spec: AppSpec) -> Result<(), SubmitError> {
        self.queue.try_send(spec).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Wait for in-flight jobs to finish, up to the grace period. Queued
    /// jobs that never started are abandoned.
    pub async fn drain(&self, grace: Duration) {
        if tokio::time::timeout(grace, self.active.wait_idle())
            .await
            .is_err()
        {
            warn!("builder workers still busy after the grace period");
        }
    }
}

#[derive(Default)]
struct ActiveJobs {
    count: AtomicUsize,
    idle: Notify,
}

impl ActiveJobs {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<AppSpec>,
    ctx: Arc<BuildContext>,
    workers: usize,
    active: Arc<ActiveJobs>,
) {
    info!(workers, "builder dispatcher started");
    let slots = Arc::new(Semaphore::new(workers));

    loop {
        let permit = Arc::clone(&slots)
            .acquire_owned()
            .await
            .expect("the worker semaphore is never closed");

        let Some(spec) = rx.recv().await else {
            break;
        };

        active.start();
        let ctx = Arc::clone(&ctx);
        let active = Arc::clone(&active);
        tokio::spawn(async move {
            job::run(ctx, spec).await;
            drop(permit);
            active.finish();
        });
    }
}
