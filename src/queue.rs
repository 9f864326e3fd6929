//! Bounded issuance queue with a single worker.
//!
//! Submitting never waits: a full queue is reported to the caller, who has to come back later.
//! The single worker is what limits the load put on the CA and the DNS provider.

use crate::error::{JobError, JobResult};
use crate::webhook::WebhookOverride;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CAPACITY: usize = 5;

/// One issuance request, owned by the queue until the worker picks it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub timestamp: i64,
    pub email: String,
    pub main: String,
    /// Deduplicated, in request order.
    pub domains: Vec<String>,
    pub webhook: Option<WebhookOverride>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> JobResult<()>;
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
}

#[derive(Debug)]
pub struct JobReceiver {
    receiver: mpsc::Receiver<Job>,
}

impl JobQueue {
    /// # Panics
    ///
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, JobReceiver { receiver })
    }

    /// Queues `job` without waiting. Returns `false` if the queue is full or no longer accepts work.
    pub fn enqueue(&self, job: Job) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                debug!("Job queue is full, rejecting job for {}", job.main);
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!("Job queue is shut down, rejecting job for {}", job.main);
                false
            }
        }
    }
}

impl JobReceiver {
    /// Takes the next queued job without waiting, if there is one.
    pub fn try_recv(&mut self) -> Option<Job> {
        self.receiver.try_recv().ok()
    }
}

/// Runs jobs one at a time in arrival order until `shutdown` fires. Jobs already queued by then
/// still run; new ones are refused.
pub fn spawn_worker(
    mut jobs: JobReceiver,
    handler: Arc<dyn JobHandler>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut draining = false;
        loop {
            let job = tokio::select! {
                job = jobs.receiver.recv() => job,
                () = shutdown.cancelled(), if !draining => {
                    info!("Job queue closed, finishing queued jobs");
                    jobs.receiver.close();
                    draining = true;
                    continue;
                }
            };
            let Some(job) = job else {
                break;
            };
            let main = job.main.clone();
            match handler.handle(job).await {
                Ok(()) => debug!("Job for {main} finished"),
                Err(err @ JobError::Notification(_)) => warn!("Job for {main}: {err}"),
                Err(err) => error!("Job for {main} failed: {err}"),
            }
        }
        debug!("Job worker stopped");
    })
}
