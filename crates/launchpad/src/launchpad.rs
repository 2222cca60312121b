//! The launchpad proper: tracked list, queue, and workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use shuttle_core::{Shuttle, CHANNEL_CAPACITY};
use shuttle_transport::{Forwarder, Outcome, TransportError};

use crate::enroute::Enroute;
use crate::{log, LaunchpadError};

/// The transport a worker hands each shuttle to. Abstracted so tests can
/// script outcomes without a network.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn forward(&self, shuttle: &Shuttle) -> Result<Outcome, TransportError>;
}

#[async_trait]
impl Transport for Forwarder {
    async fn forward(&self, shuttle: &Shuttle) -> Result<Outcome, TransportError> {
        Forwarder::forward(self, shuttle).await
    }
}

/// The durable, de-duplicated retry queue.
///
/// All mutations of the tracked list happen under one lock, and the log is
/// rewritten before the lock is released; the queue send happens after, so
/// no lock is ever held while blocked on backpressure. A crash between
/// persist and enqueue is recovered by [`Launchpad::load`].
pub struct Launchpad {
    retry: Duration,
    log_path: PathBuf,
    transport: Arc<dyn Transport>,
    tracked: Mutex<Vec<Shuttle>>,
    queue_tx: mpsc::Sender<Shuttle>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Shuttle>>>,
    enroute: Enroute,
}

impl Launchpad {
    pub fn new(retry: Duration, log_path: PathBuf, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Arc::new(Self {
            retry,
            log_path,
            transport,
            tracked: Mutex::new(Vec::new()),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            enroute: Enroute::new(),
        })
    }

    /// Reads the persistent log and re-enqueues every record through
    /// [`add`](Self::add), benefitting from de-duplication. Returns the
    /// number of records read.
    ///
    /// Call after [`launch_workers`](Self::launch_workers): with no workers
    /// draining, a log larger than the queue capacity would block here.
    pub async fn load(&self) -> Result<usize, LaunchpadError> {
        let shuttles = log::read(&self.log_path)?;
        let count = shuttles.len();

        for shuttle in shuttles {
            self.add(shuttle).await?;
        }

        Ok(count)
    }

    /// Tracks and enqueues a shuttle.
    ///
    /// A shuttle whose path is already tracked is silently dropped. The
    /// tracked list is persisted before the shuttle is enqueued; the
    /// enqueue may block while the queue is full.
    pub async fn add(&self, shuttle: Shuttle) -> Result<(), LaunchpadError> {
        {
            let mut tracked = self.tracked.lock().await;

            if tracked.iter().any(|s| s.path == shuttle.path) {
                debug!(path = %shuttle.path.display(), "shuttle already tracked, dropping duplicate");
                return Ok(());
            }

            tracked.push(shuttle.clone());
            self.persist(&tracked);
        }

        self.queue_tx
            .send(shuttle)
            .await
            .map_err(|_| LaunchpadError::QueueClosed)
    }

    /// Drops a shuttle by path and rewrites the log. Idempotent, and never
    /// blocks on the queue.
    pub async fn remove(&self, path: &Path) {
        let mut tracked = self.tracked.lock().await;

        let before = tracked.len();
        tracked.retain(|s| s.path != path);
        if tracked.len() != before {
            self.persist(&tracked);
        }
    }

    /// The paths currently tracked, in enqueue order.
    pub async fn tracked(&self) -> Vec<PathBuf> {
        self.tracked.lock().await.iter().map(|s| s.path.clone()).collect()
    }

    /// Starts `n` workers draining the queue.
    pub fn launch_workers(self: &Arc<Self>, n: usize) {
        for _ in 0..n {
            let launchpad = self.clone();
            tokio::spawn(async move {
                loop {
                    let shuttle = { launchpad.queue_rx.lock().await.recv().await };
                    let Some(shuttle) = shuttle else { break };
                    launchpad.process(shuttle).await;
                }
            });
        }
    }

    /// Blocks until every in-flight transport attempt has completed.
    /// Shuttles still waiting in the queue stay in the log and resume on
    /// the next start.
    pub async fn wait_enroute(&self) {
        self.enroute.wait().await;
    }

    async fn is_tracked(&self, path: &Path) -> bool {
        self.tracked.lock().await.iter().any(|s| s.path == path)
    }

    /// Rewrites the log under the tracked-list lock. Persistence failures
    /// are logged, not fatal: the in-memory list stays authoritative for
    /// the life of the process.
    fn persist(&self, tracked: &[Shuttle]) {
        if let Err(e) = log::write(&self.log_path, tracked) {
            warn!(path = %self.log_path.display(), error = %e, "failed to write shuttle log");
        }
    }

    /// One dequeued shuttle, start to finish.
    async fn process(&self, shuttle: Shuttle) {
        // Removed between enqueue and dequeue (e.g. an earlier duplicate
        // delivery already completed): skip silently.
        if !self.is_tracked(&shuttle.path).await {
            debug!(path = %shuttle.path.display(), "shuttle no longer tracked, skipping");
            return;
        }

        // Revalidate the payload before spending a transport attempt.
        match tokio::fs::metadata(&shuttle.path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %shuttle.path.display(), "shuttle payload has gone missing, discarding");
                self.remove(&shuttle.path).await;
                return;
            }
            Err(e) => {
                warn!(path = %shuttle.path.display(), error = %e, "failed to stat payload, retrying");
                self.schedule_retry(shuttle);
                return;
            }
        }

        info!(
            path = %shuttle.path.display(),
            endpoint = %shuttle.route.endpoint,
            "shuttle received, transporting to destination"
        );

        // The attempt stays "enroute" until the outcome has been acted on,
        // so wait_enroute never returns with a deletion or rename pending.
        self.enroute.start();
        let outcome = self.transport.forward(&shuttle).await;

        match outcome {
            Ok(Outcome::Delivered) => {
                match tokio::fs::remove_file(&shuttle.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(path = %shuttle.path.display(), "payload already removed");
                    }
                    Err(e) => {
                        warn!(path = %shuttle.path.display(), error = %e, "failed to remove delivered payload");
                    }
                }
                self.remove(&shuttle.path).await;
                info!(path = %shuttle.path.display(), "shuttle arrived at the destination");
            }
            Ok(Outcome::Rejected { status }) => {
                warn!(
                    path = %shuttle.path.display(),
                    status,
                    "endpoint rejected shuttle, moving payload aside"
                );
                if let Some(dest) = shuttle.failed_destination() {
                    if let Err(e) = tokio::fs::rename(&shuttle.path, &dest).await {
                        warn!(path = %shuttle.path.display(), error = %e, "failed to move payload to failed directory");
                    }
                }
                self.remove(&shuttle.path).await;
            }
            Ok(Outcome::Unreachable { reason }) => {
                warn!(
                    path = %shuttle.path.display(),
                    reason,
                    retry_secs = self.retry.as_secs_f64(),
                    "endpoint unreachable, shuttle will retry"
                );
                self.schedule_retry(shuttle);
            }
            Err(TransportError::Io(e)) => {
                // The payload became unreadable between the stat and the
                // encode; same treatment as a missing payload.
                warn!(path = %shuttle.path.display(), error = %e, "payload unreadable, discarding");
                self.remove(&shuttle.path).await;
            }
            Err(e) => {
                warn!(path = %shuttle.path.display(), error = %e, "transport setup failed, retrying");
                self.schedule_retry(shuttle);
            }
        }

        self.enroute.done();
    }

    /// Re-pushes the shuttle after the retry delay. The shuttle stays in
    /// the tracked list and the log for the whole wait.
    fn schedule_retry(&self, shuttle: Shuttle) {
        let queue_tx = self.queue_tx.clone();
        let retry = self.retry;

        tokio::spawn(async move {
            tokio::time::sleep(retry).await;
            let _ = queue_tx.send(shuttle).await;
        });
    }
}
