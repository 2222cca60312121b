//! The local ingestion service.
//!
//! Files created by other processes on this host have no protocol to
//! announce completion, so the closest surrogate is the kernel's
//! close-after-write event. Each `local=true` route's directory is watched
//! with inotify; a `IN_CLOSE_WRITE` on a non-directory becomes a
//! [`WriteNotification`].
//!
//! Local and protocol ingestion are mutually exclusive per user: a
//! close-write during an FTP transfer would fire mid-upload, so a route is
//! either `local` or external, never both.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::StreamExt;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use shuttle_core::{Route, Service, ServiceError, WriteNotification, CHANNEL_CAPACITY};

/// Watches each local user's directory and reports completed writes.
pub struct LocalService {
    base: PathBuf,
    routes: Mutex<Vec<Route>>,
    notifications_tx: Option<mpsc::Sender<WriteNotification>>,
    notifications_rx: Option<mpsc::Receiver<WriteNotification>>,
    generation: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl LocalService {
    pub fn new(base: PathBuf, routes: Vec<Route>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        Self {
            base,
            routes: Mutex::new(routes),
            notifications_tx: Some(tx),
            notifications_rx: Some(rx),
            generation: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    /// Builds a watcher over the given routes and swaps it in as the
    /// current generation. The previous generation is cancelled once the
    /// new one is watching, so pending events from both land in the shared
    /// channel and no window goes unwatched.
    async fn spawn_generation(&self, routes: &[Route]) -> Result<(), ServiceError> {
        let inotify = Inotify::init()?;
        let mut dirs: HashMap<WatchDescriptor, (String, PathBuf)> = HashMap::new();

        for route in routes {
            let dir = route.user_dir(&self.base);
            let wd = inotify
                .watches()
                .add(&dir, WatchMask::CLOSE_WRITE)
                .map_err(|e| {
                    ServiceError::Startup(format!("failed to watch {}: {e}", dir.display()))
                })?;
            debug!(dir = %dir.display(), user = %route.username, "watching directory");
            dirs.insert(wd, (route.username.clone(), dir));
        }

        let stream = inotify
            .into_event_stream(vec![0u8; 4096])
            .map_err(|e| ServiceError::Startup(format!("failed to start event stream: {e}")))?;

        let cancel = CancellationToken::new();
        let tx = self
            .notifications_tx
            .clone()
            .ok_or_else(|| ServiceError::Startup("service already stopped".into()))?;

        self.tracker
            .spawn(watch_loop(stream, dirs, tx, cancel.clone()));

        let previous = {
            let mut generation = self.generation.lock().await;
            generation.replace(cancel)
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        Ok(())
    }
}

#[async_trait]
impl Service for LocalService {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn start(&mut self) -> Result<(), ServiceError> {
        let routes = self.routes.lock().await.clone();
        self.spawn_generation(&routes).await?;
        info!(count = routes.len(), "local watcher started");
        Ok(())
    }

    async fn reload(&self, routes: Vec<Route>) -> Result<(), ServiceError> {
        self.spawn_generation(&routes).await?;
        *self.routes.lock().await = routes;
        info!("local watcher reloaded");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ServiceError> {
        if let Some(generation) = self.generation.lock().await.take() {
            generation.cancel();
        }

        self.tracker.close();
        self.tracker.wait().await;

        // Dropping the last sender closes the channel once the consumer
        // has drained it.
        self.notifications_tx.take();
        Ok(())
    }

    fn take_notifications(&mut self) -> Option<mpsc::Receiver<WriteNotification>> {
        self.notifications_rx.take()
    }
}

async fn watch_loop(
    mut stream: inotify::EventStream<Vec<u8>>,
    dirs: HashMap<WatchDescriptor, (String, PathBuf)>,
    tx: mpsc::Sender<WriteNotification>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => event,
        };

        match event {
            Some(Ok(event)) => {
                if event.mask.contains(EventMask::ISDIR) {
                    continue;
                }
                let Some(name) = event.name else { continue };
                let Some((username, dir)) = dirs.get(&event.wd) else {
                    continue;
                };

                let path = dir.join(name);
                debug!(path = %path.display(), user = %username, "close-write observed");

                let notification = WriteNotification {
                    username: username.clone(),
                    path,
                };
                if tx.send(notification).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "inotify stream error");
            }
            None => break,
        }
    }
}
