//! FTP service lifecycle and listener supervision.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use shuttle_core::{tls, Route, Service, ServiceError, WriteNotification, CHANNEL_CAPACITY};

use crate::session::Session;
use crate::RESTART_DELAY_SECS;

/// Settings for the FTP service.
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding one chroot per user.
    pub base: PathBuf,
    /// TLS certificate chain, PEM.
    pub certificate_pem: String,
    /// TLS private key, PEM.
    pub key_pem: String,
}

/// The FTP(S) ingestion service.
pub struct FtpService {
    config: FtpConfig,
    routes: Arc<RwLock<Vec<Route>>>,
    tls: Arc<rustls::ServerConfig>,
    notifications_tx: Option<mpsc::Sender<WriteNotification>>,
    notifications_rx: Option<mpsc::Receiver<WriteNotification>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl FtpService {
    pub fn new(config: FtpConfig, routes: Vec<Route>) -> Result<Self, ServiceError> {
        let tls = tls::server_config(&config.certificate_pem, &config.key_pem, &[b"ftp"])
            .map_err(|e| ServiceError::Startup(format!("FTP TLS configuration: {e}")))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        Ok(Self {
            config,
            routes: Arc::new(RwLock::new(routes)),
            tls,
            notifications_tx: Some(tx),
            notifications_rx: Some(rx),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: Arc::new(Mutex::new(None)),
        })
    }

    /// The address the listener is bound to. Only available once the
    /// supervisor has bound the socket (port 0 requests an OS-assigned
    /// port).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// The listener loop with its 5-second restart supervision: a failed
    /// bind or a failed accept logs, sleeps, and starts over; only a stop
    /// request ends it.
    async fn supervise(
        config: FtpConfig,
        routes: Arc<RwLock<Vec<Route>>>,
        tls: Arc<rustls::ServerConfig>,
        notifications_tx: mpsc::Sender<WriteNotification>,
        cancel: CancellationToken,
        tracker: TaskTracker,
        local_addr: Arc<Mutex<Option<SocketAddr>>>,
    ) {
        let addr = format!("{}:{}", config.host, config.port);

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!(addr = %addr, error = %e, "FTP listener failed, restarting after 5 seconds");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(RESTART_DELAY_SECS)) => continue,
                    }
                }
            };

            if let Ok(bound) = listener.local_addr() {
                *local_addr.lock().await = Some(bound);
            }
            info!(addr = %addr, "FTP service listening");

            let crashed = Self::accept_loop(
                &listener,
                &config,
                &routes,
                &tls,
                &notifications_tx,
                &cancel,
                &tracker,
            )
            .await;

            if !crashed {
                return;
            }

            drop(listener);
            error!("FTP server crashed, restarting after 5 seconds");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(RESTART_DELAY_SECS)) => {}
            }
        }
    }

    /// Returns `true` if the loop ended on an accept error (restart wanted),
    /// `false` on cancellation.
    async fn accept_loop(
        listener: &TcpListener,
        config: &FtpConfig,
        routes: &Arc<RwLock<Vec<Route>>>,
        tls: &Arc<rustls::ServerConfig>,
        notifications_tx: &mpsc::Sender<WriteNotification>,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) -> bool {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return false,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "FTP connection accepted");
                    let session = Session::new(
                        stream,
                        peer,
                        config.base.clone(),
                        routes.clone(),
                        tls.clone(),
                        notifications_tx.clone(),
                        cancel.clone(),
                    );
                    tracker.spawn(async move {
                        if let Err(e) = session.run().await {
                            warn!(%peer, error = %e, "FTP session ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "FTP accept failed");
                    return true;
                }
            }
        }
    }
}

#[async_trait]
impl Service for FtpService {
    fn name(&self) -> &'static str {
        "ftp"
    }

    async fn start(&mut self) -> Result<(), ServiceError> {
        let notifications_tx = self
            .notifications_tx
            .clone()
            .ok_or_else(|| ServiceError::Startup("service already stopped".into()))?;

        tokio::spawn(Self::supervise(
            self.config.clone(),
            self.routes.clone(),
            self.tls.clone(),
            notifications_tx,
            self.cancel.clone(),
            self.tracker.clone(),
            self.local_addr.clone(),
        ));

        Ok(())
    }

    async fn reload(&self, routes: Vec<Route>) -> Result<(), ServiceError> {
        // Held only for the swap; sessions keep the credentials they
        // authenticated with.
        *self.routes.write().await = routes;
        info!("FTP routes reloaded");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ServiceError> {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.notifications_tx.take();
        Ok(())
    }

    fn take_notifications(&mut self) -> Option<mpsc::Receiver<WriteNotification>> {
        self.notifications_rx.take()
    }
}
