//! SSH server lifecycle: accept loop, handshake watchdog, fan-in.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use shuttle_core::{
    authenticate, Route, Service, ServiceError, WriteNotification, CHANNEL_CAPACITY,
};

use crate::engine::SftpEngine;
use crate::{load_host_key, WrittenFile};

/// The SSH handshake gets this long before the connection is cut.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for the SFTP service.
#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding one chroot per user.
    pub base: PathBuf,
    /// SSH host key, PEM.
    pub host_key_pem: String,
}

/// The SSH + SFTP ingestion service.
pub struct SftpService {
    config: SftpConfig,
    routes: Arc<RwLock<Vec<Route>>>,
    ssh_config: Arc<russh::server::Config>,
    incoming_tx: Option<mpsc::Sender<WrittenFile>>,
    incoming_rx: Option<mpsc::Receiver<WrittenFile>>,
    notifications_tx: Option<mpsc::Sender<WriteNotification>>,
    notifications_rx: Option<mpsc::Receiver<WriteNotification>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    fan_in: Option<JoinHandle<()>>,
    engines: Arc<RwLock<HashMap<u64, CancellationToken>>>,
    engine_ids: Arc<AtomicU64>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl SftpService {
    pub fn new(config: SftpConfig, routes: Vec<Route>) -> Result<Self, ServiceError> {
        let key = load_host_key(&config.host_key_pem)
            .map_err(|e| ServiceError::Startup(e.to_string()))?;

        let ssh_config = Arc::new(russh::server::Config {
            methods: russh::MethodSet::PASSWORD,
            keys: vec![key],
            auth_rejection_time: Duration::from_secs(1),
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (notifications_tx, notifications_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Ok(Self {
            config,
            routes: Arc::new(RwLock::new(routes)),
            ssh_config,
            incoming_tx: Some(incoming_tx),
            incoming_rx: Some(incoming_rx),
            notifications_tx: Some(notifications_tx),
            notifications_rx: Some(notifications_rx),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            fan_in: None,
            engines: Arc::new(RwLock::new(HashMap::new())),
            engine_ids: Arc::new(AtomicU64::new(0)),
            local_addr: Arc::new(Mutex::new(None)),
        })
    }

    /// The address the listener is bound to, once bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    async fn accept_loop(
        listener: TcpListener,
        ssh_config: Arc<russh::server::Config>,
        session_template: SessionTemplate,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "failed to accept incoming SSH connection");
                    continue;
                }
            };

            debug!(%peer, "SSH connection accepted");
            let handler = session_template.instantiate();
            let opened = handler.opened.clone();
            let ssh_config = ssh_config.clone();
            let cancel = cancel.clone();

            tracker.spawn(async move {
                let session = match russh::server::run_stream(ssh_config, stream, handler).await {
                    Ok(session) => session,
                    Err(e) => {
                        warn!(%peer, error = %e, "SSH session setup failed");
                        return;
                    }
                };

                // Handshake watchdog: if no session channel opens in time,
                // the connection is cut.
                let handle = session.handle();
                tokio::spawn(async move {
                    tokio::time::sleep(HANDSHAKE_TIMEOUT).await;
                    if !opened.load(Ordering::SeqCst) {
                        warn!(%peer, "SSH handshake took too long, closing");
                        let _ = handle
                            .disconnect(
                                russh::Disconnect::ByApplication,
                                "handshake timeout".into(),
                                "en".into(),
                            )
                            .await;
                    }
                });

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%peer, "closing SSH session for shutdown");
                    }
                    result = session => {
                        if let Err(e) = result {
                            debug!(%peer, error = %e, "SSH session ended");
                        }
                    }
                }
            });
        }
    }
}

#[async_trait]
impl Service for SftpService {
    fn name(&self) -> &'static str {
        "sftp"
    }

    async fn start(&mut self) -> Result<(), ServiceError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        if let Ok(bound) = listener.local_addr() {
            *self.local_addr.lock().await = Some(bound);
        }
        info!(addr = %addr, "SFTP service listening");

        let incoming_tx = self
            .incoming_tx
            .clone()
            .ok_or_else(|| ServiceError::Startup("service already stopped".into()))?;
        let template = SessionTemplate {
            base: self.config.base.clone(),
            routes: self.routes.clone(),
            incoming: incoming_tx,
            engines: self.engines.clone(),
            engine_ids: self.engine_ids.clone(),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        };

        tokio::spawn(Self::accept_loop(
            listener,
            self.ssh_config.clone(),
            template,
            self.cancel.clone(),
            self.tracker.clone(),
        ));

        // Fan-in: engine write reports become shared write notifications.
        let mut incoming_rx = self
            .incoming_rx
            .take()
            .ok_or_else(|| ServiceError::Startup("service already started".into()))?;
        let notifications_tx = self
            .notifications_tx
            .clone()
            .ok_or_else(|| ServiceError::Startup("service already stopped".into()))?;
        self.fan_in = Some(tokio::spawn(async move {
            while let Some(written) = incoming_rx.recv().await {
                let notification = WriteNotification {
                    username: written.username,
                    path: written.path,
                };
                if notifications_tx.send(notification).await.is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    async fn reload(&self, routes: Vec<Route>) -> Result<(), ServiceError> {
        *self.routes.write().await = routes;
        info!("SFTP routes reloaded");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ServiceError> {
        // Ends the accept loop (closing the listener), the open sessions,
        // and through the child tokens every running engine.
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.engines.write().await.clear();

        // With every engine gone, dropping our sender lets the fan-in task
        // drain the incoming channel and finish.
        self.incoming_tx.take();
        if let Some(fan_in) = self.fan_in.take() {
            let _ = fan_in.await;
        }

        self.notifications_tx.take();
        Ok(())
    }

    fn take_notifications(&mut self) -> Option<mpsc::Receiver<WriteNotification>> {
        self.notifications_rx.take()
    }
}

/// Everything a new connection's handler needs.
#[derive(Clone)]
struct SessionTemplate {
    base: PathBuf,
    routes: Arc<RwLock<Vec<Route>>>,
    incoming: mpsc::Sender<WrittenFile>,
    engines: Arc<RwLock<HashMap<u64, CancellationToken>>>,
    engine_ids: Arc<AtomicU64>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SessionTemplate {
    fn instantiate(&self) -> SshSession {
        SshSession {
            base: self.base.clone(),
            routes: self.routes.clone(),
            incoming: self.incoming.clone(),
            engines: self.engines.clone(),
            engine_ids: self.engine_ids.clone(),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
            opened: Arc::new(AtomicBool::new(false)),
            username: None,
            channels: HashMap::new(),
        }
    }
}

/// Per-connection SSH handler: password auth against the route table, one
/// SFTP engine per `sftp` subsystem request.
struct SshSession {
    base: PathBuf,
    routes: Arc<RwLock<Vec<Route>>>,
    incoming: mpsc::Sender<WrittenFile>,
    engines: Arc<RwLock<HashMap<u64, CancellationToken>>>,
    engine_ids: Arc<AtomicU64>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    opened: Arc<AtomicBool>,
    username: Option<String>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

#[async_trait]
impl russh::server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let accepted = {
            let routes = self.routes.read().await;
            authenticate(&routes, user, password).is_some()
        };

        if accepted {
            info!(user, "SFTP login");
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            warn!(user, "SFTP login rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.opened.store(true, Ordering::SeqCst);
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            debug!(name, "rejecting unsupported subsystem");
            session.channel_failure(channel_id);
            return Ok(());
        }

        let (Some(channel), Some(username)) =
            (self.channels.remove(&channel_id), self.username.clone())
        else {
            session.channel_failure(channel_id);
            return Ok(());
        };

        session.channel_success(channel_id);

        let chroot = self.base.join(&username);
        let engine_cancel = self.cancel.child_token();
        let engine_id = self.engine_ids.fetch_add(1, Ordering::SeqCst);
        self.engines
            .write()
            .await
            .insert(engine_id, engine_cancel.clone());

        let engine = SftpEngine::new(chroot, username, self.incoming.clone(), engine_cancel);
        let engines = self.engines.clone();
        self.tracker.spawn(async move {
            if let Err(e) = engine.run(channel.into_stream()).await {
                debug!(error = %e, "SFTP engine ended with error");
            }
            engines.write().await.remove(&engine_id);
        });

        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_failure(channel_id);
        Ok(())
    }
}
