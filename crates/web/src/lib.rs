//! HTTPS web-form upload portal.
//!
//! A browser-facing face for the same chroots the protocol servers use:
//! basic-auth listing, download, and upload. Uploads feed the shared
//! write-notification channel exactly like an FTP or SFTP close-write.

mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperServerBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use shuttle_core::{tls, Route, Service, ServiceError, WriteNotification, CHANNEL_CAPACITY};

use handlers::{redirect_router, router, AppState};

/// Settings for the web service.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    pub insecure_port: u16,
    /// Serve the app over plain HTTP instead of redirecting to TLS.
    pub allow_insecure: bool,
    /// Directory holding one chroot per user.
    pub base: PathBuf,
    /// TLS certificate chain, PEM.
    pub certificate_pem: String,
    /// TLS private key, PEM.
    pub key_pem: String,
}

/// The web upload portal.
pub struct WebService {
    config: WebConfig,
    routes: Arc<RwLock<Vec<Route>>>,
    tls: Arc<rustls::ServerConfig>,
    notifications_tx: Option<mpsc::Sender<WriteNotification>>,
    notifications_rx: Option<mpsc::Receiver<WriteNotification>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    local_insecure_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl WebService {
    pub fn new(config: WebConfig, routes: Vec<Route>) -> Result<Self, ServiceError> {
        let tls = tls::server_config(&config.certificate_pem, &config.key_pem, &[])
            .map_err(|e| ServiceError::Startup(format!("web TLS configuration: {e}")))?;
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
            local_insecure_addr: Arc::new(Mutex::new(None)),
        })
    }

    /// The TLS listener's bound address.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// The plain-HTTP listener's bound address.
    pub async fn local_insecure_addr(&self) -> Option<SocketAddr> {
        *self.local_insecure_addr.lock().await
    }

    async fn serve_plain(
        listener: TcpListener,
        app: Router,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = listener.accept() => accepted,
            };

            let (stream, _peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "web accept failed");
                    continue;
                }
            };

            let service = TowerToHyperService::new(app.clone());
            tracker.spawn(async move {
                let io = TokioIo::new(stream);
                if let Err(e) = HyperServerBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    warn!(error = %e, "web connection error");
                }
            });
        }
    }

    async fn serve_tls(
        listener: TcpListener,
        acceptor: TlsAcceptor,
        app: Router,
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
                    warn!(error = %e, "web accept failed");
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let service = TowerToHyperService::new(app.clone());
            tracker.spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(e) => {
                        warn!(%peer, error = %e, "web TLS handshake failed");
                        return;
                    }
                };

                let io = TokioIo::new(tls_stream);
                if let Err(e) = HyperServerBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    warn!(%peer, error = %e, "web connection error");
                }
            });
        }
    }
}

#[async_trait]
impl Service for WebService {
    fn name(&self) -> &'static str {
        "web"
    }

    async fn start(&mut self) -> Result<(), ServiceError> {
        let notifications = self
            .notifications_tx
            .clone()
            .ok_or_else(|| ServiceError::Startup("service already stopped".into()))?;
        let state = AppState {
            base: self.config.base.clone(),
            routes: self.routes.clone(),
            notifications,
        };
        let app = router(state);

        let tls_listener =
            TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let tls_addr = tls_listener.local_addr()?;
        *self.local_addr.lock().await = Some(tls_addr);
        info!(addr = %tls_addr, "web service listening (TLS)");

        tokio::spawn(Self::serve_tls(
            tls_listener,
            TlsAcceptor::from(self.tls.clone()),
            app.clone(),
            self.cancel.clone(),
            self.tracker.clone(),
        ));

        let insecure_listener =
            TcpListener::bind((self.config.host.as_str(), self.config.insecure_port)).await?;
        let insecure_addr = insecure_listener.local_addr()?;
        *self.local_insecure_addr.lock().await = Some(insecure_addr);

        let insecure_app = if self.config.allow_insecure {
            info!(addr = %insecure_addr, "web service listening (insecure serving allowed)");
            app
        } else {
            info!(addr = %insecure_addr, "web service redirecting plain HTTP to TLS");
            redirect_router(self.config.port)
        };

        tokio::spawn(Self::serve_plain(
            insecure_listener,
            insecure_app,
            self.cancel.clone(),
            self.tracker.clone(),
        ));

        Ok(())
    }

    async fn reload(&self, routes: Vec<Route>) -> Result<(), ServiceError> {
        *self.routes.write().await = routes;
        info!("web routes reloaded");
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CERT_PEM: &str = include_str!("../../../testdata/cert.pem");
    const KEY_PEM: &str = include_str!("../../../testdata/key.pem");

    struct Harness {
        service: WebService,
        insecure_url: String,
        tls_url: String,
        notifications: mpsc::Receiver<WriteNotification>,
        base: tempfile::TempDir,
    }

    async fn start(allow_insecure: bool) -> Harness {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(base.path().join("alice")).unwrap();

        let routes = vec![Route {
            username: "alice".into(),
            password: bcrypt::hash("hunter2", 4).unwrap(),
            endpoint: "https://t.example/in".into(),
            local: false,
        }];

        let config = WebConfig {
            host: "127.0.0.1".into(),
            port: 0,
            insecure_port: 0,
            allow_insecure,
            base: base.path().to_path_buf(),
            certificate_pem: CERT_PEM.into(),
            key_pem: KEY_PEM.into(),
        };

        let mut service = WebService::new(config, routes).unwrap();
        let notifications = service.take_notifications().unwrap();
        service.start().await.unwrap();

        let tls_addr = service.local_addr().await.unwrap();
        let insecure_addr = service.local_insecure_addr().await.unwrap();

        Harness {
            service,
            insecure_url: format!("http://{insecure_addr}"),
            tls_url: format!("https://{tls_addr}"),
            notifications,
            base,
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn missing_credentials_get_a_challenge() {
        let harness = start(true).await;

        let response = client()
            .get(format!("{}/", harness.insecure_url))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        assert_eq!(
            response.headers()["www-authenticate"],
            "Basic realm=\"Shuttle\""
        );
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let harness = start(true).await;

        let response = client()
            .get(format!("{}/", harness.insecure_url))
            .basic_auth("alice", Some("wrong"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn listing_shows_the_users_files() {
        let harness = start(true).await;
        std::fs::write(harness.base.path().join("alice/report.csv"), b"a,b\n").unwrap();

        let response = client()
            .get(format!("{}/", harness.insecure_url))
            .basic_auth("alice", Some("hunter2"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        assert!(body.contains("report.csv"), "body: {body}");
        assert!(body.contains("/upload"), "upload form missing");
    }

    #[tokio::test]
    async fn upload_writes_file_and_notifies() {
        let mut harness = start(true).await;

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(b"hello, web!".to_vec()).file_name("hello.txt"),
        );

        let response = client()
            .post(format!("{}/upload", harness.insecure_url))
            .basic_auth("alice", Some("hunter2"))
            .multipart(form)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 303);

        let path = harness.base.path().join("alice/hello.txt");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello, web!");

        let notification = tokio::time::timeout(Duration::from_secs(2), harness.notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.username, "alice");
        assert_eq!(notification.path, path);
    }

    #[tokio::test]
    async fn upload_filename_is_flattened_to_basename() {
        let harness = start(true).await;

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(b"x".to_vec()).file_name("../escape.txt"),
        );

        let response = client()
            .post(format!("{}/upload", harness.insecure_url))
            .basic_auth("alice", Some("hunter2"))
            .multipart(form)
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 303);
        assert!(harness.base.path().join("alice/escape.txt").exists());
        assert!(!harness.base.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn download_serves_only_basenames() {
        let harness = start(true).await;
        std::fs::write(harness.base.path().join("alice/data.bin"), b"12345").unwrap();
        std::fs::write(harness.base.path().join("secret.txt"), b"no").unwrap();

        let response = client()
            .get(format!("{}/download?filename=data.bin", harness.insecure_url))
            .basic_auth("alice", Some("hunter2"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains("data.bin"));
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"12345");

        // ../secret.txt flattens to secret.txt inside the chroot: absent.
        let response = client()
            .get(format!(
                "{}/download?filename=../secret.txt",
                harness.insecure_url
            ))
            .basic_auth("alice", Some("hunter2"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn insecure_requests_redirect_to_tls() {
        let harness = start(false).await;

        let response = client()
            .get(format!("{}/some/path", harness.insecure_url))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 301);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("https://127.0.0.1:"), "location: {location}");
        assert!(location.ends_with("/some/path"));
    }

    #[tokio::test]
    async fn tls_listener_serves_the_app() {
        let harness = start(false).await;

        let response = client()
            .get(format!("{}/", harness.tls_url))
            .basic_auth("alice", Some("hunter2"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn stop_closes_the_channel() {
        let mut harness = start(true).await;
        harness.service.stop().await.unwrap();
        assert!(harness.notifications.recv().await.is_none());
    }
}
