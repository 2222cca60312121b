//! Mission control: configuration, services, and the launchpad, wired
//! together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use shuttle_core::shuttle::ensure_failed_dirs;
use shuttle_core::{
    lookup, separate, Config, ConfigOverrides, Route, Service, Shuttle, WriteNotification,
};
use shuttle_ftp::{FtpConfig, FtpService};
use shuttle_launchpad::Launchpad;
use shuttle_sftp::{SftpConfig, SftpService};
use shuttle_transport::Forwarder;
use shuttle_watcher::LocalService;
use shuttle_web::{WebConfig, WebService};

/// Everything the daemon needs beyond the configuration file.
#[derive(Debug, Clone)]
pub struct MissionOptions {
    pub config: PathBuf,
    pub shuttles: PathBuf,
    pub retry: Duration,
    pub workers: usize,
    pub overrides: ConfigOverrides,
    pub ftp_host: String,
    pub ftp_port: u16,
    pub sftp_host: String,
    pub sftp_port: u16,
    pub web_host: String,
    pub web_port: u16,
    pub web_insecure_port: u16,
    pub web_allow_insecure: bool,
}

/// The top-level orchestrator.
pub struct MissionControl {
    options: MissionOptions,
    config: Config,
    /// The current route table, consulted when a write notification is
    /// turned into a shuttle. Swapped whole on reload.
    routes: Arc<RwLock<Vec<Route>>>,
    launchpad: Arc<Launchpad>,
    services: Vec<Box<dyn Service>>,
    drains: TaskTracker,
}

impl MissionControl {
    /// Loads the configuration and prepares the launchpad. No listeners
    /// are opened yet.
    pub fn new(options: MissionOptions) -> anyhow::Result<Self> {
        let config = Config::load(&options.config, &options.overrides)
            .with_context(|| format!("loading configuration from {}", options.config.display()))?;

        let forwarder = Forwarder::new().context("building HTTP forwarder")?;
        let launchpad = Launchpad::new(
            options.retry,
            options.shuttles.clone(),
            Arc::new(forwarder),
        );
        let routes = Arc::new(RwLock::new(config.routes.clone()));

        Ok(Self {
            options,
            config,
            routes,
            launchpad,
            services: Vec::new(),
            drains: TaskTracker::new(),
        })
    }

    /// The launchpad, exposed for inspection.
    pub fn launchpad(&self) -> &Arc<Launchpad> {
        &self.launchpad
    }

    /// Creates the per-user directories, starts every service, wires their
    /// notifications into the launchpad, launches the workers, and resumes
    /// persisted shuttles.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        ensure_failed_dirs(&self.config.base, &self.config.routes)
            .context("creating failed directories")?;

        let (local, external) = separate(&self.config.routes);

        let mut services: Vec<Box<dyn Service>> = vec![
            Box::new(LocalService::new(self.config.base.clone(), local)),
            Box::new(
                FtpService::new(
                    FtpConfig {
                        host: self.options.ftp_host.clone(),
                        port: self.options.ftp_port,
                        base: self.config.base.clone(),
                        certificate_pem: self.config.certificate_public.clone(),
                        key_pem: self.config.certificate_private.clone(),
                    },
                    external.clone(),
                )
                .context("building FTP service")?,
            ),
            Box::new(
                SftpService::new(
                    SftpConfig {
                        host: self.options.sftp_host.clone(),
                        port: self.options.sftp_port,
                        base: self.config.base.clone(),
                        host_key_pem: self.config.private_key.clone(),
                    },
                    external.clone(),
                )
                .context("building SFTP service")?,
            ),
            Box::new(
                WebService::new(
                    WebConfig {
                        host: self.options.web_host.clone(),
                        port: self.options.web_port,
                        insecure_port: self.options.web_insecure_port,
                        allow_insecure: self.options.web_allow_insecure,
                        base: self.config.base.clone(),
                        certificate_pem: self.config.certificate_public.clone(),
                        key_pem: self.config.certificate_private.clone(),
                    },
                    external,
                )
                .context("building web service")?,
            ),
        ];

        for service in &mut services {
            let name = service.name();
            service
                .start()
                .await
                .with_context(|| format!("starting {name} service"))?;

            let Some(notifications) = service.take_notifications() else {
                anyhow::bail!("{name} service yielded no notification channel");
            };
            self.drains.spawn(Self::drain(
                name,
                notifications,
                self.routes.clone(),
                self.launchpad.clone(),
            ));

            info!(service = name, "service started");
        }
        self.services = services;

        self.launchpad.launch_workers(self.options.workers);

        info!(path = %self.options.shuttles.display(), "loading persisted shuttles");
        match self.launchpad.load().await {
            Ok(count) => info!(count, "persisted shuttles loaded"),
            Err(e) => error!(error = %e, "failed to load persisted shuttles, continuing"),
        }

        Ok(())
    }

    /// Turns one service's write notifications into shuttles. The route is
    /// looked up at notification time so uploads made after a reload use
    /// the new table.
    async fn drain(
        service: &'static str,
        mut notifications: mpsc::Receiver<WriteNotification>,
        routes: Arc<RwLock<Vec<Route>>>,
        launchpad: Arc<Launchpad>,
    ) {
        while let Some(notification) = notifications.recv().await {
            let route = {
                let routes = routes.read().await;
                lookup(&routes, &notification.username).cloned()
            };

            let Some(route) = route else {
                error!(
                    service,
                    user = %notification.username,
                    path = %notification.path.display(),
                    "no route for write notification"
                );
                continue;
            };

            let shuttle = Shuttle::new(notification.path, route);
            if let Err(e) = launchpad.add(shuttle).await {
                error!(service, error = %e, "failed to enqueue shuttle");
            }
        }
    }

    /// Re-parses the configuration and installs the new route table in
    /// every running service. A parse failure leaves everything as it was.
    pub async fn reload(&mut self) -> anyhow::Result<()> {
        let config = Config::load(&self.options.config, &self.options.overrides)
            .with_context(|| format!("reloading {}", self.options.config.display()))?;

        ensure_failed_dirs(&config.base, &config.routes)
            .context("creating failed directories")?;

        *self.routes.write().await = config.routes.clone();

        let (local, external) = separate(&config.routes);
        for service in &self.services {
            let partition = if service.name() == "local" {
                local.clone()
            } else {
                external.clone()
            };
            if let Err(e) = service.reload(partition).await {
                warn!(service = service.name(), error = %e, "service reload failed");
            }
        }

        self.config = config;
        Ok(())
    }

    /// Stops every service, waits for the notification drains to finish,
    /// then waits for in-flight transports.
    pub async fn stop(&mut self) {
        for service in &mut self.services {
            if let Err(e) = service.stop().await {
                warn!(service = service.name(), error = %e, "service stop failed");
            }
        }

        self.drains.close();
        self.drains.wait().await;

        self.launchpad.wait_enroute().await;
    }
}
