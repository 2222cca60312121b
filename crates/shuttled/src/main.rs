//! The Shuttle gateway daemon.
//!
//! Files uploaded over FTP(S), SFTP, or the web form — or dropped into a
//! watched local directory — are forwarded as multipart POSTs to each
//! user's configured endpoint, deleted on success, and parked in `failed/`
//! on permanent rejection.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shuttle_core::ConfigOverrides;
use shuttled::{MissionControl, MissionOptions};

#[derive(Parser)]
#[command(name = "shuttled")]
#[command(about = "Multi-protocol file ingestion gateway", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "/etc/shuttle/config.json")]
    config: PathBuf,

    /// Path to the persisted shuttle log.
    #[arg(long, default_value = "/run/shuttle/shuttles.bin")]
    shuttles: PathBuf,

    /// Retry delay in seconds for error-inducing shuttles.
    #[arg(long, default_value_t = 5)]
    retry: u64,

    /// Concurrent upload workers.
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// SSH host key path; overrides the key in the configuration file.
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// TLS certificate path; overrides the configuration file.
    #[arg(long)]
    certificate_public: Option<PathBuf>,

    /// TLS certificate key path; overrides the configuration file.
    #[arg(long)]
    certificate_private: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0")]
    ftp_host: String,

    #[arg(long, default_value_t = 2001)]
    ftp_port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    sftp_host: String,

    #[arg(long, default_value_t = 2002)]
    sftp_port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    web_host: String,

    #[arg(long, default_value_t = 8081)]
    web_port: u16,

    #[arg(long, default_value_t = 8080)]
    web_insecure_port: u16,

    /// Serve the web app over plain HTTP instead of redirecting to TLS.
    #[arg(long, default_value_t = false)]
    web_allow_insecure: bool,
}

impl Cli {
    fn into_options(self) -> MissionOptions {
        MissionOptions {
            config: self.config,
            shuttles: self.shuttles,
            retry: Duration::from_secs(self.retry),
            workers: self.workers,
            overrides: ConfigOverrides {
                private_key: self.private_key,
                certificate_public: self.certificate_public,
                certificate_private: self.certificate_private,
            },
            ftp_host: self.ftp_host,
            ftp_port: self.ftp_port,
            sftp_host: self.sftp_host,
            sftp_port: self.sftp_port,
            web_host: self.web_host,
            web_port: self.web_port,
            web_insecure_port: self.web_insecure_port,
            web_allow_insecure: self.web_allow_insecure,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let start = Instant::now();
    let options = Cli::parse().into_options();

    let mut mission = MissionControl::new(options)?;
    mission.start().await.context("starting mission control")?;

    info!(startup = ?start.elapsed(), "ready and processing");

    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("reloading routes");
                match mission.reload().await {
                    Ok(()) => info!("routes reloaded"),
                    Err(e) => error!(error = %e, "reload failed, keeping previous configuration"),
                }
            }
            _ = interrupt.recv() => break,
            _ = terminate.recv() => break,
        }
    }

    info!("shutdown requested, waiting for transfers to complete");
    mission.stop().await;
    info!("transfers complete, shutting down");

    Ok(())
}
