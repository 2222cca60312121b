//! One FTP control connection.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shuttle_core::listing::{civil_from_unix, long_line};
use shuttle_core::paths::{resolve, to_virtual};
use shuttle_core::{authenticate, Route, WriteNotification};

use crate::DATA_ACCEPT_TIMEOUT_SECS;

const MAX_LINE: usize = 4096;

/// A control or data stream, before or after the TLS upgrade.
enum FtpStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for FtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            FtpStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for FtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            FtpStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            FtpStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            FtpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            FtpStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

struct Authed {
    username: String,
    chroot: PathBuf,
}

/// One control connection, from banner to QUIT.
pub(crate) struct Session {
    stream: Option<FtpStream>,
    read_buf: Vec<u8>,
    peer: SocketAddr,
    local_ip: IpAddr,
    base: PathBuf,
    routes: Arc<RwLock<Vec<Route>>>,
    tls: Arc<rustls::ServerConfig>,
    notifications: mpsc::Sender<WriteNotification>,
    cancel: CancellationToken,
    pending_user: Option<String>,
    auth: Option<Authed>,
    /// Virtual working directory; `/` is the chroot.
    cwd: PathBuf,
    /// Passive listener awaiting the next transfer.
    data: Option<TcpListener>,
    tls_active: bool,
    prot_private: bool,
}

impl Session {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        base: PathBuf,
        routes: Arc<RwLock<Vec<Route>>>,
        tls: Arc<rustls::ServerConfig>,
        notifications: mpsc::Sender<WriteNotification>,
        cancel: CancellationToken,
    ) -> Self {
        let local_ip = stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|_| IpAddr::from([127, 0, 0, 1]));

        Self {
            stream: Some(FtpStream::Plain(stream)),
            read_buf: Vec::new(),
            peer,
            local_ip,
            base,
            routes,
            tls,
            notifications,
            cancel,
            pending_user: None,
            auth: None,
            cwd: PathBuf::from("/"),
            data: None,
            tls_active: false,
            prot_private: false,
        }
    }

    pub(crate) async fn run(mut self) -> io::Result<()> {
        let cancel = self.cancel.clone();

        self.reply("220 Shuttle").await?;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.reply("421 Service shutting down").await;
                    return Ok(());
                }
                line = self.read_line() => line?,
            };

            let Some(line) = line else {
                debug!(peer = %self.peer, "FTP client disconnected");
                return Ok(());
            };

            let (verb, arg) = split_command(&line);
            debug!(peer = %self.peer, verb = %verb, "FTP command");

            match verb.as_str() {
                "USER" => self.handle_user(arg).await?,
                "PASS" => self.handle_pass(arg).await?,
                "AUTH" => self.handle_auth(arg).await?,
                "PBSZ" => self.reply("200 PBSZ=0").await?,
                "PROT" => self.handle_prot(arg).await?,
                "SYST" => self.reply("215 UNIX Type: L8").await?,
                "FEAT" => self.handle_feat().await?,
                "NOOP" => self.reply("200 OK").await?,
                "QUIT" => {
                    self.reply("221 Goodbye").await?;
                    return Ok(());
                }
                _ if self.auth.is_none() => self.reply("530 Please login with USER and PASS").await?,
                "TYPE" => self.handle_type(arg).await?,
                "PWD" => {
                    let cwd = self.cwd.display().to_string();
                    self.reply(&format!("257 \"{cwd}\"")).await?;
                }
                "CWD" => self.handle_cwd(arg).await?,
                "CDUP" => self.handle_cwd("..").await?,
                "MKD" => self.handle_mkd(arg).await?,
                "PASV" => self.handle_pasv().await?,
                "EPSV" => self.handle_epsv().await?,
                "LIST" | "NLST" => self.handle_list(arg, verb == "NLST").await?,
                "SIZE" => self.handle_size(arg).await?,
                "MDTM" => self.handle_mdtm(arg).await?,
                "ALLO" => self.handle_allo(arg).await?,
                "SITE" => self.handle_site(arg).await?,
                "STOR" => self.handle_store(arg, false).await?,
                "APPE" => self.handle_store(arg, true).await?,
                "RETR" => self.handle_retr(arg).await?,
                // Deletes and renames are tolerated but not performed:
                // temp-file clients complete their rename dance, and the
                // close-write notification stays the one completion signal.
                "DELE" => self.reply("250 Requested file action okay, completed").await?,
                "RNFR" => self.reply("350 Ready for RNTO").await?,
                "RNTO" => self.reply("250 Requested file action okay, completed").await?,
                _ => self.reply("502 Command not implemented").await?,
            }
        }
    }

    // -- plumbing ---------------------------------------------------------

    fn stream(&mut self) -> io::Result<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    async fn reply(&mut self, text: &str) -> io::Result<()> {
        let stream = self.stream()?;
        stream.write_all(text.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await
    }

    async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.read_buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.read_buf.len() > MAX_LINE {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "command line too long"));
            }

            let mut chunk = [0u8; 1024];
            let n = self.stream()?.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Resolves a client path inside the authenticated chroot.
    fn resolve_path(&self, requested: &str) -> Option<PathBuf> {
        let auth = self.auth.as_ref()?;
        resolve(&auth.chroot, &self.cwd, requested)
    }

    // -- access -----------------------------------------------------------

    async fn handle_user(&mut self, arg: &str) -> io::Result<()> {
        if arg.is_empty() {
            return self.reply("501 Syntax error").await;
        }
        self.pending_user = Some(arg.to_string());
        self.reply("331 Password required").await
    }

    async fn handle_pass(&mut self, arg: &str) -> io::Result<()> {
        let Some(username) = self.pending_user.take() else {
            return self.reply("503 Send USER first").await;
        };

        let authed = {
            let routes = self.routes.read().await;
            authenticate(&routes, &username, arg).map(|route| Authed {
                username: route.username.clone(),
                chroot: route.user_dir(&self.base),
            })
        };

        match authed {
            Some(authed) => {
                info!(peer = %self.peer, user = %authed.username, "FTP login");
                self.auth = Some(authed);
                self.cwd = PathBuf::from("/");
                self.reply("230 Logged in").await
            }
            None => {
                warn!(peer = %self.peer, user = %username, "FTP login rejected");
                self.reply("530 Login incorrect").await
            }
        }
    }

    async fn handle_auth(&mut self, arg: &str) -> io::Result<()> {
        if !arg.eq_ignore_ascii_case("TLS") {
            return self.reply("504 Only AUTH TLS is supported").await;
        }
        if self.tls_active {
            return self.reply("503 Already secured").await;
        }

        self.reply("234 Proceed with TLS handshake").await?;

        let Some(FtpStream::Plain(tcp)) = self.stream.take() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };

        let acceptor = TlsAcceptor::from(self.tls.clone());
        let tls_stream = acceptor.accept(tcp).await?;
        self.stream = Some(FtpStream::Tls(Box::new(tls_stream)));
        self.tls_active = true;
        self.read_buf.clear();

        debug!(peer = %self.peer, "FTP control connection upgraded to TLS");
        Ok(())
    }

    async fn handle_prot(&mut self, arg: &str) -> io::Result<()> {
        match arg.to_ascii_uppercase().as_str() {
            "P" => {
                self.prot_private = true;
                self.reply("200 Protection level set to Private").await
            }
            "C" => {
                self.prot_private = false;
                self.reply("200 Protection level set to Clear").await
            }
            _ => self.reply("504 Unsupported protection level").await,
        }
    }

    async fn handle_feat(&mut self) -> io::Result<()> {
        let features = "211-Features:\r\n AUTH TLS\r\n EPSV\r\n MDTM\r\n PBSZ\r\n PROT\r\n SIZE\r\n UTF8\r\n211 End";
        self.reply(features).await
    }

    async fn handle_type(&mut self, arg: &str) -> io::Result<()> {
        match arg.to_ascii_uppercase().chars().next() {
            // Content is never transformed, so both types behave as image.
            Some('I') | Some('A') => self.reply("200 Type set").await,
            _ => self.reply("504 Unsupported type").await,
        }
    }

    // -- navigation -------------------------------------------------------

    async fn handle_cwd(&mut self, arg: &str) -> io::Result<()> {
        let Some(path) = self.resolve_path(arg) else {
            return self.reply("550 No such directory").await;
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                if let Some(cwd) = self
                    .auth
                    .as_ref()
                    .and_then(|auth| to_virtual(&auth.chroot, &path))
                {
                    self.cwd = cwd;
                }
                self.reply("250 Directory changed").await
            }
            Ok(_) => self.reply("550 Destination is not a directory").await,
            Err(_) => self.reply("550 No such directory").await,
        }
    }

    async fn handle_mkd(&mut self, arg: &str) -> io::Result<()> {
        let Some(path) = self.resolve_path(arg) else {
            return self.reply("553 Path not allowed").await;
        };

        match tokio::fs::create_dir(&path).await {
            Ok(()) => {
                let virt = self
                    .auth
                    .as_ref()
                    .and_then(|auth| to_virtual(&auth.chroot, &path))
                    .unwrap_or_else(|| PathBuf::from("/"));
                self.reply(&format!("257 \"{}\" created", virt.display())).await
            }
            Err(e) => {
                warn!(error = %e, "MKD failed");
                self.reply("550 Failed to create directory").await
            }
        }
    }

    async fn handle_size(&mut self, arg: &str) -> io::Result<()> {
        let Some(path) = self.resolve_path(arg) else {
            return self.reply("550 No such file").await;
        };

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => self.reply(&format!("213 {}", meta.len())).await,
            _ => self.reply("550 No such file").await,
        }
    }

    async fn handle_mdtm(&mut self, arg: &str) -> io::Result<()> {
        let Some(path) = self.resolve_path(arg) else {
            return self.reply("550 No such file").await;
        };

        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return self.reply("550 No such file").await,
        };

        let secs = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let t = civil_from_unix(secs);
        self.reply(&format!(
            "213 {:04}{:02}{:02}{:02}{:02}{:02}",
            t.year, t.month, t.day, t.hour, t.minute, t.second
        ))
        .await
    }

    async fn handle_allo(&mut self, arg: &str) -> io::Result<()> {
        let size: u64 = match arg.split_whitespace().next().and_then(|s| s.parse().ok()) {
            Some(size) => size,
            None => return self.reply("501 Syntax error").await,
        };

        match available_bytes(&self.base) {
            Ok(available) if available >= size => self.reply("200 Space available").await,
            Ok(_) => self.reply("452 Insufficient storage space").await,
            Err(e) => {
                warn!(error = %e, "statvfs failed");
                self.reply("450 Requested action not taken").await
            }
        }
    }

    async fn handle_site(&mut self, arg: &str) -> io::Result<()> {
        let mut parts = arg.split_whitespace();
        match parts.next().map(str::to_ascii_uppercase).as_deref() {
            Some("CHMOD") => {
                let (Some(mode), Some(target)) = (parts.next(), parts.next()) else {
                    return self.reply("501 Syntax error").await;
                };
                let Ok(mode) = u32::from_str_radix(mode, 8) else {
                    return self.reply("501 Bad mode").await;
                };
                let Some(path) = self.resolve_path(target) else {
                    return self.reply("553 Path not allowed").await;
                };

                #[cfg(unix)]
                let result = {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await
                };
                #[cfg(not(unix))]
                let result: io::Result<()> = Ok(());

                match result {
                    Ok(()) => self.reply("200 Mode changed").await,
                    Err(_) => self.reply("550 Failed to change mode").await,
                }
            }
            _ => self.reply("504 SITE command not supported").await,
        }
    }

    // -- data connections -------------------------------------------------

    async fn handle_pasv(&mut self) -> io::Result<()> {
        let IpAddr::V4(ip) = self.local_ip else {
            return self.reply("522 Use EPSV for this address family").await;
        };

        let listener = match TcpListener::bind((self.local_ip, 0)).await {
            Ok(listener) => listener,
            Err(_) => return self.reply("425 Cannot open data connection").await,
        };
        let port = listener.local_addr()?.port();
        self.data = Some(listener);

        let o = ip.octets();
        self.reply(&format!(
            "227 Entering Passive Mode ({},{},{},{},{},{})",
            o[0],
            o[1],
            o[2],
            o[3],
            port >> 8,
            port & 0xff
        ))
        .await
    }

    async fn handle_epsv(&mut self) -> io::Result<()> {
        let listener = match TcpListener::bind((self.local_ip, 0)).await {
            Ok(listener) => listener,
            Err(_) => return self.reply("425 Cannot open data connection").await,
        };
        let port = listener.local_addr()?.port();
        self.data = Some(listener);

        self.reply(&format!("229 Entering Extended Passive Mode (|||{port}|)"))
            .await
    }

    /// Accepts the pending passive connection, applying TLS when the
    /// session negotiated PROT P.
    async fn accept_data(&mut self, listener: TcpListener) -> io::Result<FtpStream> {
        let accept = tokio::time::timeout(
            Duration::from_secs(DATA_ACCEPT_TIMEOUT_SECS),
            listener.accept(),
        );
        let (stream, _) = accept
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "data connection timed out"))??;

        if self.prot_private && self.tls_active {
            let acceptor = TlsAcceptor::from(self.tls.clone());
            let tls_stream = acceptor.accept(stream).await?;
            Ok(FtpStream::Tls(Box::new(tls_stream)))
        } else {
            Ok(FtpStream::Plain(stream))
        }
    }

    // -- transfers --------------------------------------------------------

    async fn handle_list(&mut self, arg: &str, names_only: bool) -> io::Result<()> {
        // ls-style flags are accepted and ignored.
        let target = arg.split_whitespace().find(|p| !p.starts_with('-')).unwrap_or("");
        let target = if target.is_empty() { "." } else { target };

        let Some(path) = self.resolve_path(target) else {
            return self.reply("550 No such file or directory").await;
        };

        let Some(listener) = self.data.take() else {
            return self.reply("425 Use PASV or EPSV first").await;
        };

        self.reply("150 Here comes the directory listing").await?;
        let mut data = match self.accept_data(listener).await {
            Ok(data) => data,
            Err(_) => return self.reply("425 Cannot open data connection").await,
        };

        let now = SystemTime::now();
        let mut lines = String::new();

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                let mut entries = match tokio::fs::read_dir(&path).await {
                    Ok(entries) => entries,
                    Err(_) => return self.reply("550 Failed to read directory").await,
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if names_only {
                        lines.push_str(&name);
                    } else if let Ok(meta) = entry.metadata().await {
                        lines.push_str(&long_line(&name, &meta, now));
                    } else {
                        continue;
                    }
                    lines.push_str("\r\n");
                }
            }
            Ok(meta) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if names_only {
                    lines.push_str(&name);
                } else {
                    lines.push_str(&long_line(&name, &meta, now));
                }
                lines.push_str("\r\n");
            }
            Err(_) => return self.reply("550 No such file or directory").await,
        }

        data.write_all(lines.as_bytes()).await?;
        data.shutdown().await?;
        self.reply("226 Directory send OK").await
    }

    async fn handle_store(&mut self, arg: &str, append: bool) -> io::Result<()> {
        if arg.is_empty() {
            return self.reply("501 Syntax error").await;
        }

        let Some(path) = self.resolve_path(arg) else {
            return self.reply("553 Path not allowed").await;
        };
        let Some(username) = self.auth.as_ref().map(|a| a.username.clone()) else {
            return self.reply("530 Please login with USER and PASS").await;
        };

        let Some(listener) = self.data.take() else {
            return self.reply("425 Use PASV or EPSV first").await;
        };

        self.reply("150 Ok to send data").await?;
        let mut data = match self.accept_data(listener).await {
            Ok(data) => data,
            Err(_) => return self.reply("425 Cannot open data connection").await,
        };

        // Write-without-append replaces: drop any previous file so a
        // re-upload cannot leave a longer stale tail behind.
        if !append {
            let _ = tokio::fs::remove_file(&path).await;
        }

        let open = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .await
        } else {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .await
        };

        let mut file = match open {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to open upload target");
                return self.reply("550 Failed to open file").await;
            }
        };

        match tokio::io::copy(&mut data, &mut file).await {
            Ok(bytes) => {
                file.flush().await?;
                drop(file);
                drop(data);

                info!(
                    peer = %self.peer,
                    user = %username,
                    path = %path.display(),
                    bytes,
                    "FTP upload complete"
                );
                self.reply("226 Transfer complete").await?;

                let notification = WriteNotification {
                    username,
                    path,
                };
                let _ = self.notifications.send(notification).await;
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "FTP upload aborted");
                self.reply("426 Transfer aborted").await
            }
        }
    }

    async fn handle_retr(&mut self, arg: &str) -> io::Result<()> {
        let Some(path) = self.resolve_path(arg) else {
            return self.reply("550 No such file").await;
        };

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(_) => return self.reply("550 No such file").await,
        };

        let Some(listener) = self.data.take() else {
            return self.reply("425 Use PASV or EPSV first").await;
        };

        self.reply("150 Opening data connection").await?;
        let mut data = match self.accept_data(listener).await {
            Ok(data) => data,
            Err(_) => return self.reply("425 Cannot open data connection").await,
        };

        match tokio::io::copy(&mut file, &mut data).await {
            Ok(_) => {
                data.shutdown().await?;
                self.reply("226 Transfer complete").await
            }
            Err(_) => self.reply("426 Transfer aborted").await,
        }
    }
}

fn split_command(line: &str) -> (String, &str) {
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
        None => (line.trim().to_ascii_uppercase(), ""),
    }
}

/// Free bytes available to unprivileged users on the filesystem holding
/// `path`.
fn available_bytes(path: &Path) -> io::Result<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;

        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(u64::MAX)
    }
}
