//! The SFTP engine: one subsystem instance per session channel.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use shuttle_core::listing::long_line;
use shuttle_core::paths::{clean, resolve, to_virtual};

use crate::protocol::{
    fx, pflags, read_packet, status, write_packet, Decoder, Encoder, FileAttrs, VERSION,
};
use crate::WrittenFile;

/// How many directory entries one READDIR response carries.
const READDIR_BATCH: usize = 64;

enum Handle {
    File {
        file: tokio::fs::File,
        path: PathBuf,
        append: bool,
        written: bool,
    },
    Dir {
        entries: VecDeque<(String, std::fs::Metadata)>,
    },
}

/// One SFTP subsystem instance, confined to a chroot, reporting every
/// written-then-closed file.
pub struct SftpEngine {
    chroot: PathBuf,
    username: String,
    notify: mpsc::Sender<WrittenFile>,
    cancel: CancellationToken,
    handles: HashMap<u32, Handle>,
    next_handle: u32,
}

impl SftpEngine {
    pub fn new(
        chroot: PathBuf,
        username: String,
        notify: mpsc::Sender<WrittenFile>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chroot,
            username,
            notify,
            cancel,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Serves the subsystem until EOF, a protocol violation, or a stop
    /// request.
    pub async fn run<S: AsyncRead + AsyncWrite + Unpin + Send>(
        mut self,
        mut stream: S,
    ) -> io::Result<()> {
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(user = %self.username, "SFTP engine stopping");
                    return Ok(());
                }
                packet = read_packet(&mut stream) => packet?,
            };

            let Some((packet_type, payload)) = packet else {
                debug!(user = %self.username, "SFTP client disconnected");
                return Ok(());
            };

            let response = self.dispatch(packet_type, &payload).await?;
            write_packet(&mut stream, &response).await?;
        }
    }

    async fn dispatch(&mut self, packet_type: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = Decoder::new(payload);

        if packet_type == fx::INIT {
            return Ok(Encoder::packet(fx::VERSION).u32(VERSION).finish());
        }

        let id = decoder.u32()?;

        let response = match packet_type {
            fx::REALPATH => self.realpath(id, &mut decoder),
            fx::OPEN => self.open(id, &mut decoder).await,
            fx::CLOSE => self.close(id, &mut decoder).await,
            fx::READ => self.read(id, &mut decoder).await,
            fx::WRITE => self.write(id, &mut decoder).await,
            fx::LSTAT => self.stat(id, &mut decoder, true).await,
            fx::STAT => self.stat(id, &mut decoder, false).await,
            fx::FSTAT => self.fstat(id, &mut decoder).await,
            fx::SETSTAT => self.setstat(id, &mut decoder).await,
            fx::FSETSTAT => self.fsetstat(id, &mut decoder).await,
            fx::OPENDIR => self.opendir(id, &mut decoder).await,
            fx::READDIR => self.readdir(id, &mut decoder),
            fx::REMOVE => self.remove(id, &mut decoder).await,
            fx::MKDIR => self.mkdir(id, &mut decoder).await,
            fx::RMDIR => self.rmdir(id, &mut decoder).await,
            fx::RENAME => self.rename(id, &mut decoder).await,
            _ => Ok(status_response(
                id,
                status::OP_UNSUPPORTED,
                "operation not supported",
            )),
        };

        match response {
            Ok(response) => Ok(response),
            // A handler-level decode failure poisons only the request.
            Err(_) => Ok(status_response(id, status::BAD_MESSAGE, "malformed request")),
        }
    }

    fn resolve(&self, requested: &str) -> Option<PathBuf> {
        resolve(&self.chroot, Path::new("/"), requested)
    }

    fn fresh_handle(&mut self, handle: Handle) -> String {
        let id = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        self.handles.insert(id, handle);
        id.to_string()
    }

    // -- path requests ----------------------------------------------------

    fn realpath(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;

        // Lexical resolution inside the virtual namespace; existence is
        // not required.
        let virtual_path = match self.resolve(&requested) {
            Some(real) => to_virtual(&self.chroot, &real).unwrap_or_else(|| PathBuf::from("/")),
            None => clean(Path::new(&format!("/{requested}"))),
        };
        let display = virtual_path.display().to_string();

        Ok(Encoder::packet(fx::NAME)
            .u32(id)
            .u32(1)
            .string(&display)
            .string(&display)
            .attrs(&FileAttrs::default())
            .finish())
    }

    async fn stat(&mut self, id: u32, decoder: &mut Decoder<'_>, lstat: bool) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;
        let Some(path) = self.resolve(&requested) else {
            return Ok(status_response(id, status::NO_SUCH_FILE, "no such file"));
        };

        let metadata = if lstat {
            tokio::fs::symlink_metadata(&path).await
        } else {
            tokio::fs::metadata(&path).await
        };

        Ok(match metadata {
            Ok(metadata) => Encoder::packet(fx::ATTRS)
                .u32(id)
                .attrs(&FileAttrs::from_metadata(&metadata))
                .finish(),
            Err(e) => status_from_io(id, &e),
        })
    }

    async fn setstat(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;
        let attrs = decoder.attrs()?;
        let Some(path) = self.resolve(&requested) else {
            return Ok(status_response(id, status::NO_SUCH_FILE, "no such file"));
        };

        Ok(apply_permissions(&path, &attrs).await.map_or_else(
            |e| status_from_io(id, &e),
            |()| status_response(id, status::OK, "ok"),
        ))
    }

    async fn fsetstat(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let handle = decoder.string()?;
        let attrs = decoder.attrs()?;

        let Some(Handle::File { path, .. }) = self.lookup_handle(&handle) else {
            return Ok(status_response(id, status::FAILURE, "bad handle"));
        };
        let path = path.clone();

        Ok(apply_permissions(&path, &attrs).await.map_or_else(
            |e| status_from_io(id, &e),
            |()| status_response(id, status::OK, "ok"),
        ))
    }

    async fn remove(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;
        let Some(path) = self.resolve(&requested) else {
            return Ok(status_response(id, status::NO_SUCH_FILE, "no such file"));
        };

        Ok(match tokio::fs::remove_file(&path).await {
            Ok(()) => status_response(id, status::OK, "removed"),
            Err(e) => status_from_io(id, &e),
        })
    }

    async fn mkdir(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;
        let _attrs = decoder.attrs()?;
        let Some(path) = self.resolve(&requested) else {
            return Ok(status_response(id, status::PERMISSION_DENIED, "path not allowed"));
        };

        Ok(match tokio::fs::create_dir(&path).await {
            Ok(()) => status_response(id, status::OK, "created"),
            Err(e) => status_from_io(id, &e),
        })
    }

    async fn rmdir(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;
        let Some(path) = self.resolve(&requested) else {
            return Ok(status_response(id, status::NO_SUCH_FILE, "no such directory"));
        };

        Ok(match tokio::fs::remove_dir(&path).await {
            Ok(()) => status_response(id, status::OK, "removed"),
            Err(e) => status_from_io(id, &e),
        })
    }

    /// Renames are permitted over SFTP, confined to the chroot on both
    /// ends. An open written handle follows the rename so its close
    /// notification reports the final path.
    async fn rename(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let old = decoder.string()?;
        let new = decoder.string()?;

        let (Some(old_path), Some(new_path)) = (self.resolve(&old), self.resolve(&new)) else {
            return Ok(status_response(id, status::PERMISSION_DENIED, "path not allowed"));
        };

        Ok(match tokio::fs::rename(&old_path, &new_path).await {
            Ok(()) => {
                for handle in self.handles.values_mut() {
                    if let Handle::File { path, .. } = handle {
                        if *path == old_path {
                            *path = new_path.clone();
                        }
                    }
                }
                status_response(id, status::OK, "renamed")
            }
            Err(e) => status_from_io(id, &e),
        })
    }

    // -- handle requests --------------------------------------------------

    async fn open(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;
        let flags = decoder.u32()?;
        let _attrs = decoder.attrs()?;

        let Some(path) = self.resolve(&requested) else {
            return Ok(status_response(id, status::PERMISSION_DENIED, "path not allowed"));
        };

        let mut options = tokio::fs::OpenOptions::new();
        options
            .read(flags & pflags::READ != 0)
            .write(flags & pflags::WRITE != 0)
            .append(flags & pflags::APPEND != 0)
            .create(flags & pflags::CREAT != 0)
            .truncate(flags & pflags::TRUNC != 0)
            .create_new(flags & pflags::EXCL != 0);

        Ok(match options.open(&path).await {
            Ok(file) => {
                let handle = self.fresh_handle(Handle::File {
                    file,
                    path,
                    append: flags & pflags::APPEND != 0,
                    written: false,
                });
                Encoder::packet(fx::HANDLE).u32(id).string(&handle).finish()
            }
            Err(e) => status_from_io(id, &e),
        })
    }

    async fn close(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let handle = decoder.string()?;
        let Ok(key) = handle.parse::<u32>() else {
            return Ok(status_response(id, status::FAILURE, "bad handle"));
        };

        match self.handles.remove(&key) {
            Some(Handle::File {
                mut file,
                path,
                written,
                ..
            }) => {
                if let Err(e) = file.flush().await {
                    warn!(path = %path.display(), error = %e, "flush on close failed");
                }
                drop(file);

                if written {
                    let notification = WrittenFile {
                        username: self.username.clone(),
                        path,
                    };
                    let _ = self.notify.send(notification).await;
                }

                Ok(status_response(id, status::OK, "closed"))
            }
            Some(Handle::Dir { .. }) => Ok(status_response(id, status::OK, "closed")),
            None => Ok(status_response(id, status::FAILURE, "bad handle")),
        }
    }

    async fn read(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let handle = decoder.string()?;
        let offset = decoder.u64()?;
        let len = decoder.u32()?.min(crate::protocol::MAX_PACKET - 64);

        let Some(Handle::File { file, .. }) = self.lookup_handle_mut(&handle) else {
            return Ok(status_response(id, status::FAILURE, "bad handle"));
        };

        if let Err(e) = file.seek(io::SeekFrom::Start(offset)).await {
            return Ok(status_from_io(id, &e));
        }

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Ok(status_from_io(id, &e)),
            }
        }

        if filled == 0 {
            return Ok(status_response(id, status::EOF, "end of file"));
        }
        buf.truncate(filled);

        Ok(Encoder::packet(fx::DATA).u32(id).bytes(&buf).finish())
    }

    async fn write(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let handle = decoder.string()?;
        let offset = decoder.u64()?;
        let data = decoder.bytes()?;

        let Some(Handle::File {
            file,
            append,
            written,
            ..
        }) = self.lookup_handle_mut(&handle)
        else {
            return Ok(status_response(id, status::FAILURE, "bad handle"));
        };

        // Append-mode handles write at the end regardless of the offset
        // the client sends.
        if !*append {
            if let Err(e) = file.seek(io::SeekFrom::Start(offset)).await {
                return Ok(status_from_io(id, &e));
            }
        }

        Ok(match file.write_all(data).await {
            Ok(()) => {
                *written = true;
                status_response(id, status::OK, "written")
            }
            Err(e) => status_from_io(id, &e),
        })
    }

    async fn fstat(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let handle = decoder.string()?;

        let Some(Handle::File { file, .. }) = self.lookup_handle_mut(&handle) else {
            return Ok(status_response(id, status::FAILURE, "bad handle"));
        };

        Ok(match file.metadata().await {
            Ok(metadata) => Encoder::packet(fx::ATTRS)
                .u32(id)
                .attrs(&FileAttrs::from_metadata(&metadata))
                .finish(),
            Err(e) => status_from_io(id, &e),
        })
    }

    async fn opendir(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let requested = decoder.string()?;
        let Some(path) = self.resolve(&requested) else {
            return Ok(status_response(id, status::NO_SUCH_FILE, "no such directory"));
        };

        let mut dir = match tokio::fs::read_dir(&path).await {
            Ok(dir) => dir,
            Err(e) => return Ok(status_from_io(id, &e)),
        };

        let mut entries = VecDeque::new();
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(metadata) = entry.metadata().await {
                entries.push_back((name, metadata));
            }
        }

        let handle = self.fresh_handle(Handle::Dir { entries });
        Ok(Encoder::packet(fx::HANDLE).u32(id).string(&handle).finish())
    }

    fn readdir(&mut self, id: u32, decoder: &mut Decoder<'_>) -> io::Result<Vec<u8>> {
        let handle = decoder.string()?;

        let Some(Handle::Dir { entries }) = self.lookup_handle_mut(&handle) else {
            return Ok(status_response(id, status::FAILURE, "bad handle"));
        };

        if entries.is_empty() {
            return Ok(status_response(id, status::EOF, "end of directory"));
        }

        let batch: Vec<(String, std::fs::Metadata)> = {
            let take = entries.len().min(READDIR_BATCH);
            entries.drain(..take).collect()
        };

        let now = std::time::SystemTime::now();
        let mut encoder = Encoder::packet(fx::NAME).u32(id).u32(batch.len() as u32);
        for (name, metadata) in &batch {
            encoder = encoder
                .string(name)
                .string(&long_line(name, metadata, now))
                .attrs(&FileAttrs::from_metadata(metadata));
        }

        Ok(encoder.finish())
    }

    fn lookup_handle(&self, handle: &str) -> Option<&Handle> {
        handle.parse::<u32>().ok().and_then(|k| self.handles.get(&k))
    }

    fn lookup_handle_mut(&mut self, handle: &str) -> Option<&mut Handle> {
        handle
            .parse::<u32>()
            .ok()
            .and_then(|k| self.handles.get_mut(&k))
    }
}

fn status_response(id: u32, code: u32, message: &str) -> Vec<u8> {
    Encoder::packet(fx::STATUS)
        .u32(id)
        .u32(code)
        .string(message)
        .string("")
        .finish()
}

fn status_from_io(id: u32, error: &io::Error) -> Vec<u8> {
    let code = match error.kind() {
        io::ErrorKind::NotFound => status::NO_SUCH_FILE,
        io::ErrorKind::PermissionDenied => status::PERMISSION_DENIED,
        _ => status::FAILURE,
    };
    status_response(id, code, &error.to_string())
}

async fn apply_permissions(path: &Path, attrs: &FileAttrs) -> io::Result<()> {
    #[cfg(unix)]
    if let Some(mode) = attrs.permissions {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777)).await?;
    }
    #[cfg(not(unix))]
    let _ = (path, attrs);
    Ok(())
}
