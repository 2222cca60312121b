//! SFTP version 3 wire codec.
//!
//! # Wire format
//!
//! ```text
//! PACKET:  [4 bytes BE: length] [length bytes: type byte + payload]
//! STRING:  [4 bytes BE: length] [length bytes]
//! ATTRS:   [4 bytes BE: flags] then, per flag bit:
//!          SIZE (0x1) u64, UIDGID (0x2) u32 u32,
//!          PERMISSIONS (0x4) u32, ACMODTIME (0x8) u32 u32
//! ```

use std::io;
use std::time::UNIX_EPOCH;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version implemented by the engine.
pub(crate) const VERSION: u32 = 3;

/// Larger packets are treated as a protocol violation.
pub(crate) const MAX_PACKET: u32 = 1024 * 1024;

/// Request packet types.
pub(crate) mod fx {
    pub const INIT: u8 = 1;
    pub const VERSION: u8 = 2;
    pub const OPEN: u8 = 3;
    pub const CLOSE: u8 = 4;
    pub const READ: u8 = 5;
    pub const WRITE: u8 = 6;
    pub const LSTAT: u8 = 7;
    pub const FSTAT: u8 = 8;
    pub const SETSTAT: u8 = 9;
    pub const FSETSTAT: u8 = 10;
    pub const OPENDIR: u8 = 11;
    pub const READDIR: u8 = 12;
    pub const REMOVE: u8 = 13;
    pub const MKDIR: u8 = 14;
    pub const RMDIR: u8 = 15;
    pub const REALPATH: u8 = 16;
    pub const STAT: u8 = 17;
    pub const RENAME: u8 = 18;
    pub const STATUS: u8 = 101;
    pub const HANDLE: u8 = 102;
    pub const DATA: u8 = 103;
    pub const NAME: u8 = 104;
    pub const ATTRS: u8 = 105;
}

/// Status codes.
pub(crate) mod status {
    pub const OK: u32 = 0;
    pub const EOF: u32 = 1;
    pub const NO_SUCH_FILE: u32 = 2;
    pub const PERMISSION_DENIED: u32 = 3;
    pub const FAILURE: u32 = 4;
    pub const BAD_MESSAGE: u32 = 5;
    pub const OP_UNSUPPORTED: u32 = 8;
}

/// `pflags` bits on SSH_FXP_OPEN.
pub(crate) mod pflags {
    pub const READ: u32 = 0x1;
    pub const WRITE: u32 = 0x2;
    pub const APPEND: u32 = 0x4;
    pub const CREAT: u32 = 0x8;
    pub const TRUNC: u32 = 0x10;
    pub const EXCL: u32 = 0x20;
}

mod attr_flags {
    pub const SIZE: u32 = 0x1;
    pub const UIDGID: u32 = 0x2;
    pub const PERMISSIONS: u32 = 0x4;
    pub const ACMODTIME: u32 = 0x8;
}

/// Reads one packet: the type byte plus payload. `None` on clean EOF.
pub(crate) async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<(u8, Vec<u8>)>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_bytes);
    if len == 0 || len > MAX_PACKET {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("packet length {len} out of range"),
        ));
    }

    let mut packet = vec![0u8; len as usize];
    reader.read_exact(&mut packet).await?;

    let payload = packet.split_off(1);
    Ok(Some((packet[0], payload)))
}

/// Writes one packet: `body[0]` is the type byte.
pub(crate) async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> io::Result<()> {
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Sequential payload reader.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated SFTP payload",
            ));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub(crate) fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn bytes(&mut self) -> io::Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> io::Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid UTF-8 in SFTP string"))
    }

    pub(crate) fn attrs(&mut self) -> io::Result<FileAttrs> {
        let flags = self.u32()?;
        let mut attrs = FileAttrs::default();

        if flags & attr_flags::SIZE != 0 {
            attrs.size = Some(self.u64()?);
        }
        if flags & attr_flags::UIDGID != 0 {
            attrs.uid_gid = Some((self.u32()?, self.u32()?));
        }
        if flags & attr_flags::PERMISSIONS != 0 {
            attrs.permissions = Some(self.u32()?);
        }
        if flags & attr_flags::ACMODTIME != 0 {
            attrs.times = Some((self.u32()?, self.u32()?));
        }

        Ok(attrs)
    }
}

/// Response payload builder.
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn packet(packet_type: u8) -> Self {
        Self {
            buf: vec![packet_type],
        }
    }

    pub(crate) fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub(crate) fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub(crate) fn bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(v);
        self
    }

    pub(crate) fn string(self, v: &str) -> Self {
        self.bytes(v.as_bytes())
    }

    pub(crate) fn attrs(mut self, attrs: &FileAttrs) -> Self {
        attrs.encode(&mut self.buf);
        self
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// File attributes, as much of them as version 3 carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FileAttrs {
    pub(crate) size: Option<u64>,
    pub(crate) uid_gid: Option<(u32, u32)>,
    pub(crate) permissions: Option<u32>,
    pub(crate) times: Option<(u32, u32)>,
}

impl FileAttrs {
    pub(crate) fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let (uid_gid, permissions) = {
            use std::os::unix::fs::MetadataExt;
            (
                Some((metadata.uid(), metadata.gid())),
                Some(metadata.mode()),
            )
        };
        #[cfg(not(unix))]
        let (uid_gid, permissions) = (None, None);

        let times = {
            let stamp = |t: std::io::Result<std::time::SystemTime>| {
                t.ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0)
            };
            Some((stamp(metadata.accessed()), stamp(metadata.modified())))
        };

        Self {
            size: Some(metadata.len()),
            uid_gid,
            permissions,
            times,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= attr_flags::SIZE;
        }
        if self.uid_gid.is_some() {
            flags |= attr_flags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= attr_flags::PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= attr_flags::ACMODTIME;
        }
        out.extend_from_slice(&flags.to_be_bytes());

        if let Some(size) = self.size {
            out.extend_from_slice(&size.to_be_bytes());
        }
        if let Some((uid, gid)) = self.uid_gid {
            out.extend_from_slice(&uid.to_be_bytes());
            out.extend_from_slice(&gid.to_be_bytes());
        }
        if let Some(perms) = self.permissions {
            out.extend_from_slice(&perms.to_be_bytes());
        }
        if let Some((atime, mtime)) = self.times {
            out.extend_from_slice(&atime.to_be_bytes());
            out.extend_from_slice(&mtime.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packet_round_trip() {
        let body = Encoder::packet(fx::STATUS)
            .u32(7)
            .u32(status::OK)
            .string("ok")
            .string("")
            .finish();

        let mut wire = Vec::new();
        write_packet(&mut wire, &body).await.unwrap();

        let mut cursor = &wire[..];
        let (packet_type, payload) = read_packet(&mut cursor).await.unwrap().unwrap();
        assert_eq!(packet_type, fx::STATUS);

        let mut decoder = Decoder::new(&payload);
        assert_eq!(decoder.u32().unwrap(), 7);
        assert_eq!(decoder.u32().unwrap(), status::OK);
        assert_eq!(decoder.string().unwrap(), "ok");
    }

    #[tokio::test]
    async fn eof_is_clean_end() {
        let mut cursor: &[u8] = &[];
        assert!(read_packet(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_packet_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_PACKET + 1).to_be_bytes());
        let mut cursor = &wire[..];

        assert!(read_packet(&mut cursor).await.is_err());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut decoder = Decoder::new(&[0, 0]);
        assert!(decoder.u32().is_err());
    }

    #[test]
    fn attrs_round_trip() {
        let attrs = FileAttrs {
            size: Some(42),
            uid_gid: Some((1000, 1000)),
            permissions: Some(0o100644),
            times: Some((10, 20)),
        };

        let mut encoded = Vec::new();
        attrs.encode(&mut encoded);

        let mut decoder = Decoder::new(&encoded);
        assert_eq!(decoder.attrs().unwrap(), attrs);
    }

    #[test]
    fn sparse_attrs_round_trip() {
        let attrs = FileAttrs {
            permissions: Some(0o644),
            ..Default::default()
        };

        let mut encoded = Vec::new();
        attrs.encode(&mut encoded);

        let mut decoder = Decoder::new(&encoded);
        assert_eq!(decoder.attrs().unwrap(), attrs);
    }
}
