//! The persistent shuttle log.
//!
//! A single file rewritten whole on every mutation of the tracked list.
//! The log is advisory: the in-memory list is authoritative while the
//! process lives, and a missing or damaged file loads as empty.
//!
//! # File format
//!
//! ```text
//! [4 bytes: magic "SHTL"]
//! [1 byte:  format version, currently 1]
//! [4 bytes BE: record count]
//! PER RECORD:
//!   [4 bytes BE: record length]
//!   [record length bytes: JSON shuttle document]
//! ```
//!
//! The records are JSON so field names travel with the data: a newer writer
//! can add fields without stranding an older reader, and vice versa.

use std::io::Write;
use std::path::Path;

use tracing::warn;

use shuttle_core::Shuttle;

const MAGIC: &[u8; 4] = b"SHTL";
const VERSION: u8 = 1;

/// A record larger than this is treated as corruption, not data.
const MAX_RECORD_LEN: u32 = 1024 * 1024;

/// Rewrites the log with the given shuttle list.
///
/// The new contents go to a sibling temp file which is fsynced and renamed
/// over the log, so a crash mid-write leaves the previous generation
/// intact.
pub(crate) fn write(path: &Path, shuttles: &[Shuttle]) -> std::io::Result<()> {
    let mut contents = Vec::new();
    contents.extend_from_slice(MAGIC);
    contents.push(VERSION);
    contents.extend_from_slice(&(shuttles.len() as u32).to_be_bytes());

    for shuttle in shuttles {
        let record = serde_json::to_vec(shuttle).map_err(std::io::Error::other)?;
        contents.extend_from_slice(&(record.len() as u32).to_be_bytes());
        contents.extend_from_slice(&record);
    }

    let temp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp)?;
    file.write_all(&contents)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&temp, path)?;

    Ok(())
}

/// Reads the log back. Absent, empty, or malformed files yield an empty
/// list; a trailing truncated record drops only the tail.
pub(crate) fn read(path: &Path) -> std::io::Result<Vec<Shuttle>> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let Some(header) = contents.get(..9) else {
        if !contents.is_empty() {
            warn!(path = %path.display(), "shuttle log too short, ignoring");
        }
        return Ok(Vec::new());
    };

    if &header[..4] != MAGIC || header[4] != VERSION {
        warn!(path = %path.display(), "shuttle log has unknown header, ignoring");
        return Ok(Vec::new());
    }

    let count = u32::from_be_bytes(header[5..9].try_into().unwrap()) as usize;
    let mut shuttles = Vec::with_capacity(count.min(1024));
    let mut offset = 9usize;

    for _ in 0..count {
        let Some(len_bytes) = contents.get(offset..offset + 4) else {
            warn!(path = %path.display(), "shuttle log truncated, dropping tail");
            break;
        };
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap());
        if len > MAX_RECORD_LEN {
            warn!(path = %path.display(), "shuttle log record oversized, dropping tail");
            break;
        }
        offset += 4;

        let Some(record) = contents.get(offset..offset + len as usize) else {
            warn!(path = %path.display(), "shuttle log truncated, dropping tail");
            break;
        };
        offset += len as usize;

        match serde_json::from_slice::<Shuttle>(record) {
            Ok(shuttle) => shuttles.push(shuttle),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping undecodable shuttle record");
            }
        }
    }

    Ok(shuttles)
}
