//! multipart/form-data encoding.
//!
//! The upstream contract is exactly two fields: a file part named `payload`
//! carrying the file bytes under its basename, and a text field `username`.

use std::path::Path;

use rand::Rng;
use tokio::io::AsyncReadExt;

use crate::TransportError;

/// An encoded multipart body plus its `Content-Type` header value.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub body: Vec<u8>,
    pub content_type: String,
}

impl MultipartBody {
    /// Encodes `path` as the `payload` file part followed by the `username`
    /// text field. Fails only on file open or read errors.
    pub async fn encode(path: &Path, username: &str) -> Result<Self, TransportError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await?;

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let boundary = boundary();

        let mut body = Vec::with_capacity(contents.len() + 512);
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"payload\"; filename=\"{filename}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(&contents);
        body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"username\"\r\n\r\n");
        body.extend_from_slice(username.as_bytes());
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Ok(Self {
            body,
            content_type: format!("multipart/form-data; boundary={boundary}"),
        })
    }
}

/// Random hex boundary, long enough that payload collisions are not a
/// concern.
fn boundary() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    format!("shuttle{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn encode_fixture(contents: &[u8]) -> (MultipartBody, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents)
            .unwrap();

        let encoded = MultipartBody::encode(&path, "alice").await.unwrap();
        let boundary = encoded
            .content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap()
            .to_string();
        (encoded, boundary)
    }

    #[tokio::test]
    async fn body_carries_payload_and_username_fields() {
        let (encoded, boundary) = encode_fixture(b"hello, world\n").await;
        let text = String::from_utf8(encoded.body).unwrap();

        assert!(text.contains("name=\"payload\"; filename=\"hello.txt\""));
        assert!(text.contains("hello, world\n"));
        assert!(text.contains("name=\"username\""));
        assert!(text.contains("\r\nalice\r\n"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[tokio::test]
    async fn filename_is_basename_only() {
        let (encoded, _) = encode_fixture(b"x").await;
        let text = String::from_utf8(encoded.body).unwrap();

        // The temp directory's path must not leak into the part header.
        assert!(text.contains("filename=\"hello.txt\""));
        assert!(!text.contains("filename=\"/"));
    }

    #[tokio::test]
    async fn binary_payload_survives_encoding() {
        let payload: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        let (encoded, _) = encode_fixture(&payload).await;

        let needle = &payload[..];
        assert!(encoded
            .body
            .windows(needle.len())
            .any(|window| window == needle));
    }

    #[tokio::test]
    async fn boundaries_are_unique_per_encoding() {
        let (_, a) = encode_fixture(b"x").await;
        let (_, b) = encode_fixture(b"x").await;
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let result = MultipartBody::encode(Path::new("/nonexistent/f"), "alice").await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
