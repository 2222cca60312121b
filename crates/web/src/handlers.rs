//! Web portal request handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine as _;
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use shuttle_core::listing::{list_timestamp, mode_string};
use shuttle_core::{authenticate, Route, WriteNotification};

/// Uploads up to this size are accepted in one request.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) base: PathBuf,
    pub(crate) routes: Arc<RwLock<Vec<Route>>>,
    pub(crate) notifications: mpsc::Sender<WriteNotification>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .route("/download", get(serve_download))
        .route("/upload", post(handle_upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// The plain-HTTP listener's app when insecure serving is disallowed:
/// everything becomes a permanent redirect to the TLS port.
pub(crate) fn redirect_router(tls_port: u16) -> Router {
    Router::new().fallback(move |uri: Uri, headers: HeaderMap| async move {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.split(':').next())
            .unwrap_or("localhost");

        let target = if tls_port == 443 {
            format!("https://{host}{uri}")
        } else {
            format!("https://{host}:{tls_port}{uri}")
        };

        (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, target)],
        )
            .into_response()
    })
}

/// Checks HTTP basic credentials against the route table.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Route, Response> {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"Shuttle\"")],
            "Unauthorized.",
        )
            .into_response()
    };

    let credentials = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok());

    let Some(credentials) = credentials else {
        return Err(unauthorized());
    };
    let Some((username, password)) = credentials.split_once(':') else {
        return Err(unauthorized());
    };

    let routes = state.routes.read().await;
    authenticate(&routes, username, password)
        .cloned()
        .ok_or_else(unauthorized)
}

async fn serve_root(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let route = match authorize(&state, &headers).await {
        Ok(route) => route,
        Err(response) => return response,
    };

    let dir = route.user_dir(&state.base);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to read user directory");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Error while reading directory")
                .into_response();
        }
    };

    let now = SystemTime::now();
    let mut rows = String::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let name = escape_html(&name);

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            metadata.mode() & 0o7777
        };
        #[cfg(not(unix))]
        let mode = 0o644;

        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td>\
             <td><a href=\"/download?filename={}\">Download</a></td></tr>\n",
            mode_string(mode, metadata.is_dir()),
            list_timestamp(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH), now),
            name,
            name,
        ));
    }

    Html(format!(
        "<table>\n<thead><tr><th>Mode</th><th>Modified</th><th>Name</th><th>Download</th></tr></thead>\n\
         <tbody>\n{rows}</tbody>\n</table>\n<br />\n\
         <form action=\"/upload\" method=\"post\" enctype=\"multipart/form-data\">\n\
         <label>Select a file to upload</label><br />\n\
         <input type=\"file\" name=\"file\" />\n\
         <input type=\"submit\" value=\"Upload\" />\n\
         </form>\n"
    ))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    filename: String,
}

async fn serve_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DownloadParams>,
) -> Response {
    let route = match authorize(&state, &headers).await {
        Ok(route) => route,
        Err(response) => return response,
    };

    // Basename only: the query string cannot name other directories.
    let Some(filename) = Path::new(&params.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
    else {
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    };

    let path = route.user_dir(&state.base).join(&filename);
    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(_) => return (StatusCode::NOT_FOUND, "File not found").into_response(),
    };

    (
        [
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        ],
        contents,
    )
        .into_response()
}

async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let route = match authorize(&state, &headers).await {
        Ok(route) => route,
        Err(response) => return response,
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "multipart parse failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Upload error").into_response();
            }
        };

        if field.name() != Some("file") {
            continue;
        }

        // Basename only, whatever the client claims.
        let Some(filename) = field
            .file_name()
            .and_then(|name| Path::new(name).file_name())
            .map(|name| name.to_string_lossy().into_owned())
        else {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Upload error").into_response();
        };

        let contents = match field.bytes().await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "upload read failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Upload error").into_response();
            }
        };

        let path = route.user_dir(&state.base).join(&filename);
        if let Err(e) = tokio::fs::write(&path, &contents).await {
            warn!(path = %path.display(), error = %e, "upload write failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Upload error").into_response();
        }

        info!(user = %route.username, path = %path.display(), bytes = contents.len(), "web upload complete");

        let notification = WriteNotification {
            username: route.username.clone(),
            path,
        };
        let _ = state.notifications.send(notification).await;

        return Redirect::to("/").into_response();
    }

    (StatusCode::INTERNAL_SERVER_ERROR, "Upload error").into_response()
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_neutralises_markup() {
        assert_eq!(escape_html("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
        assert_eq!(escape_html("plain.txt"), "plain.txt");
    }
}
