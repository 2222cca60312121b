//! The shuttle record: one pending forwarding job.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::route::Route;
use crate::FAILED_DIR;

/// A file on disk plus the route it belongs to.
///
/// `path` is the primary key: the launchpad tracks at most one shuttle per
/// path. The route is a copy taken at enqueue time, so a shuttle keeps
/// flying to the endpoint it was created with even across a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shuttle {
    /// Absolute path of the payload file.
    pub path: PathBuf,
    /// The owning route, captured at enqueue time.
    pub route: Route,
}

impl Shuttle {
    pub fn new(path: impl Into<PathBuf>, route: Route) -> Self {
        Self {
            path: path.into(),
            route,
        }
    }

    /// The payload's file name.
    pub fn filename(&self) -> &str {
        self.path
            .file_name()
            .map(|n| n.to_str().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Where the payload goes on permanent rejection:
    /// `<dirname>/failed/<basename>`.
    pub fn failed_destination(&self) -> Option<PathBuf> {
        let parent = self.path.parent()?;
        let name = self.path.file_name()?;
        Some(parent.join(FAILED_DIR).join(name))
    }
}

/// Creates the `failed/` directory for every route under `base`.
pub fn ensure_failed_dirs(base: &Path, routes: &[Route]) -> std::io::Result<()> {
    for route in routes {
        std::fs::create_dir_all(route.user_dir(base).join(FAILED_DIR))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route {
            username: "alice".into(),
            password: String::new(),
            endpoint: "https://collector.example/ingest".into(),
            local: false,
        }
    }

    #[test]
    fn failed_destination_is_sibling_failed_dir() {
        let shuttle = Shuttle::new("/srv/shuttle/alice/report.csv", route());

        assert_eq!(
            shuttle.failed_destination().unwrap(),
            PathBuf::from("/srv/shuttle/alice/failed/report.csv")
        );
    }

    #[test]
    fn filename_is_basename_only() {
        let shuttle = Shuttle::new("/srv/shuttle/alice/report.csv", route());
        assert_eq!(shuttle.filename(), "report.csv");
    }

    #[test]
    fn ensure_failed_dirs_creates_per_user_directories() {
        let base = tempfile::tempdir().unwrap();
        let routes = vec![route()];

        ensure_failed_dirs(base.path(), &routes).unwrap();

        assert!(base.path().join("alice/failed").is_dir());
        // Idempotent.
        ensure_failed_dirs(base.path(), &routes).unwrap();
    }

    #[test]
    fn round_trips_through_json() {
        let shuttle = Shuttle::new("/srv/shuttle/alice/report.csv", route());

        let encoded = serde_json::to_vec(&shuttle).unwrap();
        let decoded: Shuttle = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded, shuttle);
    }

    #[test]
    fn decoding_tolerates_unknown_fields() {
        let raw = r#"{
            "path": "/srv/shuttle/alice/report.csv",
            "route": {
                "username": "alice",
                "password": "",
                "endpoint": "https://collector.example/ingest",
                "local": false,
                "added_in_a_future_version": 7
            },
            "also_new": true
        }"#;

        let decoded: Shuttle = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.route.username, "alice");
    }
}
