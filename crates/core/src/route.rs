//! The route table: one record per user, swapped whole on reload.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A per-user record linking a chroot, an upstream endpoint, and a
/// credential.
///
/// Routes are immutable once published; reload installs a new table instead
/// of mutating records in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Unique login name; also the name of the user's directory under the
    /// base path.
    pub username: String,
    /// bcrypt hash of the user's password.
    pub password: String,
    /// Absolute http(s) URL the user's files are forwarded to.
    pub endpoint: String,
    /// When set, this user's files arrive by filesystem watching instead of
    /// through the protocol servers. A route is never both.
    #[serde(default)]
    pub local: bool,
}

impl Route {
    /// The user's chroot directory under `base`.
    pub fn user_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.username)
    }
}

/// Partitions a route table by the `local` flag: `(local, external)`.
pub fn separate(routes: &[Route]) -> (Vec<Route>, Vec<Route>) {
    let mut local = Vec::new();
    let mut external = Vec::new();

    for route in routes {
        if route.local {
            local.push(route.clone());
        } else {
            external.push(route.clone());
        }
    }

    (local, external)
}

/// Finds a route by username.
pub fn lookup<'a>(routes: &'a [Route], username: &str) -> Option<&'a Route> {
    routes.iter().find(|r| r.username == username)
}

/// Verifies a login against the table.
///
/// The stored password must be a bcrypt hash; anything that does not parse
/// as one rejects. Unknown users and wrong passwords are indistinguishable
/// to the caller.
pub fn authenticate<'a>(
    routes: &'a [Route],
    username: &str,
    password: &str,
) -> Option<&'a Route> {
    let route = lookup(routes, username)?;

    match bcrypt::verify(password, &route.password) {
        Ok(true) => Some(route),
        Ok(false) | Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(username: &str, local: bool) -> Route {
        Route {
            username: username.into(),
            // Minimum cost keeps the tests fast.
            password: bcrypt::hash("hunter2", 4).unwrap(),
            endpoint: "https://collector.example/ingest".into(),
            local,
        }
    }

    #[test]
    fn separate_partitions_by_local_flag() {
        let routes = vec![route("alice", false), route("bob", true), route("carol", false)];

        let (local, external) = separate(&routes);

        assert_eq!(local.len(), 1);
        assert_eq!(local[0].username, "bob");
        assert_eq!(external.len(), 2);
    }

    #[test]
    fn lookup_finds_by_username() {
        let routes = vec![route("alice", false), route("bob", false)];

        assert_eq!(lookup(&routes, "bob").unwrap().username, "bob");
        assert!(lookup(&routes, "mallory").is_none());
    }

    #[test]
    fn authenticate_accepts_matching_password() {
        let routes = vec![route("alice", false)];

        assert!(authenticate(&routes, "alice", "hunter2").is_some());
    }

    #[test]
    fn authenticate_rejects_wrong_password() {
        let routes = vec![route("alice", false)];

        assert!(authenticate(&routes, "alice", "hunter3").is_none());
    }

    #[test]
    fn authenticate_rejects_unknown_user() {
        let routes = vec![route("alice", false)];

        assert!(authenticate(&routes, "mallory", "hunter2").is_none());
    }

    #[test]
    fn authenticate_rejects_cleartext_stored_password() {
        // Hashes only: a route carrying a cleartext password must never
        // authenticate, even with the exact same string.
        let mut r = route("alice", false);
        r.password = "hunter2".into();

        assert!(authenticate(&[r], "alice", "hunter2").is_none());
    }

    #[test]
    fn user_dir_is_under_base() {
        let r = route("alice", false);
        assert_eq!(
            r.user_dir(Path::new("/srv/shuttle")),
            PathBuf::from("/srv/shuttle/alice")
        );
    }
}
