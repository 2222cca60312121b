//! Chroot path resolution.
//!
//! Every protocol server resolves client-supplied paths through this module
//! so a user can never observe or write outside `<base>/<username>/`.

use std::path::{Component, Path, PathBuf};

/// Lexically cleans a path: collapses `.`, resolves `..` against preceding
/// components, and drops `..` that would climb above the root of an
/// absolute path. Purely textual, no filesystem access.
pub fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    let absolute = path.is_absolute();

    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    out.pop();
                    depth -= 1;
                } else if !absolute {
                    out.push("..");
                }
                // Above the root of an absolute path there is nowhere to go.
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }

    if out.as_os_str().is_empty() {
        out.push(if absolute { "/" } else { "." });
    }

    out
}

/// Resolves a client-supplied path against a chroot and a virtual working
/// directory.
///
/// `cwd` is the session's virtual directory, always absolute (`/` is the
/// chroot itself). The rules, in order:
///
/// 1. the request is cleaned lexically;
/// 2. a cleaned absolute request that is already under the chroot is used
///    verbatim (some clients echo server-absolute paths back);
/// 3. anything else is interpreted inside the chroot: absolute requests
///    relative to the chroot root, relative requests relative to `cwd`;
/// 4. a result that escapes the chroot is rejected.
pub fn resolve(chroot: &Path, cwd: &Path, requested: &str) -> Option<PathBuf> {
    let requested = Path::new(requested);

    if requested.is_absolute() {
        let cleaned = clean(requested);
        if cleaned.starts_with(chroot) {
            return Some(cleaned);
        }
    }

    let virtual_path = if requested.is_absolute() {
        clean(requested)
    } else {
        clean(&cwd.join(requested))
    };

    let mut real = chroot.to_path_buf();
    for component in virtual_path.components() {
        if let Component::Normal(part) = component {
            real.push(part);
        }
    }

    let real = clean(&real);
    real.starts_with(chroot).then_some(real)
}

/// Maps a real path back into the session's virtual namespace. Returns an
/// absolute virtual path (`/` is the chroot).
pub fn to_virtual(chroot: &Path, real: &Path) -> Option<PathBuf> {
    let rest = real.strip_prefix(chroot).ok()?;
    Some(Path::new("/").join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROOT: &str = "/srv/shuttle/alice";

    fn resolve_ok(cwd: &str, requested: &str) -> PathBuf {
        resolve(Path::new(CHROOT), Path::new(cwd), requested).unwrap()
    }

    #[test]
    fn clean_collapses_dot_and_dotdot() {
        assert_eq!(clean(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(clean(Path::new("a/b/../../d")), PathBuf::from("d"));
        assert_eq!(clean(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(clean(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(clean(Path::new(".")), PathBuf::from("."));
    }

    #[test]
    fn relative_paths_resolve_under_cwd() {
        assert_eq!(resolve_ok("/", "report.csv"), PathBuf::from("/srv/shuttle/alice/report.csv"));
        assert_eq!(resolve_ok("/inbox", "report.csv"), PathBuf::from("/srv/shuttle/alice/inbox/report.csv"));
    }

    #[test]
    fn virtual_absolute_paths_resolve_under_chroot() {
        assert_eq!(resolve_ok("/inbox", "/report.csv"), PathBuf::from("/srv/shuttle/alice/report.csv"));
    }

    #[test]
    fn server_absolute_paths_inside_chroot_pass_verbatim() {
        assert_eq!(
            resolve_ok("/", "/srv/shuttle/alice/report.csv"),
            PathBuf::from("/srv/shuttle/alice/report.csv")
        );
    }

    #[test]
    fn dotdot_cannot_escape() {
        // `../bob/evil.txt` from the chroot root lands back inside the
        // chroot, never in bob's directory.
        assert_eq!(
            resolve_ok("/", "../bob/evil.txt"),
            PathBuf::from("/srv/shuttle/alice/bob/evil.txt")
        );
        assert_eq!(
            resolve_ok("/", "../../../../etc/passwd"),
            PathBuf::from("/srv/shuttle/alice/etc/passwd")
        );
    }

    #[test]
    fn foreign_absolute_paths_are_confined() {
        assert_eq!(resolve_ok("/", "/etc/passwd"), PathBuf::from("/srv/shuttle/alice/etc/passwd"));
    }

    #[test]
    fn prefix_collision_does_not_pass_verbatim() {
        // `/srv/shuttle/alicia` shares a string prefix with alice's chroot
        // but is a different directory; it must be confined, not passed
        // through.
        let resolved = resolve(Path::new(CHROOT), Path::new("/"), "/srv/shuttle/alicia/x").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/shuttle/alice/srv/shuttle/alicia/x"));
    }

    #[test]
    fn to_virtual_inverts_resolution() {
        let real = resolve_ok("/inbox", "report.csv");
        assert_eq!(
            to_virtual(Path::new(CHROOT), &real).unwrap(),
            PathBuf::from("/inbox/report.csv")
        );
        assert!(to_virtual(Path::new(CHROOT), Path::new("/srv/shuttle/bob/x")).is_none());
    }
}
