//! Filesystem helpers scoped to a container root
//!
//! `root_path` joins a container path onto a host directory the way the
//! container would see it: `..` never climbs above the root and symlinks are
//! resolved relative to the root, not the host.

use crate::identity::ResolvedIdentity;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Upper bound on symlinks followed while resolving one path
const MAX_SYMLINKS: usize = 255;

enum Part {
    Parent,
    Name(OsString),
}

fn split(path: &Path) -> Vec<Part> {
    path.components()
        .filter_map(|c| match c {
            Component::ParentDir => Some(Part::Parent),
            Component::Normal(name) => Some(Part::Name(name.to_os_string())),
            _ => None,
        })
        .collect()
}

fn is_missing(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

/// Resolve `path` inside `root`, following symlinks without escaping it.
///
/// Components that do not exist yet are joined lexically.
pub fn root_path(root: &Path, path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let mut pending: VecDeque<Part> = split(path.as_ref()).into();
    let mut resolved = PathBuf::new();
    let mut links = 0;

    while let Some(part) = pending.pop_front() {
        let name = match part {
            Part::Parent => {
                resolved.pop();
                continue;
            }
            Part::Name(name) => name,
        };

        let candidate = resolved.join(&name);
        let full = root.join(&candidate);
        let metadata = match fs::symlink_metadata(&full) {
            Ok(m) => m,
            Err(e) if is_missing(&e) => {
                resolved = candidate;
                continue;
            }
            Err(e) => return Err(e),
        };

        if !metadata.file_type().is_symlink() {
            resolved = candidate;
            continue;
        }

        links += 1;
        if links > MAX_SYMLINKS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("too many symlinks resolving {}", path.as_ref().display()),
            ));
        }

        let target = fs::read_link(&full)?;
        if target.has_root() {
            resolved = PathBuf::new();
        }
        for part in split(&target).into_iter().rev() {
            pending.push_front(part);
        }
    }

    Ok(root.join(resolved))
}

/// Create `path` and any missing parents, handing each newly created
/// directory to `owner`. Existing directories are left untouched.
pub fn mkdir_all_and_chown(path: &Path, mode: u32, owner: &ResolvedIdentity) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(path);
    while let Some(dir) = cursor {
        match fs::symlink_metadata(dir) {
            Ok(m) if m.is_dir() => break,
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", dir.display()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                missing.push(dir.to_path_buf());
                cursor = dir.parent();
            }
            Err(e) => return Err(e),
        }
    }

    for dir in missing.into_iter().rev() {
        create_dir(&dir, mode)?;
        chown(&dir, owner)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_dir(dir: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    match fs::DirBuilder::new().mode(mode).create(dir) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        other => other,
    }
}

#[cfg(not(unix))]
fn create_dir(dir: &Path, _mode: u32) -> io::Result<()> {
    match fs::create_dir(dir) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn chown(dir: &Path, owner: &ResolvedIdentity) -> io::Result<()> {
    match owner {
        ResolvedIdentity::Numeric { uid, gid, .. } => {
            std::os::unix::fs::chown(dir, Some(*uid), Some(*gid))
        }
        ResolvedIdentity::Sid { sid, .. } => {
            tracing::debug!(dir = %dir.display(), sid = %sid, "SID ownership is applied by the runtime");
            Ok(())
        }
    }
}

#[cfg(not(unix))]
fn chown(dir: &Path, owner: &ResolvedIdentity) -> io::Result<()> {
    tracing::debug!(dir = %dir.display(), owner = ?owner, "ownership is applied by the runtime");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_root_path_plain() {
        let root = tempdir().unwrap();
        let p = root_path(root.path(), "/work/dir").unwrap();
        assert_eq!(p, root.path().join("work/dir"));
    }

    #[test]
    fn test_root_path_clamps_parent() {
        let root = tempdir().unwrap();
        let p = root_path(root.path(), "/../../etc/passwd").unwrap();
        assert_eq!(p, root.path().join("etc/passwd"));
    }

    #[cfg(unix)]
    #[test]
    fn test_root_path_absolute_symlink_stays_inside() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("data")).unwrap();
        std::os::unix::fs::symlink("/etc", root.path().join("data/link")).unwrap();

        let p = root_path(root.path(), "/data/link/passwd").unwrap();
        assert_eq!(p, root.path().join("etc/passwd"));
    }

    #[cfg(unix)]
    #[test]
    fn test_root_path_relative_symlink_escape() {
        let root = tempdir().unwrap();
        std::os::unix::fs::symlink("../../../../tmp", root.path().join("up")).unwrap();

        let p = root_path(root.path(), "/up/x").unwrap();
        assert_eq!(p, root.path().join("tmp/x"));
    }

    #[cfg(unix)]
    #[test]
    fn test_root_path_symlink_loop() {
        let root = tempdir().unwrap();
        std::os::unix::fs::symlink("/b", root.path().join("a")).unwrap();
        std::os::unix::fs::symlink("/a", root.path().join("b")).unwrap();

        assert!(root_path(root.path(), "/a").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_mkdir_all_and_chown_creates_chain() {
        let root = tempdir().unwrap();
        let owner = ResolvedIdentity::numeric(unsafe { libc::getuid() }, unsafe { libc::getgid() });
        let target = root.path().join("a/b/c");

        mkdir_all_and_chown(&target, 0o755, &owner).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_mkdir_all_rejects_file() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("file"), b"x").unwrap();
        let owner = ResolvedIdentity::numeric(0, 0);

        assert!(mkdir_all_and_chown(&root.path().join("file"), 0o755, &owner).is_err());
    }
}
