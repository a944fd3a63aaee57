//! Mount lifecycle of a single run
//!
//! `MountManager::prepare_root` turns the root mount reference and the
//! auxiliary mounts of a request into descriptors for the runtime and, where
//! the platform needs one, a host path of the root filesystem. Every acquired
//! resource is registered on the caller's [`ReleaseChain`] as soon as it
//! exists, in the order root mount, local mount, stub cleanup, auxiliary
//! mounts.

use super::{LocalMounter, Mount, MountDescriptor, Mountable};
use crate::error::{ExecutorError, Result};
use crate::fsutil::root_path;
use crate::release::ReleaseChain;
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Files the network setup may bind over inside the container
const NETWORK_FILE_TARGETS: [&str; 2] = ["/etc/resolv.conf", "/etc/hosts"];

/// Auxiliary mount resolved to a single descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxMount {
    /// Destination inside the container
    pub dest: String,
    pub descriptor: MountDescriptor,
}

/// Descriptors handed to the runtime for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountSet {
    /// Descriptors of the root filesystem
    pub root: Vec<MountDescriptor>,
    /// Auxiliary mounts in request order
    pub aux: Vec<AuxMount>,
}

/// Result of preparing the root of a run
pub struct PreparedRoot {
    pub mounts: MountSet,
    /// Host path of the root filesystem, when it was materialized
    pub rootfs_path: Option<PathBuf>,
    /// The resolved root mountable, reused by in-container helpers
    pub root_mountable: Arc<dyn Mountable>,
}

impl std::fmt::Debug for PreparedRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRoot")
            .field("mounts", &self.mounts)
            .field("rootfs_path", &self.rootfs_path)
            .finish()
    }
}

fn lstat_missing(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(_) => false,
        Err(e) => e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR),
    }
}

/// Placeholder paths the runtime will create to satisfy mount targets
/// missing from the image.
///
/// Taken before the container runs; `cleanup` removes whatever is still an
/// empty placeholder afterwards so the snapshot does not gain stray files.
#[derive(Debug, Clone, Default)]
pub struct MountStubs {
    root: PathBuf,
    paths: Vec<PathBuf>,
}

impl MountStubs {
    /// Record which mount targets do not exist under `root`.
    ///
    /// With `recursive`, missing parents are recorded as well, deepest
    /// first, up to the first existing ancestor.
    pub fn snapshot<'a>(root: &Path, dests: impl IntoIterator<Item = &'a str>, recursive: bool) -> Self {
        let mut paths = Vec::new();
        let mut targets: Vec<&str> = NETWORK_FILE_TARGETS.to_vec();
        targets.extend(dests);

        for dest in targets {
            let dest = Path::new("/").join(dest);
            if dest == Path::new("/") {
                continue;
            }
            let mut real = match root_path(root, &dest) {
                Ok(p) => p,
                Err(_) => continue,
            };

            while lstat_missing(&real) {
                paths.push(real.clone());
                if !recursive {
                    break;
                }
                let parent = match real.parent() {
                    Some(parent) if parent != real.as_path() && parent != root => parent.to_path_buf(),
                    _ => break,
                };
                real = parent;
            }
        }

        Self {
            root: root.to_path_buf(),
            paths,
        }
    }

    /// Recorded placeholder paths
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Remove placeholders that are still empty.
    ///
    /// Parent directory times are restored after each removal so that the
    /// resulting snapshot stays reproducible. Problems are logged, never
    /// returned.
    pub fn cleanup(&self) {
        for recorded in &self.paths {
            let relative = recorded.strip_prefix(&self.root).unwrap_or(recorded);
            let path = match root_path(&self.root, Path::new("/").join(relative)) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let metadata = match fs::symlink_metadata(&path) {
                Ok(m) => m,
                Err(_) => continue,
            };

            if metadata.is_dir() {
                match fs::read_dir(&path) {
                    Ok(mut entries) => {
                        if entries.next().is_some() {
                            continue;
                        }
                    }
                    Err(_) => continue,
                }
            } else if metadata.len() != 0 {
                continue;
            }

            let parent = match path.parent() {
                Some(p) => p,
                None => continue,
            };
            let parent_meta = match fs::metadata(parent) {
                Ok(m) => m,
                Err(_) => continue,
            };
            let atime = FileTime::from_last_access_time(&parent_meta);
            let mtime = FileTime::from_last_modification_time(&parent_meta);

            let removed = if metadata.is_dir() {
                fs::remove_dir(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove mount stub");
            }
            if let Err(e) = filetime::set_file_times(parent, atime, mtime) {
                tracing::warn!(path = %parent.display(), error = %e, "failed to restore mount stub parent times");
            }
        }
    }
}

/// Acquires the mounts of a run and registers their release
#[derive(Clone)]
pub struct MountManager {
    local: Arc<dyn LocalMounter>,
}

impl MountManager {
    /// Create a manager that materializes mounts with `local`
    pub fn new(local: Arc<dyn LocalMounter>) -> Self {
        Self { local }
    }

    /// Acquire the root mount and the auxiliary mounts of a run.
    ///
    /// With `materialize` the root is also mounted on the host and its
    /// missing mount targets are recorded as stubs. On error the actions
    /// registered so far stay on `chain` for the caller to release.
    pub async fn prepare_root(
        &self,
        chain: &mut ReleaseChain,
        root: &Mount,
        aux: &[Mount],
        recursive_stubs: bool,
        materialize: bool,
        cancel: &CancellationToken,
    ) -> Result<PreparedRoot> {
        let root_mountable = acquire_source(root, cancel).await?;
        let (root_mounts, release) = root_mountable
            .mount()
            .map_err(|e| ExecutorError::mount("mounting root", e))?;
        chain.acquire_boxed("root mount", release);
        tracing::debug!(mounts = root_mounts.len(), "root mount acquired");

        let mut rootfs_path = None;
        if materialize {
            let path = self.local_mount(chain, "local mount", &root_mounts)?;

            let stubs = MountStubs::snapshot(&path, aux.iter().map(|m| m.dest.as_str()), recursive_stubs);
            tracing::debug!(stubs = stubs.paths().len(), rootfs = %path.display(), "recorded mount stubs");
            chain.acquire("mount stubs", move || {
                stubs.cleanup();
                Ok(())
            });
            rootfs_path = Some(path);
        }

        let aux = self.resolve_aux(chain, aux, cancel).await?;

        Ok(PreparedRoot {
            mounts: MountSet {
                root: root_mounts,
                aux,
            },
            rootfs_path,
            root_mountable,
        })
    }

    /// Resolve auxiliary mounts to one descriptor each.
    ///
    /// A single descriptor without a selector is passed through. Selectors
    /// and multi-descriptor sources are mounted on the host first and
    /// exposed as a bind of the selected path.
    pub async fn resolve_aux(
        &self,
        chain: &mut ReleaseChain,
        aux: &[Mount],
        cancel: &CancellationToken,
    ) -> Result<Vec<AuxMount>> {
        let mut resolved = Vec::with_capacity(aux.len());

        for m in aux {
            let mountable = acquire_source(m, cancel).await?;
            let (mounts, release) = mountable
                .mount()
                .map_err(|e| ExecutorError::mount(format!("mounting {}", m.dest), e))?;
            chain.acquire_boxed(format!("aux mount {}", m.dest), release);

            let descriptor = match mounts.as_slice() {
                [single] if m.selector.is_empty() => {
                    let mut descriptor = single.clone();
                    if m.readonly && !descriptor.is_readonly() {
                        descriptor.options.push("ro".to_string());
                    }
                    descriptor
                }
                _ => {
                    let base = self.local_mount(chain, &format!("local mount {}", m.dest), &mounts)?;
                    let selected = root_path(&base, &m.selector).map_err(|e| {
                        ExecutorError::mount(format!("selecting {} in {}", m.selector, m.dest), e)
                    })?;
                    MountDescriptor::rbind(&selected.to_string_lossy(), m.readonly)
                }
            };

            tracing::debug!(dest = %m.dest, source = %descriptor.source, "aux mount acquired");
            resolved.push(AuxMount {
                dest: m.dest.clone(),
                descriptor,
            });
        }

        Ok(resolved)
    }

    /// Resolve the source of `m` into a mountable, honouring `cancel`
    pub async fn acquire(&self, m: &Mount, cancel: &CancellationToken) -> Result<Arc<dyn Mountable>> {
        acquire_source(m, cancel).await
    }

    /// Materialize `mounts` on the host, registering the unmount as `name`
    pub fn local_mount(&self, chain: &mut ReleaseChain, name: &str, mounts: &[MountDescriptor]) -> Result<PathBuf> {
        let local = self
            .local
            .mount(mounts)
            .map_err(|e| ExecutorError::mount(name.to_string(), e))?;
        if let Some(unmount) = local.unmount {
            chain.acquire_boxed(name, unmount);
        }
        tracing::debug!(path = %local.path.display(), "local mount ready");
        Ok(local.path)
    }
}

async fn acquire_source(m: &Mount, cancel: &CancellationToken) -> Result<Arc<dyn Mountable>> {
    let result = tokio::select! {
        result = m.src.mount(m.readonly) => result,
        _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
    };
    result.map_err(|e| ExecutorError::mount(format!("acquiring mount source for {}", m.dest), e))
}
