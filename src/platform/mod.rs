//! Platform variants of the executor
//!
//! POSIX hosts and Windows hosts disagree on almost every step of a run:
//! how identities look, whether the root is mounted on the host, which spec
//! options exist. Each host kind is one [`Platform`] implementation; the
//! executor is generic over it and never branches on the host itself.

pub mod unix;
pub mod windows;

pub use unix::UnixPlatform;
pub use windows::WindowsPlatform;

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result};
use crate::executor::RunRequest;
use crate::fsutil::{mkdir_all_and_chown, root_path};
use crate::identity::{ChownOpt, HelperRunner, ResolvedIdentity};
use crate::mount::{MountDescriptor, MountManager, MountSet, Mountable, PreparedRoot};
use crate::network::NetworkFiles;
use crate::release::ReleaseChain;
use async_trait::async_trait;
use oci_spec::runtime::Spec;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Platform of the host this binary was built for
#[cfg(windows)]
pub type DefaultPlatform = WindowsPlatform;
/// Platform of the host this binary was built for
#[cfg(not(windows))]
pub type DefaultPlatform = UnixPlatform;

/// Mode of directories created for a missing working directory
pub const CWD_MODE: u32 = 0o755;

/// What identity resolution may look at
pub struct IdentityContext<'a> {
    /// Host path of the root filesystem, if it was materialized
    pub rootfs_path: Option<&'a Path>,
    /// The resolved root mount, absent for file operations without one
    pub root: Option<Arc<dyn Mountable>>,
    /// Execution path for in-container helpers
    pub helper: &'a dyn HelperRunner,
    pub cancel: &'a CancellationToken,
}

/// Inputs of spec generation
pub struct SpecContext<'a> {
    pub id: &'a str,
    pub request: &'a RunRequest,
    pub identity: &'a ResolvedIdentity,
    pub mounts: &'a MountSet,
    pub config: &'a ExecutorConfig,
    pub network: &'a dyn NetworkFiles,
}

/// Host-specific steps of a run
#[async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Short platform name for logs
    fn name(&self) -> &'static str;

    /// Whether the root is mounted on the host for the whole run
    fn materialize_root(&self) -> bool;

    /// Whether [`HostLocalMounter`](crate::mount::HostLocalMounter) can
    /// materialize the mounts this platform hands out
    fn host_local_mounts(&self) -> bool {
        true
    }

    /// Resolve the user reference of a request
    async fn resolve_identity(&self, user: &str, ctx: &IdentityContext<'_>) -> Result<ResolvedIdentity>;

    /// Resolve the owner requested by a file operation
    async fn resolve_chown(
        &self,
        opt: Option<&ChownOpt>,
        ctx: &IdentityContext<'_>,
    ) -> Result<Option<ResolvedIdentity>>;

    /// Create the working directory when it is missing
    fn ensure_cwd(
        &self,
        mounts: &MountManager,
        prepared: &PreparedRoot,
        cwd: &str,
        identity: &ResolvedIdentity,
    ) -> Result<()>;

    /// Root filesystem mounts handed to the runtime
    fn task_mounts(&self, prepared: &PreparedRoot) -> Result<Vec<MountDescriptor>>;

    /// Assemble the spec, registering per-run files on `chain`
    fn build_spec(&self, ctx: &SpecContext<'_>, chain: &mut ReleaseChain) -> Result<Spec>;
}

/// Create `cwd` below `rootfs` owned by `identity` unless it exists.
///
/// An existing working directory is left exactly as it is.
pub fn ensure_cwd_at(rootfs: &Path, cwd: &str, identity: &ResolvedIdentity) -> Result<()> {
    let path = root_path(rootfs, cwd).map_err(|e| ExecutorError::InvalidWorkingDirectory {
        path: cwd.to_string(),
        reason: e.to_string(),
    })?;

    match fs::metadata(&path) {
        Ok(m) if m.is_dir() => Ok(()),
        Ok(_) => Err(ExecutorError::InvalidWorkingDirectory {
            path: cwd.to_string(),
            reason: "not a directory".to_string(),
        }),
        Err(_) => {
            mkdir_all_and_chown(&path, CWD_MODE, identity)
                .map_err(|e| ExecutorError::WorkingDirectoryCreateFailed {
                    path: path.clone(),
                    source: e,
                })?;
            tracing::debug!(cwd = %cwd, path = %path.display(), owner = ?identity, "created working directory");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[cfg(unix)]
    fn current_owner() -> ResolvedIdentity {
        ResolvedIdentity::numeric(unsafe { libc::geteuid() }, unsafe { libc::getegid() })
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_cwd_creates_with_owner() {
        use std::os::unix::fs::MetadataExt;

        let root = tempdir().unwrap();
        let owner = current_owner();
        ensure_cwd_at(root.path(), "/work/sub", &owner).unwrap();

        let meta = fs::metadata(root.path().join("work/sub")).unwrap();
        assert!(meta.is_dir());
        assert_eq!(Some((meta.uid(), meta.gid())), owner.uid_gid());
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_cwd_creates_owned_by_user_as_root() {
        use std::os::unix::fs::MetadataExt;

        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        let root = tempdir().unwrap();
        ensure_cwd_at(root.path(), "/work", &ResolvedIdentity::numeric(1000, 1000)).unwrap();

        let meta = fs::metadata(root.path().join("work")).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (1000, 1000));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_cwd_existing_untouched() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempdir().unwrap();
        let work = root.path().join("work");
        fs::create_dir(&work).unwrap();
        fs::set_permissions(&work, fs::Permissions::from_mode(0o700)).unwrap();

        // An owner the test user could never chown to
        ensure_cwd_at(root.path(), "/work", &ResolvedIdentity::numeric(4242, 4242)).unwrap();
        assert_eq!(fs::metadata(&work).unwrap().permissions().mode() & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_cwd_rejects_file() {
        let root = tempdir().unwrap();
        fs::write(root.path().join("work"), "").unwrap();

        let err = ensure_cwd_at(root.path(), "/work", &current_owner()).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidWorkingDirectory { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_cwd_symlink_stays_in_root() {
        let root = tempdir().unwrap();
        std::os::unix::fs::symlink("/../../../tmp-escape", root.path().join("work")).unwrap();

        ensure_cwd_at(root.path(), "/work", &current_owner()).unwrap();
        assert!(root.path().join("tmp-escape").is_dir());
    }
}
