//! Windows host variant
//!
//! The root is never mounted on the host for the whole run; identities are
//! SIDs and anything the image defines has to be looked up from inside a
//! container. Most POSIX spec options have no Windows counterpart and are
//! rejected instead of silently dropped.

use super::{ensure_cwd_at, IdentityContext, Platform, SpecContext};
use crate::error::{ExecutorError, Result};
use crate::executor::{ProcessMode, SecurityMode};
use crate::identity::chown::resolve_chown_windows;
use crate::identity::{builtin_windows_identity, resolve_in_container, ChownOpt, ResolvedIdentity};
use crate::mount::{MountDescriptor, MountManager, PreparedRoot};
use crate::release::ReleaseChain;
use crate::spec::{self, SpecOpt};
use async_trait::async_trait;
use oci_spec::runtime::{MountBuilder, Spec};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the user lookup helper is mounted inside Windows containers
pub const HELPER_DESTINATION: &str = r"C:\Windows\System32\get-user-info.exe";

/// Named pipe of the trace collector inside the container
pub const TRACE_PIPE_PATH: &str = r"\\.\pipe\otel-grpc";

const TRACE_ENDPOINT: &str = "npipe:////./pipe/otel-grpc";

/// SID identities, transient root mounts, reduced spec option table
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsPlatform;

fn helper_source(configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_exe()
            .map_err(|e| ExecutorError::Internal(format!("getting executable path: {}", e))),
    }
}

fn with_helper_mount(source: &Path) -> Result<SpecOpt> {
    let entry = MountBuilder::default()
        .destination(HELPER_DESTINATION)
        .source(source)
        .build()?;
    Ok(spec::with_mount(entry))
}

impl WindowsPlatform {
    fn check_request(&self, ctx: &SpecContext<'_>) -> Result<()> {
        let req = ctx.request;
        if req.security_mode == SecurityMode::Insecure {
            return Err(ExecutorError::UnsupportedSecurityMode(
                "no support for running in insecure mode on Windows".to_string(),
            ));
        }
        if req.process_mode == ProcessMode::NoSandbox {
            return Err(ExecutorError::UnsupportedSecurityMode(
                "no support for running without process sandbox on Windows".to_string(),
            ));
        }
        if ctx.config.id_mapping.is_some() {
            return Err(ExecutorError::UnsupportedFeature(
                "no support for identity mapping on Windows".to_string(),
            ));
        }
        if !req.ulimits.is_empty() {
            return Err(ExecutorError::UnsupportedFeature(
                "no support for POSIX rlimits on Windows".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn materialize_root(&self) -> bool {
        false
    }

    // Layer mounts need the host's container storage driver
    fn host_local_mounts(&self) -> bool {
        false
    }

    async fn resolve_identity(&self, user: &str, ctx: &IdentityContext<'_>) -> Result<ResolvedIdentity> {
        if let Some(identity) = builtin_windows_identity(user) {
            return Ok(identity);
        }
        let root = ctx.root.clone().ok_or_else(|| {
            ExecutorError::IdentityNotFound(format!("{} (no root mount to search)", user))
        })?;
        resolve_in_container(ctx.helper, root, user, ctx.cancel).await
    }

    async fn resolve_chown(
        &self,
        opt: Option<&ChownOpt>,
        ctx: &IdentityContext<'_>,
    ) -> Result<Option<ResolvedIdentity>> {
        resolve_chown_windows(opt, ctx.root.clone(), ctx.helper, ctx.cancel).await
    }

    fn ensure_cwd(
        &self,
        mounts: &MountManager,
        prepared: &PreparedRoot,
        cwd: &str,
        identity: &ResolvedIdentity,
    ) -> Result<()> {
        let mut chain = ReleaseChain::new();
        let (descriptors, release) = prepared
            .root_mountable
            .mount()
            .map_err(|e| ExecutorError::mount("mounting root for working directory", e))?;
        chain.acquire_boxed("cwd root mount", release);

        let result = mounts
            .local_mount(&mut chain, "cwd local mount", &descriptors)
            .and_then(|path| ensure_cwd_at(&path, cwd, identity));

        for e in chain.release_all() {
            tracing::warn!(error = %e, "failed to release working directory mount");
        }
        result
    }

    fn task_mounts(&self, prepared: &PreparedRoot) -> Result<Vec<MountDescriptor>> {
        Ok(prepared.mounts.root.clone())
    }

    fn build_spec(&self, ctx: &SpecContext<'_>, _chain: &mut ReleaseChain) -> Result<Spec> {
        self.check_request(ctx)?;
        let req = ctx.request;

        let helper = helper_source(ctx.config.helper_binary.as_deref())?;
        let username = match ctx.identity {
            ResolvedIdentity::Sid { name, .. } => name.clone(),
            ResolvedIdentity::Numeric { .. } => {
                return Err(ExecutorError::UnsupportedFeature(
                    "numeric user on a Windows host".to_string(),
                ))
            }
        };

        let mut opts = vec![
            with_helper_mount(&helper)?,
            spec::with_username(&username),
            spec::with_aux_mounts(&ctx.mounts.aux),
            spec::with_terminal(req.tty),
        ];
        if let Some(socket) = &ctx.config.trace_socket {
            opts.extend(spec::with_trace_socket(socket, TRACE_PIPE_PATH, TRACE_ENDPOINT)?);
        }

        let base = spec::windows_base_spec(&req.args, &req.env, &req.cwd)?;
        let spec = spec::generate_spec(base, opts)?;
        tracing::debug!(id = %ctx.id, platform = self.name(), "generated spec");
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, IdMap, IdMapping};
    use crate::executor::{ProcessInfo, RunRequest, Ulimit};
    use crate::identity::{HelperRunner, CONTAINER_USER_SID};
    use crate::mount::{LocalMount, LocalMounter, MountSet, Mountable};
    use crate::network::HostNetworkFiles;
    use crate::release::ReleaseFn;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    struct Layers {
        mounted: Arc<AtomicUsize>,
    }

    impl Mountable for Layers {
        fn mount(&self) -> Result<(Vec<MountDescriptor>, ReleaseFn)> {
            self.mounted.fetch_add(1, Ordering::SeqCst);
            let mounted = Arc::clone(&self.mounted);
            let release: ReleaseFn = Box::new(move || -> Result<()> {
                mounted.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
            Ok((
                vec![MountDescriptor::new("windows-layer", r"C:\layers\1", vec![])],
                release,
            ))
        }
    }

    /// Mounts every request onto the same directory
    struct DirMounter {
        path: PathBuf,
        unmounted: Arc<AtomicUsize>,
    }

    impl LocalMounter for DirMounter {
        fn mount(&self, _mounts: &[MountDescriptor]) -> Result<LocalMount> {
            let unmounted = Arc::clone(&self.unmounted);
            Ok(LocalMount {
                path: self.path.clone(),
                unmount: Some(Box::new(move || -> Result<()> {
                    unmounted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            })
        }
    }

    /// Answers every lookup with a fixed record
    struct Helper {
        reply: &'static str,
        users: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl HelperRunner for Helper {
        async fn run_helper(
            &self,
            _root: Arc<dyn Mountable>,
            mut process: ProcessInfo,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.users.lock().unwrap().push(process.request.args.clone());
            if let Some(stdout) = process.stdout.as_mut() {
                stdout.write_all(self.reply.as_bytes()).await?;
            }
            Ok(())
        }
    }

    fn helper(reply: &'static str) -> Helper {
        Helper {
            reply,
            users: Mutex::new(Vec::new()),
        }
    }

    fn layers() -> (Arc<dyn Mountable>, Arc<AtomicUsize>) {
        let mounted = Arc::new(AtomicUsize::new(0));
        let root: Arc<dyn Mountable> = Arc::new(Layers {
            mounted: Arc::clone(&mounted),
        });
        (root, mounted)
    }

    #[tokio::test]
    async fn test_builtin_user_skips_helper() {
        let (root, _) = layers();
        let helper = helper("{}");
        let cancel = CancellationToken::new();
        let ctx = IdentityContext {
            rootfs_path: None,
            root: Some(root),
            helper: &helper,
            cancel: &cancel,
        };

        let identity = WindowsPlatform.resolve_identity("ContainerUser", &ctx).await.unwrap();
        assert_eq!(identity.sid_str(), Some(CONTAINER_USER_SID));
        assert!(helper.users.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_image_user_resolved_in_container() {
        let (root, mounted) = layers();
        let helper = helper(r#"{"UID":0,"GID":0,"SID":"S-1-5-21-1-2-3-1001"}"#);
        let cancel = CancellationToken::new();
        let ctx = IdentityContext {
            rootfs_path: None,
            root: Some(root),
            helper: &helper,
            cancel: &cancel,
        };

        let identity = WindowsPlatform.resolve_identity("builder", &ctx).await.unwrap();
        assert_eq!(identity, ResolvedIdentity::sid("S-1-5-21-1-2-3-1001", "builder"));
        assert_eq!(
            helper.users.lock().unwrap()[0],
            vec!["get-user-info".to_string(), "builder".to_string()]
        );
        assert_eq!(mounted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_chown_by_id_maps_to_administrator() {
        let (root, _) = layers();
        let helper = helper("{}");
        let cancel = CancellationToken::new();
        let ctx = IdentityContext {
            rootfs_path: None,
            root: Some(root),
            helper: &helper,
            cancel: &cancel,
        };
        let opt = ChownOpt {
            user: Some(crate::identity::UserOpt::ById(1000)),
            group: None,
        };

        let owner = WindowsPlatform.resolve_chown(Some(&opt), &ctx).await.unwrap();
        assert_eq!(owner, Some(ResolvedIdentity::container_administrator()));
    }

    #[test]
    fn test_ensure_cwd_uses_transient_mount() {
        let dir = tempdir().unwrap();
        let (root, mounted) = layers();
        let unmounted = Arc::new(AtomicUsize::new(0));
        let manager = MountManager::new(Arc::new(DirMounter {
            path: dir.path().to_path_buf(),
            unmounted: Arc::clone(&unmounted),
        }));
        let prepared = PreparedRoot {
            mounts: MountSet::default(),
            rootfs_path: None,
            root_mountable: root,
        };

        WindowsPlatform
            .ensure_cwd(&manager, &prepared, "/src/app", &ResolvedIdentity::container_administrator())
            .unwrap();

        assert!(dir.path().join("src").join("app").is_dir());
        assert_eq!(mounted.load(Ordering::SeqCst), 0);
        assert_eq!(unmounted.load(Ordering::SeqCst), 1);
    }

    struct SpecFixture {
        _dir: tempfile::TempDir,
        config: ExecutorConfig,
        network: HostNetworkFiles,
    }

    fn spec_fixture() -> SpecFixture {
        let dir = tempdir().unwrap();
        let mut config = ExecutorConfig::new(dir.path().join("state"));
        config.helper_binary = Some(PathBuf::from(r"C:\buildkit\rune-exec.exe"));
        let network = HostNetworkFiles::new(config.net_dir(), dir.path().join("resolv.conf"));
        SpecFixture {
            _dir: dir,
            config,
            network,
        }
    }

    fn build(f: &SpecFixture, request: &RunRequest) -> Result<Spec> {
        let identity = ResolvedIdentity::container_user();
        let mounts = MountSet::default();
        let ctx = SpecContext {
            id: "step1",
            request,
            identity: &identity,
            mounts: &mounts,
            config: &f.config,
            network: &f.network,
        };
        WindowsPlatform.build_spec(&ctx, &mut ReleaseChain::new())
    }

    #[test]
    fn test_spec_mounts_helper_and_sets_username() {
        let mut f = spec_fixture();
        f.config.trace_socket = Some(PathBuf::from("/run/otel.sock"));
        let request = RunRequest::new(vec!["cmd".to_string(), "/c".to_string(), "ver".to_string()]).tty(true);

        let spec = build(&f, &request).unwrap();
        assert!(spec.root().is_none());
        assert!(spec.linux().is_none());

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.user().username().as_deref(), Some("ContainerUser"));
        assert_eq!(process.terminal(), Some(true));

        let mounts = spec.mounts().as_ref().unwrap();
        let helper = mounts
            .iter()
            .find(|m| m.destination() == Path::new(HELPER_DESTINATION))
            .unwrap();
        assert_eq!(helper.source().as_deref(), Some(Path::new(r"C:\buildkit\rune-exec.exe")));
        assert!(mounts.iter().any(|m| m.destination() == Path::new(TRACE_PIPE_PATH)));
    }

    #[test]
    fn test_spec_rejects_posix_only_options() {
        let f = spec_fixture();
        let insecure = RunRequest::new(vec!["cmd".to_string()]).security_mode(SecurityMode::Insecure);
        assert!(matches!(build(&f, &insecure), Err(ExecutorError::UnsupportedSecurityMode(_))));

        let host_pid = RunRequest::new(vec!["cmd".to_string()]).process_mode(ProcessMode::NoSandbox);
        assert!(matches!(build(&f, &host_pid), Err(ExecutorError::UnsupportedSecurityMode(_))));

        let limits = RunRequest::new(vec!["cmd".to_string()]).ulimit(Ulimit::new("nofile", 1, 1));
        assert!(matches!(build(&f, &limits), Err(ExecutorError::UnsupportedFeature(_))));

        let mut f = spec_fixture();
        let map = IdMap {
            container_id: 0,
            host_id: 1000,
            size: 1,
        };
        f.config.id_mapping = Some(IdMapping {
            uid_maps: vec![map],
            gid_maps: vec![map],
        });
        let plain = RunRequest::new(vec!["cmd".to_string()]);
        assert!(matches!(build(&f, &plain), Err(ExecutorError::UnsupportedFeature(_))));
    }
}
