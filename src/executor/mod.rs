//! Build-step executor
//!
//! [`Executor::run`] drives one build step end to end: acquire the root and
//! auxiliary mounts, resolve the user, make sure the working directory
//! exists, generate the spec, hand the task to the runtime and wait for it.
//! Everything acquired along the way is registered on a [`ReleaseChain`]
//! that is unwound when the run finishes, fails or is cancelled.

pub mod io;
pub mod request;

pub use io::{CaptureBuffer, ProcessInfo, Reader, Writer};
pub use request::{NetworkNamespace, ProcessMode, RunRequest, SecurityMode, Ulimit};

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, Result, ResultExt};
use crate::identity::{ChownOpt, HelperRunner, ResolvedIdentity};
use crate::mount::{HostLocalMounter, Mount, MountDescriptor, MountManager, Mountable, StubMountSource};
use crate::network::{HostNetworkFiles, NetworkFiles};
use crate::platform::{DefaultPlatform, IdentityContext, Platform, SpecContext};
use crate::release::ReleaseChain;
use async_trait::async_trait;
use oci_spec::runtime::Spec;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the runtime needs to start one container
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub spec: Spec,
    /// Root filesystem mounts
    pub rootfs: Vec<MountDescriptor>,
}

/// Container runtime the executor hands tasks to
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Start `task`, wire up the process streams and wait for the exit code.
    ///
    /// When `cancel` fires the implementation must kill the task, wait for
    /// it to exit and then return [`ExecutorError::Cancelled`]. The executor
    /// keeps every mount of the task until this call returns.
    async fn run(&self, task: Task, process: ProcessInfo, cancel: &CancellationToken) -> Result<i32>;
}

/// Runs build steps on one host platform
pub struct Executor<P: Platform = DefaultPlatform> {
    config: Arc<ExecutorConfig>,
    platform: P,
    mounts: MountManager,
    runtime: Arc<dyn RuntimeClient>,
    network: Arc<dyn NetworkFiles>,
}

impl<P: Platform> Executor<P> {
    /// Create an executor from explicit collaborators
    pub fn new(
        config: Arc<ExecutorConfig>,
        platform: P,
        mounts: MountManager,
        runtime: Arc<dyn RuntimeClient>,
        network: Arc<dyn NetworkFiles>,
    ) -> Self {
        Self {
            config,
            platform,
            mounts,
            runtime,
            network,
        }
    }

    /// Create an executor that mounts and writes network files below the
    /// configured state directory.
    ///
    /// Platforms whose mounts the host mounter cannot handle are rejected;
    /// build those with [`Executor::new`] and a matching [`LocalMounter`].
    ///
    /// [`LocalMounter`]: crate::mount::LocalMounter
    pub fn with_host_defaults(config: ExecutorConfig, platform: P, runtime: Arc<dyn RuntimeClient>) -> Result<Self> {
        config.validate()?;
        if !platform.host_local_mounts() {
            return Err(ExecutorError::UnsupportedFeature(format!(
                "host local mounts for {} roots, a LocalMounter must be supplied through Executor::new",
                platform.name()
            )));
        }
        let mounts = MountManager::new(Arc::new(HostLocalMounter::new(config.mounts_dir())));
        let network = Arc::new(HostNetworkFiles::new(config.net_dir(), config.host_resolv_conf.clone()));

        tracing::info!(root = %config.root.display(), platform = platform.name(), "executor ready");
        Ok(Self::new(Arc::new(config), platform, mounts, runtime, network))
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Run one process in a container rooted at `root`.
    ///
    /// Returns once the process has exited and every acquired resource has
    /// been released. A non-zero exit is reported as
    /// [`ExecutorError::ProcessExited`]. Release failures are logged and
    /// never replace the error of the run itself.
    pub async fn run(
        &self,
        id: Option<&str>,
        root: &Mount,
        aux: &[Mount],
        process: ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let mut chain = ReleaseChain::new();
        let result = self.run_inner(&id, &mut chain, root, aux, process, cancel).await;

        let failures = chain.release_all();
        if !failures.is_empty() {
            tracing::warn!(id = %id, failures = failures.len(), "run cleanup incomplete");
        }

        match &result {
            Ok(()) => tracing::info!(id = %id, "process finished"),
            Err(e) if e.is_cancelled() => tracing::info!(id = %id, "run cancelled"),
            Err(e) => tracing::debug!(id = %id, error = %e, cause = %e.innermost(), "run failed"),
        }
        result
    }

    async fn run_inner(
        &self,
        id: &str,
        chain: &mut ReleaseChain,
        root: &Mount,
        aux: &[Mount],
        process: ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = &process.request;

        let prepared = self
            .mounts
            .prepare_root(
                chain,
                root,
                aux,
                request.remove_mount_stubs_recursive,
                self.platform.materialize_root(),
                cancel,
            )
            .await
            .op("preparing mounts")?;

        let identity = {
            let ctx = IdentityContext {
                rootfs_path: prepared.rootfs_path.as_deref(),
                root: Some(Arc::clone(&prepared.root_mountable)),
                helper: self,
                cancel,
            };
            self.platform
                .resolve_identity(&request.user, &ctx)
                .await
                .op("resolving user")?
        };
        tracing::debug!(id = %id, user = %request.user, identity = ?identity, "user resolved");

        self.platform
            .ensure_cwd(&self.mounts, &prepared, &request.cwd, &identity)
            .op("ensuring working directory")?;

        let spec = {
            let ctx = SpecContext {
                id,
                request,
                identity: &identity,
                mounts: &prepared.mounts,
                config: &self.config,
                network: self.network.as_ref(),
            };
            self.platform.build_spec(&ctx, chain).op("generating spec")?
        };

        let task = Task {
            id: id.to_string(),
            spec,
            rootfs: self.platform.task_mounts(&prepared).op("collecting root mounts")?,
        };

        // The runtime owns the task until it returns, including its teardown
        // after cancellation, so mounts are only released after this await.
        tracing::info!(id = %id, args = ?request.args, "starting process");
        let code = self.runtime.run(task, process, cancel).await.op("running task")?;

        if code != 0 {
            return Err(ExecutorError::ProcessExited { code });
        }
        Ok(())
    }

    /// Resolve the owner requested by a file operation on `root`.
    ///
    /// Returns `None` when the operation keeps existing owners.
    pub async fn resolve_chown(
        &self,
        opt: Option<&ChownOpt>,
        root: Option<&Mount>,
        cancel: &CancellationToken,
    ) -> Result<Option<ResolvedIdentity>> {
        let opt = match opt {
            Some(opt) => opt,
            None => return Ok(None),
        };

        let mut chain = ReleaseChain::new();
        let result = self.resolve_chown_inner(&mut chain, opt, root, cancel).await;
        chain.release_all();
        result.op("resolving chown user")
    }

    async fn resolve_chown_inner(
        &self,
        chain: &mut ReleaseChain,
        opt: &ChownOpt,
        root: Option<&Mount>,
        cancel: &CancellationToken,
    ) -> Result<Option<ResolvedIdentity>> {
        let mut mountable: Option<Arc<dyn Mountable>> = None;
        let mut rootfs_path = None;

        if let Some(root) = root {
            let resolved = self.mounts.acquire(root, cancel).await?;
            if self.platform.materialize_root() {
                let (descriptors, release) = resolved
                    .mount()
                    .map_err(|e| ExecutorError::mount("mounting chown root", e))?;
                chain.acquire_boxed("chown root mount", release);
                rootfs_path = Some(self.mounts.local_mount(chain, "chown local mount", &descriptors)?);
            }
            mountable = Some(resolved);
        }

        let ctx = IdentityContext {
            rootfs_path: rootfs_path.as_deref(),
            root: mountable,
            helper: self,
            cancel,
        };
        self.platform.resolve_chown(Some(opt), &ctx).await
    }
}

#[async_trait]
impl<P: Platform> HelperRunner for Executor<P> {
    async fn run_helper(
        &self,
        root: Arc<dyn Mountable>,
        process: ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mount = StubMountSource::root_mount(root);
        self.run(None, &mount, &[], process, cancel).await
    }
}
