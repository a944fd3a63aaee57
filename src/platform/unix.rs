//! POSIX host variant

use super::{ensure_cwd_at, IdentityContext, Platform, SpecContext};
use crate::error::{ExecutorError, Result};
use crate::executor::{ProcessMode, SecurityMode};
use crate::identity::chown::resolve_chown_posix;
use crate::identity::{lookup_user, parse_uid_gid, ChownOpt, ResolvedIdentity};
use crate::mount::{MountDescriptor, MountManager, PreparedRoot};
use crate::network::DEFAULT_HOSTNAME;
use crate::release::ReleaseChain;
use crate::spec::{self, SpecOpt};
use async_trait::async_trait;
use oci_spec::runtime::Spec;
use std::path::Path;

/// Endpoint of the trace collector as seen from inside the container
const TRACE_ENDPOINT: &str = "unix:///dev/otel-grpc.sock";

/// Numeric identities, host-mounted root, full spec option table
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixPlatform;

impl UnixPlatform {
    fn rootfs<'a>(&self, prepared: &'a PreparedRoot) -> Result<&'a Path> {
        prepared
            .rootfs_path
            .as_deref()
            .ok_or_else(|| ExecutorError::Internal("root filesystem was not mounted".to_string()))
    }

    /// Options in application order: network files, security, process
    /// mode, id mapping, rlimits, identity, root, namespaces, cgroups,
    /// tracing, auxiliary mounts, terminal
    fn spec_opts(&self, ctx: &SpecContext<'_>, chain: &mut ReleaseChain) -> Result<Vec<SpecOpt>> {
        let req = ctx.request;
        let config = ctx.config;
        let mut opts = Vec::new();

        let resolv_conf = ctx.network.resolv_conf(config.dns.as_ref())?;
        let (hosts, release) = ctx.network.hosts_file(&req.extra_hosts, &req.hostname)?;
        if let Some(release) = release {
            chain.acquire_boxed("hosts file", release);
        }
        opts.push(spec::with_mount(spec::bind_mount("/etc/resolv.conf", &resolv_conf, false)?));
        opts.push(spec::with_mount(spec::bind_mount("/etc/hosts", &hosts, false)?));

        match req.security_mode {
            SecurityMode::Insecure => opts.push(spec::with_insecure()),
            SecurityMode::Sandbox => {
                let profile = req.apparmor_profile.as_ref().or(config.apparmor_profile.as_ref());
                if let Some(profile) = profile {
                    opts.push(spec::with_apparmor_profile(profile));
                }
                if config.selinux {
                    opts.push(spec::with_selinux_labels());
                }
            }
        }

        if req.process_mode == ProcessMode::NoSandbox {
            opts.push(spec::with_host_pid());
        }

        if let Some(mapping) = &config.id_mapping {
            opts.push(spec::with_id_mapping(mapping));
        }

        if !req.ulimits.is_empty() {
            opts.push(spec::with_rlimits(&req.ulimits)?);
        }

        match ctx.identity {
            ResolvedIdentity::Numeric {
                uid,
                gid,
                additional_gids,
            } => opts.push(spec::with_numeric_user(*uid, *gid, additional_gids.clone())),
            ResolvedIdentity::Sid { sid, .. } => {
                return Err(ExecutorError::UnsupportedFeature(format!(
                    "security identifier {} on a POSIX host",
                    sid
                )))
            }
        }

        if req.readonly_rootfs {
            opts.push(spec::with_readonly_rootfs());
        }

        opts.push(spec::with_network(&req.network));

        if let Some(parent) = req.cgroup_parent.as_ref().or(config.cgroup_parent.as_ref()) {
            opts.push(spec::with_cgroup_parent(parent, ctx.id));
        }

        if let Some(socket) = &config.trace_socket {
            opts.extend(spec::with_trace_socket(socket, spec::TRACE_SOCKET_PATH, TRACE_ENDPOINT)?);
        }

        opts.push(spec::with_aux_mounts(&ctx.mounts.aux));
        let hostname = if req.hostname.is_empty() {
            DEFAULT_HOSTNAME
        } else {
            req.hostname.as_str()
        };
        opts.push(spec::with_hostname(hostname));
        opts.push(spec::with_terminal(req.tty));

        Ok(opts)
    }
}

#[async_trait]
impl Platform for UnixPlatform {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn materialize_root(&self) -> bool {
        true
    }

    async fn resolve_identity(&self, user: &str, ctx: &IdentityContext<'_>) -> Result<ResolvedIdentity> {
        match ctx.rootfs_path {
            Some(rootfs) => lookup_user(rootfs, user),
            None => parse_uid_gid(user)
                .map(|(uid, gid)| ResolvedIdentity::numeric(uid, gid))
                .ok_or_else(|| ExecutorError::IdentityNotFound(format!("{} (no root filesystem to search)", user))),
        }
    }

    async fn resolve_chown(
        &self,
        opt: Option<&ChownOpt>,
        ctx: &IdentityContext<'_>,
    ) -> Result<Option<ResolvedIdentity>> {
        resolve_chown_posix(opt, ctx.rootfs_path)
    }

    fn ensure_cwd(
        &self,
        _mounts: &MountManager,
        prepared: &PreparedRoot,
        cwd: &str,
        identity: &ResolvedIdentity,
    ) -> Result<()> {
        ensure_cwd_at(self.rootfs(prepared)?, cwd, identity)
    }

    fn task_mounts(&self, prepared: &PreparedRoot) -> Result<Vec<MountDescriptor>> {
        let rootfs = self.rootfs(prepared)?.to_string_lossy().to_string();
        if cfg!(target_os = "freebsd") {
            Ok(vec![MountDescriptor::new("nullfs", &rootfs, Vec::new())])
        } else {
            Ok(vec![MountDescriptor::rbind(&rootfs, false)])
        }
    }

    fn build_spec(&self, ctx: &SpecContext<'_>, chain: &mut ReleaseChain) -> Result<Spec> {
        let req = ctx.request;
        let base = spec::posix_base_spec(&req.args, &req.env, &req.cwd)?;
        let opts = self.spec_opts(ctx, chain)?;
        let mut spec = spec::generate_spec(base, opts)?;

        if ctx.config.rootless {
            spec::to_rootless(&mut spec)?;
        }

        tracing::debug!(id = %ctx.id, platform = self.name(), "generated spec");
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, IdMap, IdMapping};
    use crate::executor::{NetworkNamespace, RunRequest, Ulimit};
    use crate::mount::{AuxMount, MountSet};
    use crate::network::HostNetworkFiles;
    use oci_spec::runtime::LinuxNamespaceType;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: ExecutorConfig,
        network: HostNetworkFiles,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let host_conf = dir.path().join("resolv.conf");
        fs::write(&host_conf, "nameserver 10.0.0.2\n").unwrap();
        let mut config = ExecutorConfig::new(dir.path().join("state"));
        config.host_resolv_conf = host_conf.clone();
        let network = HostNetworkFiles::new(config.net_dir(), host_conf);
        Fixture {
            _dir: dir,
            config,
            network,
        }
    }

    fn build(f: &Fixture, request: &RunRequest, identity: &ResolvedIdentity, chain: &mut ReleaseChain) -> Result<Spec> {
        let mounts = MountSet {
            root: vec![],
            aux: vec![AuxMount {
                dest: "/cache".to_string(),
                descriptor: MountDescriptor::rbind("/snap/cache", false),
            }],
        };
        let ctx = SpecContext {
            id: "step1",
            request,
            identity,
            mounts: &mounts,
            config: &f.config,
            network: &f.network,
        };
        UnixPlatform.build_spec(&ctx, chain)
    }

    fn mount_dests(spec: &Spec) -> Vec<String> {
        spec.mounts()
            .as_ref()
            .unwrap()
            .iter()
            .map(|m| m.destination().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_spec_for_app_user() {
        let f = fixture();
        let request = RunRequest::new(vec!["make".to_string()])
            .user("app")
            .cwd("/work")
            .extra_host(crate::network::HostIp::new("registry", "10.1.2.3".parse().unwrap()));
        let mut chain = ReleaseChain::new();

        let spec = build(&f, &request, &ResolvedIdentity::numeric(1000, 1000), &mut chain).unwrap();

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.user().uid(), 1000);
        assert_eq!(process.user().gid(), 1000);
        assert!(!spec.root().as_ref().unwrap().readonly().unwrap_or(true));
        assert_eq!(spec.hostname().as_deref(), Some(DEFAULT_HOSTNAME));

        let dests = mount_dests(&spec);
        assert!(dests.contains(&"/etc/resolv.conf".to_string()));
        assert!(dests.contains(&"/etc/hosts".to_string()));
        assert!(dests.contains(&"/cache".to_string()));

        // Per-run hosts file goes with the chain
        assert_eq!(chain.names(), vec!["hosts file"]);
        assert!(chain.release_all().is_empty());
    }

    #[test]
    fn test_spec_overrides_and_config() {
        let mut f = fixture();
        f.config.apparmor_profile = Some("rune-default".to_string());
        f.config.cgroup_parent = Some("builds".to_string());
        f.config.trace_socket = Some(PathBuf::from("/run/otel.sock"));

        let request = RunRequest::new(vec!["sh".to_string()])
            .apparmor_profile("custom")
            .cgroup_parent("system.slice:")
            .network(NetworkNamespace::Host)
            .ulimit(Ulimit::new("nofile", 64, 128))
            .readonly_rootfs(true);
        let mut chain = ReleaseChain::new();
        let spec = build(&f, &request, &ResolvedIdentity::numeric(0, 0), &mut chain).unwrap();

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.apparmor_profile().as_deref(), Some("custom"));
        assert!(process.rlimits().is_some());
        assert!(spec.root().as_ref().unwrap().readonly().unwrap_or(false));

        let linux = spec.linux().as_ref().unwrap();
        assert_eq!(linux.cgroups_path().as_deref(), Some(Path::new("system.slice:step1")));
        assert!(!linux
            .namespaces()
            .as_ref()
            .unwrap()
            .iter()
            .any(|ns| ns.typ() == LinuxNamespaceType::Network));
        assert!(mount_dests(&spec).contains(&spec::TRACE_SOCKET_PATH.to_string()));
    }

    #[test]
    fn test_spec_insecure_skips_apparmor() {
        let mut f = fixture();
        f.config.apparmor_profile = Some("rune-default".to_string());
        f.config.id_mapping = Some(IdMapping {
            uid_maps: vec![IdMap {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            gid_maps: vec![IdMap {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
        });

        let request = RunRequest::new(vec!["sh".to_string()])
            .security_mode(SecurityMode::Insecure)
            .process_mode(ProcessMode::NoSandbox);
        let mut chain = ReleaseChain::new();
        let spec = build(&f, &request, &ResolvedIdentity::numeric(0, 0), &mut chain).unwrap();

        assert!(spec.process().as_ref().unwrap().apparmor_profile().is_none());
        let kinds: Vec<_> = spec
            .linux()
            .as_ref()
            .unwrap()
            .namespaces()
            .as_ref()
            .unwrap()
            .iter()
            .map(|ns| ns.typ())
            .collect();
        assert!(kinds.contains(&LinuxNamespaceType::User));
        assert!(!kinds.contains(&LinuxNamespaceType::Pid));
    }

    #[test]
    fn test_spec_rootless() {
        let mut f = fixture();
        f.config.rootless = true;
        f.config.cgroup_parent = Some("builds".to_string());

        let request = RunRequest::new(vec!["sh".to_string()]);
        let mut chain = ReleaseChain::new();
        let spec = build(&f, &request, &ResolvedIdentity::numeric(0, 0), &mut chain).unwrap();
        assert!(spec.linux().as_ref().unwrap().cgroups_path().is_none());
    }

    #[test]
    fn test_spec_rejects_sid() {
        let f = fixture();
        let request = RunRequest::new(vec!["sh".to_string()]);
        let mut chain = ReleaseChain::new();
        let err = build(&f, &request, &ResolvedIdentity::container_user(), &mut chain).unwrap_err();
        assert!(matches!(err, ExecutorError::UnsupportedFeature(_)));
    }

    #[test]
    fn test_task_mounts_bind_rootfs() {
        let prepared = PreparedRoot {
            mounts: MountSet::default(),
            rootfs_path: Some(PathBuf::from("/var/lib/rune-executor/mounts/abc")),
            root_mountable: std::sync::Arc::new(NoMount),
        };
        let mounts = UnixPlatform.task_mounts(&prepared).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source, "/var/lib/rune-executor/mounts/abc");
        if !cfg!(target_os = "freebsd") {
            assert_eq!(mounts[0].options, vec!["rbind"]);
        }
    }

    struct NoMount;

    impl crate::mount::Mountable for NoMount {
        fn mount(&self) -> Result<(Vec<MountDescriptor>, crate::release::ReleaseFn)> {
            Err(ExecutorError::Internal("not mountable".to_string()))
        }
    }
}
