//! Container spec generation
//!
//! A spec is assembled from a base document and an ordered list of
//! [`SpecOpt`]s. Each platform decides which options apply to a request and
//! in which order; the functions here build the individual options.

pub mod rootless;

pub use rootless::to_rootless;

use crate::config::IdMapping;
use crate::error::{ExecutorError, Result};
use crate::executor::{NetworkNamespace, Ulimit};
use crate::mount::AuxMount;
use oci_spec::runtime::{
    Capability, LinuxBuilder, LinuxCapabilities, LinuxCapabilitiesBuilder, LinuxIdMappingBuilder,
    LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, Mount, MountBuilder, PosixRlimitBuilder,
    PosixRlimitType, ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Modification applied to a spec under construction
pub type SpecOpt = Box<dyn FnOnce(&mut Spec) -> Result<()> + Send>;

/// Box a closure as a [`SpecOpt`]
pub fn opt<F>(f: F) -> SpecOpt
where
    F: FnOnce(&mut Spec) -> Result<()> + Send + 'static,
{
    Box::new(f)
}

/// PATH given to processes whose environment does not set one
pub const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where the trace collector socket appears inside POSIX containers
pub const TRACE_SOCKET_PATH: &str = "/dev/otel-grpc.sock";

/// Environment variable pointing instrumented tools at the collector
pub const TRACE_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

const SELINUX_PROCESS_LABEL: &str = "system_u:system_r:container_t:s0";
const SELINUX_MOUNT_LABEL: &str = "system_u:object_r:container_file_t:s0";

const MASKED_PATHS: [&str; 9] = [
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

const READONLY_PATHS: [&str; 6] = [
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Capabilities of a sandboxed build process
pub fn default_capabilities() -> HashSet<Capability> {
    [
        Capability::Chown,
        Capability::DacOverride,
        Capability::Fsetid,
        Capability::Fowner,
        Capability::Mknod,
        Capability::NetRaw,
        Capability::Setgid,
        Capability::Setuid,
        Capability::Setfcap,
        Capability::Setpcap,
        Capability::NetBindService,
        Capability::SysChroot,
        Capability::Kill,
        Capability::AuditWrite,
    ]
    .into_iter()
    .collect()
}

/// Every capability known to the kernel
pub fn all_capabilities() -> HashSet<Capability> {
    let mut caps = default_capabilities();
    caps.extend([
        Capability::DacReadSearch,
        Capability::LinuxImmutable,
        Capability::NetBroadcast,
        Capability::NetAdmin,
        Capability::IpcLock,
        Capability::IpcOwner,
        Capability::SysModule,
        Capability::SysRawio,
        Capability::SysPtrace,
        Capability::SysPacct,
        Capability::SysAdmin,
        Capability::SysBoot,
        Capability::SysNice,
        Capability::SysResource,
        Capability::SysTime,
        Capability::SysTtyConfig,
        Capability::Lease,
        Capability::AuditControl,
        Capability::MacOverride,
        Capability::MacAdmin,
        Capability::Syslog,
        Capability::WakeAlarm,
        Capability::BlockSuspend,
        Capability::AuditRead,
        Capability::Perfmon,
        Capability::Bpf,
        Capability::CheckpointRestore,
    ]);
    caps
}

fn capabilities(caps: HashSet<Capability>) -> Result<LinuxCapabilities> {
    Ok(LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .permitted(caps)
        .build()?)
}

fn mount(dest: &str, typ: &str, source: &str, options: &[&str]) -> Result<Mount> {
    Ok(MountBuilder::default()
        .destination(dest)
        .typ(typ)
        .source(source)
        .options(strings(options))
        .build()?)
}

/// Bind mount entry
pub fn bind_mount(dest: &str, source: &Path, readonly: bool) -> Result<Mount> {
    let options: &[&str] = if readonly { &["rbind", "ro"] } else { &["rbind"] };
    mount(dest, "bind", &source.to_string_lossy(), options)
}

fn namespace(typ: LinuxNamespaceType) -> Result<LinuxNamespace> {
    Ok(LinuxNamespaceBuilder::default().typ(typ).build()?)
}

/// Base document for POSIX containers.
///
/// Carries the standard pseudo filesystems, the default namespaces, the
/// sandbox capability set and the masked `/proc` entries.
pub fn posix_base_spec(args: &[String], env: &[String], cwd: &str) -> Result<Spec> {
    let mounts = vec![
        mount("/proc", "proc", "proc", &["nosuid", "noexec", "nodev"])?,
        mount("/dev", "tmpfs", "tmpfs", &["nosuid", "strictatime", "mode=755", "size=65536k"])?,
        mount(
            "/dev/pts",
            "devpts",
            "devpts",
            &["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"],
        )?,
        mount("/dev/shm", "tmpfs", "shm", &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"])?,
        mount("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        mount("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])?,
        mount(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        )?,
    ];

    let namespaces = vec![
        namespace(LinuxNamespaceType::Pid)?,
        namespace(LinuxNamespaceType::Ipc)?,
        namespace(LinuxNamespaceType::Uts)?,
        namespace(LinuxNamespaceType::Mount)?,
        namespace(LinuxNamespaceType::Network)?,
    ];

    let mut env = env.to_vec();
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.insert(0, DEFAULT_PATH_ENV.to_string());
    }

    let process = ProcessBuilder::default()
        .terminal(false)
        .user(UserBuilder::default().uid(0u32).gid(0u32).build()?)
        .args(args.to_vec())
        .env(env)
        .cwd(cwd)
        .capabilities(capabilities(default_capabilities())?)
        .no_new_privileges(false)
        .build()?;

    let linux = LinuxBuilder::default()
        .namespaces(namespaces)
        .masked_paths(strings(&MASKED_PATHS))
        .readonly_paths(strings(&READONLY_PATHS))
        .build()?;

    Ok(SpecBuilder::default()
        .version("1.0.2")
        .root(RootBuilder::default().path("rootfs").readonly(false).build()?)
        .mounts(mounts)
        .process(process)
        .linux(linux)
        .build()?)
}

/// Base document for Windows containers: a process and nothing else
pub fn windows_base_spec(args: &[String], env: &[String], cwd: &str) -> Result<Spec> {
    let process = ProcessBuilder::default()
        .terminal(false)
        .user(UserBuilder::default().build()?)
        .args(args.to_vec())
        .env(env.to_vec())
        .cwd(cwd)
        .build()?;

    let mut spec = SpecBuilder::default()
        .version("1.0.2")
        .mounts(Vec::<Mount>::new())
        .process(process)
        .build()?;
    spec.set_root(None);
    spec.set_linux(None);
    if let Some(mut process) = spec.process().clone() {
        process.set_capabilities(None);
        process.set_rlimits(None);
        process.set_no_new_privileges(None);
        spec.set_process(Some(process));
    }
    Ok(spec)
}

/// Apply `opts` to `base` in order
pub fn generate_spec(mut spec: Spec, opts: Vec<SpecOpt>) -> Result<Spec> {
    for opt in opts {
        opt(&mut spec)?;
    }
    Ok(spec)
}

fn edit_process<F>(spec: &mut Spec, f: F) -> Result<()>
where
    F: FnOnce(&mut oci_spec::runtime::Process) -> Result<()>,
{
    let mut process = spec
        .process()
        .clone()
        .ok_or_else(|| ExecutorError::Internal("spec has no process".to_string()))?;
    f(&mut process)?;
    spec.set_process(Some(process));
    Ok(())
}

fn edit_linux<F>(spec: &mut Spec, f: F) -> Result<()>
where
    F: FnOnce(&mut oci_spec::runtime::Linux) -> Result<()>,
{
    let mut linux = match spec.linux().clone() {
        Some(linux) => linux,
        None => LinuxBuilder::default().build()?,
    };
    f(&mut linux)?;
    spec.set_linux(Some(linux));
    Ok(())
}

fn edit_mounts<F>(spec: &mut Spec, f: F)
where
    F: FnOnce(&mut Vec<Mount>),
{
    let mut mounts = spec.mounts().clone().unwrap_or_default();
    f(&mut mounts);
    spec.set_mounts(Some(mounts));
}

/// Append a mount entry
pub fn with_mount(entry: Mount) -> SpecOpt {
    opt(move |spec| {
        edit_mounts(spec, |mounts| mounts.push(entry));
        Ok(())
    })
}

/// Append the resolved auxiliary mounts
pub fn with_aux_mounts(aux: &[AuxMount]) -> SpecOpt {
    let aux = aux.to_vec();
    opt(move |spec| {
        let mut entries = Vec::with_capacity(aux.len());
        for m in &aux {
            entries.push(
                MountBuilder::default()
                    .destination(m.dest.as_str())
                    .typ(m.descriptor.typ.as_str())
                    .source(m.descriptor.source.as_str())
                    .options(m.descriptor.options.clone())
                    .build()?,
            );
        }
        edit_mounts(spec, |mounts| mounts.extend(entries));
        Ok(())
    })
}

/// Set the hostname
pub fn with_hostname(hostname: &str) -> SpecOpt {
    let hostname = hostname.to_string();
    opt(move |spec| {
        spec.set_hostname(Some(hostname));
        Ok(())
    })
}

/// Set terminal allocation
pub fn with_terminal(tty: bool) -> SpecOpt {
    opt(move |spec| {
        edit_process(spec, |process| {
            process.set_terminal(Some(tty));
            Ok(())
        })
    })
}

/// Add an environment variable, replacing an existing value
pub fn with_env(key: &str, value: &str) -> SpecOpt {
    let entry = format!("{}={}", key, value);
    let prefix = format!("{}=", key);
    opt(move |spec| {
        edit_process(spec, |process| {
            let mut env = process.env().clone().unwrap_or_default();
            env.retain(|e| !e.starts_with(&prefix));
            env.push(entry);
            process.set_env(Some(env));
            Ok(())
        })
    })
}

/// Run as a numeric identity
pub fn with_numeric_user(uid: u32, gid: u32, additional_gids: Vec<u32>) -> SpecOpt {
    opt(move |spec| {
        edit_process(spec, |process| {
            let mut builder = UserBuilder::default().uid(uid).gid(gid);
            if !additional_gids.is_empty() {
                builder = builder.additional_gids(additional_gids);
            }
            process.set_user(builder.build()?);
            Ok(())
        })
    })
}

/// Run as a named Windows account
pub fn with_username(username: &str) -> SpecOpt {
    let username = username.to_string();
    opt(move |spec| {
        edit_process(spec, |process| {
            process.set_user(UserBuilder::default().username(username).build()?);
            Ok(())
        })
    })
}

/// Mark the root filesystem read-only
pub fn with_readonly_rootfs() -> SpecOpt {
    opt(|spec| {
        let mut root = match spec.root().clone() {
            Some(root) => root,
            None => RootBuilder::default().path("rootfs").build()?,
        };
        root.set_readonly(Some(true));
        spec.set_root(Some(root));
        Ok(())
    })
}

/// Grant every capability and drop seccomp and the masked paths
pub fn with_insecure() -> SpecOpt {
    opt(|spec| {
        edit_process(spec, |process| {
            process.set_capabilities(Some(capabilities(all_capabilities())?));
            Ok(())
        })?;
        edit_linux(spec, |linux| {
            linux.set_seccomp(None);
            linux.set_masked_paths(None);
            linux.set_readonly_paths(None);
            Ok(())
        })?;
        edit_mounts(spec, |mounts| {
            for m in mounts.iter_mut() {
                let dest = m.destination().clone();
                if dest == Path::new("/sys") || dest == Path::new("/sys/fs/cgroup") {
                    let options = m
                        .options()
                        .clone()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|o| o != "ro")
                        .collect();
                    m.set_options(Some(options));
                }
            }
        });
        Ok(())
    })
}

/// Attach an apparmor profile
pub fn with_apparmor_profile(profile: &str) -> SpecOpt {
    let profile = profile.to_string();
    opt(move |spec| {
        edit_process(spec, |process| {
            process.set_apparmor_profile(Some(profile));
            Ok(())
        })
    })
}

/// Label the process and its mounts for SELinux
pub fn with_selinux_labels() -> SpecOpt {
    opt(|spec| {
        edit_process(spec, |process| {
            process.set_selinux_label(Some(SELINUX_PROCESS_LABEL.to_string()));
            Ok(())
        })?;
        edit_linux(spec, |linux| {
            linux.set_mount_label(Some(SELINUX_MOUNT_LABEL.to_string()));
            Ok(())
        })
    })
}

/// Share the host PID namespace and bind the host `/proc`
pub fn with_host_pid() -> SpecOpt {
    opt(|spec| {
        edit_linux(spec, |linux| {
            let namespaces = linux
                .namespaces()
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|ns| ns.typ() != LinuxNamespaceType::Pid)
                .collect();
            linux.set_namespaces(Some(namespaces));
            Ok(())
        })?;
        let proc_bind = mount("/proc", "bind", "/proc", &["rbind"])?;
        edit_mounts(spec, |mounts| {
            mounts.retain(|m| m.destination() != Path::new("/proc"));
            mounts.insert(0, proc_bind);
        });
        Ok(())
    })
}

/// Select the network namespace
pub fn with_network(network: &NetworkNamespace) -> SpecOpt {
    let network = network.clone();
    opt(move |spec| {
        edit_linux(spec, |linux| {
            let mut namespaces: Vec<LinuxNamespace> = linux
                .namespaces()
                .clone()
                .unwrap_or_default()
                .into_iter()
                .filter(|ns| ns.typ() != LinuxNamespaceType::Network)
                .collect();
            match &network {
                NetworkNamespace::Host => {}
                NetworkNamespace::New => namespaces.push(namespace(LinuxNamespaceType::Network)?),
                NetworkNamespace::Path(path) => namespaces.push(
                    LinuxNamespaceBuilder::default()
                        .typ(LinuxNamespaceType::Network)
                        .path(path.clone())
                        .build()?,
                ),
            }
            linux.set_namespaces(Some(namespaces));
            Ok(())
        })
    })
}

/// Cgroup path for task `id` below `parent`.
///
/// A systemd slice ending in `:` is joined directly; anything else becomes
/// a path under `/<parent>/rune/`.
pub fn cgroups_path(parent: &str, id: &str) -> PathBuf {
    if parent.contains(".slice") && parent.ends_with(':') {
        PathBuf::from(format!("{}{}", parent, id))
    } else {
        Path::new("/").join(parent.trim_start_matches('/')).join("rune").join(id)
    }
}

/// Place the task below a cgroup parent
pub fn with_cgroup_parent(parent: &str, id: &str) -> SpecOpt {
    let path = cgroups_path(parent, id);
    opt(move |spec| {
        edit_linux(spec, |linux| {
            linux.set_cgroups_path(Some(path));
            Ok(())
        })
    })
}

/// Add a user namespace with the configured id maps
pub fn with_id_mapping(mapping: &IdMapping) -> SpecOpt {
    let mapping = mapping.clone();
    opt(move |spec| {
        let convert = |maps: &[crate::config::IdMap]| -> Result<Vec<oci_spec::runtime::LinuxIdMapping>> {
            maps.iter()
                .map(|m| {
                    Ok(LinuxIdMappingBuilder::default()
                        .container_id(m.container_id)
                        .host_id(m.host_id)
                        .size(m.size)
                        .build()?)
                })
                .collect()
        };
        let uid_maps = convert(&mapping.uid_maps)?;
        let gid_maps = convert(&mapping.gid_maps)?;

        edit_linux(spec, |linux| {
            let mut namespaces = linux.namespaces().clone().unwrap_or_default();
            if !namespaces.iter().any(|ns| ns.typ() == LinuxNamespaceType::User) {
                namespaces.push(namespace(LinuxNamespaceType::User)?);
            }
            linux.set_namespaces(Some(namespaces));
            linux.set_uid_mappings(Some(uid_maps));
            linux.set_gid_mappings(Some(gid_maps));
            Ok(())
        })
    })
}

/// Map a limit name such as `nofile` to its rlimit type
pub fn rlimit_type(name: &str) -> Option<PosixRlimitType> {
    let typ = match name.to_ascii_lowercase().trim_start_matches("rlimit_") {
        "as" => PosixRlimitType::RlimitAs,
        "core" => PosixRlimitType::RlimitCore,
        "cpu" => PosixRlimitType::RlimitCpu,
        "data" => PosixRlimitType::RlimitData,
        "fsize" => PosixRlimitType::RlimitFsize,
        "locks" => PosixRlimitType::RlimitLocks,
        "memlock" => PosixRlimitType::RlimitMemlock,
        "msgqueue" => PosixRlimitType::RlimitMsgqueue,
        "nice" => PosixRlimitType::RlimitNice,
        "nofile" => PosixRlimitType::RlimitNofile,
        "nproc" => PosixRlimitType::RlimitNproc,
        "rss" => PosixRlimitType::RlimitRss,
        "rtprio" => PosixRlimitType::RlimitRtprio,
        "rttime" => PosixRlimitType::RlimitRttime,
        "sigpending" => PosixRlimitType::RlimitSigpending,
        "stack" => PosixRlimitType::RlimitStack,
        _ => return None,
    };
    Some(typ)
}

/// Set process resource limits
pub fn with_rlimits(ulimits: &[Ulimit]) -> Result<SpecOpt> {
    let mut rlimits = Vec::with_capacity(ulimits.len());
    for u in ulimits {
        let typ = rlimit_type(&u.name).ok_or_else(|| {
            ExecutorError::UnsupportedFeature(format!("unknown rlimit {}", u.name))
        })?;
        rlimits.push(
            PosixRlimitBuilder::default()
                .typ(typ)
                .soft(u.soft)
                .hard(u.hard)
                .build()?,
        );
    }
    Ok(opt(move |spec| {
        edit_process(spec, |process| {
            process.set_rlimits(Some(rlimits));
            Ok(())
        })
    }))
}

/// Expose the trace collector socket at `target` and point the process at it
pub fn with_trace_socket(socket: &Path, target: &str, endpoint: &str) -> Result<Vec<SpecOpt>> {
    Ok(vec![
        with_mount(bind_mount(target, socket, false)?),
        with_env(TRACE_ENDPOINT_ENV, endpoint),
    ])
}
