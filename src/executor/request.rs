//! Run request model

use crate::network::HostIp;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Security mode of a build step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Default capability set, seccomp and masked paths
    #[default]
    Sandbox,
    /// Every capability, no seccomp or masked paths
    Insecure,
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMode::Sandbox => write!(f, "sandbox"),
            SecurityMode::Insecure => write!(f, "insecure"),
        }
    }
}

/// Process isolation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessMode {
    /// Own PID namespace
    #[default]
    Sandbox,
    /// Share the host PID namespace and `/proc`
    NoSandbox,
}

/// Network namespace of the process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkNamespace {
    /// Fresh namespace created by the runtime
    #[default]
    New,
    /// Host network
    Host,
    /// Existing namespace at a path
    Path(PathBuf),
}

/// POSIX resource limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ulimit {
    /// Limit name without the `RLIMIT_` prefix ("nofile", "nproc", ...)
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

impl Ulimit {
    pub fn new(name: &str, soft: u64, hard: u64) -> Self {
        Self {
            name: name.to_string(),
            soft,
            hard,
        }
    }
}

/// Description of one process execution.
///
/// Built by the scheduler and only read by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Command and arguments
    pub args: Vec<String>,
    /// Environment in `KEY=value` form
    #[serde(default)]
    pub env: Vec<String>,
    /// User reference: name, `uid[:gid]` or a built-in alias
    #[serde(default)]
    pub user: String,
    /// Working directory inside the container
    #[serde(default = "default_cwd")]
    pub cwd: String,
    /// Allocate a terminal
    #[serde(default)]
    pub tty: bool,
    /// Container hostname
    #[serde(default)]
    pub hostname: String,
    /// Additional hosts file entries
    #[serde(default)]
    pub extra_hosts: Vec<HostIp>,
    /// Mount the root filesystem read-only
    #[serde(default)]
    pub readonly_rootfs: bool,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub process_mode: ProcessMode,
    #[serde(default)]
    pub network: NetworkNamespace,
    /// Overrides the configured cgroup parent
    #[serde(default)]
    pub cgroup_parent: Option<String>,
    /// Overrides the configured apparmor profile
    #[serde(default)]
    pub apparmor_profile: Option<String>,
    #[serde(default)]
    pub ulimits: Vec<Ulimit>,
    /// Also remove missing parents of mount targets after the run
    #[serde(default)]
    pub remove_mount_stubs_recursive: bool,
}

fn default_cwd() -> String {
    "/".to_string()
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: Vec::new(),
            user: String::new(),
            cwd: default_cwd(),
            tty: false,
            hostname: String::new(),
            extra_hosts: Vec::new(),
            readonly_rootfs: false,
            security_mode: SecurityMode::default(),
            process_mode: ProcessMode::default(),
            network: NetworkNamespace::default(),
            cgroup_parent: None,
            apparmor_profile: None,
            ulimits: Vec::new(),
            remove_mount_stubs_recursive: false,
        }
    }
}

impl RunRequest {
    /// Create a request running `args`
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Set the user reference
    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: &str) -> Self {
        self.cwd = cwd.to_string();
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{}={}", key, value));
        self
    }

    /// Allocate a terminal
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Set the hostname
    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    /// Add a hosts file entry
    pub fn extra_host(mut self, host: HostIp) -> Self {
        self.extra_hosts.push(host);
        self
    }

    /// Mount the root filesystem read-only
    pub fn readonly_rootfs(mut self, readonly: bool) -> Self {
        self.readonly_rootfs = readonly;
        self
    }

    /// Set the security mode
    pub fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    /// Set the process isolation mode
    pub fn process_mode(mut self, mode: ProcessMode) -> Self {
        self.process_mode = mode;
        self
    }

    /// Set the network namespace
    pub fn network(mut self, network: NetworkNamespace) -> Self {
        self.network = network;
        self
    }

    /// Override the cgroup parent
    pub fn cgroup_parent(mut self, parent: &str) -> Self {
        self.cgroup_parent = Some(parent.to_string());
        self
    }

    /// Override the apparmor profile
    pub fn apparmor_profile(mut self, profile: &str) -> Self {
        self.apparmor_profile = Some(profile.to_string());
        self
    }

    /// Add a resource limit
    pub fn ulimit(mut self, ulimit: Ulimit) -> Self {
        self.ulimits.push(ulimit);
        self
    }

    /// Remove missing parents of mount targets too
    pub fn remove_mount_stubs_recursive(mut self, recursive: bool) -> Self {
        self.remove_mount_stubs_recursive = recursive;
        self
    }
}
