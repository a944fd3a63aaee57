//! Executor configuration
//!
//! Built once when the executor is created and shared by every run; no
//! request changes it.

use crate::error::{ExecutorError, Result};
use crate::network::DnsConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One contiguous id range mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// User namespace id mappings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    #[serde(default)]
    pub uid_maps: Vec<IdMap>,
    #[serde(default)]
    pub gid_maps: Vec<IdMap>,
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// State directory for generated files and temporary mount points
    pub root: PathBuf,
    /// DNS overrides for resolv.conf
    #[serde(default)]
    pub dns: Option<DnsConfig>,
    /// Apparmor profile attached to every process
    #[serde(default)]
    pub apparmor_profile: Option<String>,
    /// Label processes for SELinux
    #[serde(default)]
    pub selinux: bool,
    /// Run without root privileges on the host
    #[serde(default)]
    pub rootless: bool,
    /// Cgroup parent of every task
    #[serde(default)]
    pub cgroup_parent: Option<String>,
    /// Host socket of the trace collector
    #[serde(default)]
    pub trace_socket: Option<PathBuf>,
    #[serde(default)]
    pub id_mapping: Option<IdMapping>,
    /// Host path of the user lookup helper for Windows images
    #[serde(default)]
    pub helper_binary: Option<PathBuf>,
    /// Host resolver configuration
    #[serde(default = "default_resolv_conf")]
    pub host_resolv_conf: PathBuf,
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("rune-executor");

        Self {
            root,
            dns: None,
            apparmor_profile: None,
            selinux: false,
            rootless: false,
            cgroup_parent: None,
            trace_socket: None,
            id_mapping: None,
            helper_binary: None,
            host_resolv_conf: default_resolv_conf(),
        }
    }
}

impl ExecutorConfig {
    /// Create a configuration rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            ..Default::default()
        }
    }

    /// Load a configuration file; `.yaml`/`.yml` are read as YAML,
    /// anything else as JSON
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExecutorError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: ExecutorConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;

        tracing::debug!(path = %path.display(), root = %config.root.display(), "loaded executor config");
        Ok(config)
    }

    /// Check the configuration for values no run could work with
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(ExecutorError::InvalidConfig(format!(
                "root must be absolute: {}",
                self.root.display()
            )));
        }

        if let Some(mapping) = &self.id_mapping {
            if mapping.uid_maps.is_empty() || mapping.gid_maps.is_empty() {
                return Err(ExecutorError::InvalidConfig(
                    "id mapping needs both uid and gid maps".to_string(),
                ));
            }
            if let Some(m) = mapping
                .uid_maps
                .iter()
                .chain(&mapping.gid_maps)
                .find(|m| m.size == 0)
            {
                return Err(ExecutorError::InvalidConfig(format!(
                    "empty id map for container id {}",
                    m.container_id
                )));
            }
        }

        if let Some(socket) = &self.trace_socket {
            if !socket.is_absolute() {
                return Err(ExecutorError::InvalidConfig(format!(
                    "trace socket must be absolute: {}",
                    socket.display()
                )));
            }
        }

        Ok(())
    }

    /// Directory for generated network files
    pub fn net_dir(&self) -> PathBuf {
        self.root.join("net")
    }

    /// Directory for temporary mount points
    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join("mounts")
    }
}
