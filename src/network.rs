//! Resolver and hosts files bound into build containers

use crate::error::{ExecutorError, Result};
use crate::release::ReleaseFn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Hostname used when the request does not set one
pub const DEFAULT_HOSTNAME: &str = "runesandbox";

/// Public resolvers used when the host only lists loopback nameservers
const FALLBACK_NAMESERVERS: [&str; 4] = [
    "8.8.8.8",
    "8.8.4.4",
    "2001:4860:4860::8888",
    "2001:4860:4860::8844",
];

/// Extra hosts file entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostIp {
    pub host: String,
    pub ip: IpAddr,
}

impl HostIp {
    pub fn new(host: &str, ip: IpAddr) -> Self {
        Self {
            host: host.to_string(),
            ip,
        }
    }
}

/// DNS overrides applied on top of the host resolver configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
    #[serde(default)]
    pub search_domains: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Host-side files for container networking
pub trait NetworkFiles: Send + Sync {
    /// Path of the resolv.conf to bind into containers
    fn resolv_conf(&self, dns: Option<&DnsConfig>) -> Result<PathBuf>;

    /// Hosts file for one run, with the release action for per-run files
    fn hosts_file(&self, extra_hosts: &[HostIp], hostname: &str) -> Result<(PathBuf, Option<ReleaseFn>)>;
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ResolvConf {
    nameservers: Vec<String>,
    search: Vec<String>,
    options: Vec<String>,
}

impl ResolvConf {
    fn parse(content: &str) -> Self {
        let mut conf = ResolvConf::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => conf.nameservers.extend(fields.next().map(str::to_string)),
                Some("search") | Some("domain") => conf.search = fields.map(str::to_string).collect(),
                Some("options") => conf.options.extend(fields.map(str::to_string)),
                _ => {}
            }
        }
        conf
    }

    fn drop_loopback(&mut self) {
        self.nameservers.retain(|ns| match ns.parse::<IpAddr>() {
            Ok(ip) => !ip.is_loopback(),
            Err(_) => true,
        });
    }

    fn apply(&mut self, dns: &DnsConfig) {
        if !dns.nameservers.is_empty() {
            self.nameservers = dns.nameservers.iter().map(IpAddr::to_string).collect();
        }
        if !dns.search_domains.is_empty() {
            self.search = dns.search_domains.clone();
        }
        if !dns.options.is_empty() {
            self.options = dns.options.clone();
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {}\n", ns));
        }
        if !self.search.is_empty() {
            out.push_str(&format!("search {}\n", self.search.join(" ")));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Render the hosts file for `hostname` and `extra_hosts`
pub fn render_hosts(extra_hosts: &[HostIp], hostname: &str) -> String {
    let hostname = if hostname.is_empty() {
        DEFAULT_HOSTNAME
    } else {
        hostname
    };
    let mut out = format!(
        "127.0.0.1\tlocalhost {}\n::1\tlocalhost ip6-localhost ip6-loopback\n",
        hostname
    );
    for entry in extra_hosts {
        out.push_str(&format!("{}\t{}\n", entry.ip, entry.host));
    }
    out
}

/// Network files derived from the host and kept under a state directory
pub struct HostNetworkFiles {
    root: PathBuf,
    host_resolv_conf: PathBuf,
    lock: Mutex<()>,
}

impl HostNetworkFiles {
    /// Keep generated files under `root`, reading the host resolver
    /// configuration from `host_resolv_conf`
    pub fn new(root: PathBuf, host_resolv_conf: PathBuf) -> Self {
        Self {
            root,
            host_resolv_conf,
            lock: Mutex::new(()),
        }
    }

    fn write_if_changed(&self, path: &Path, content: &str) -> Result<bool> {
        match fs::read(path) {
            Ok(existing) if digest(&existing) == digest(content.as_bytes()) => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(true)
    }
}

impl NetworkFiles for HostNetworkFiles {
    fn resolv_conf(&self, dns: Option<&DnsConfig>) -> Result<PathBuf> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| ExecutorError::Internal("network files lock poisoned".to_string()))?;

        let host = match fs::read_to_string(&self.host_resolv_conf) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut conf = ResolvConf::parse(&host);
        conf.drop_loopback();
        if let Some(dns) = dns {
            conf.apply(dns);
        }
        if conf.nameservers.is_empty() {
            tracing::info!("no usable nameservers on host, using public resolvers");
            conf.nameservers = FALLBACK_NAMESERVERS.iter().map(|s| s.to_string()).collect();
        }

        fs::create_dir_all(&self.root)?;
        let path = self.root.join("resolv.conf");
        if self.write_if_changed(&path, &conf.render())? {
            tracing::debug!(path = %path.display(), "resolv.conf updated");
        }
        Ok(path)
    }

    fn hosts_file(&self, extra_hosts: &[HostIp], hostname: &str) -> Result<(PathBuf, Option<ReleaseFn>)> {
        fs::create_dir_all(&self.root)?;
        let content = render_hosts(extra_hosts, hostname);

        if extra_hosts.is_empty() && hostname.is_empty() {
            let _guard = self
                .lock
                .lock()
                .map_err(|_| ExecutorError::Internal("network files lock poisoned".to_string()))?;
            let path = self.root.join("hosts");
            self.write_if_changed(&path, &content)?;
            return Ok((path, None));
        }

        let path = self
            .root
            .join(format!("hosts.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&path, content)?;

        let remove = path.clone();
        let release: ReleaseFn = Box::new(move || -> Result<()> {
            match fs::remove_file(&remove) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            }
        });
        Ok((path, Some(release)))
    }
}
