//! Mount handling for build-step containers
//!
//! The snapshot subsystem hands the executor abstract mount sources. A
//! [`MountSource`] yields a [`Mountable`], which yields the low-level
//! [`MountDescriptor`]s the runtime understands. When the executor itself
//! needs a real directory (to read `/etc/passwd`, create the working
//! directory, clean up stubs) a [`LocalMounter`] materializes the
//! descriptors on the host.

pub mod lifecycle;
pub mod local;
#[cfg(target_os = "linux")]
pub mod syscall;

pub use lifecycle::{AuxMount, MountManager, MountSet, MountStubs, PreparedRoot};
pub use local::HostLocalMounter;

use crate::error::Result;
use crate::release::ReleaseFn;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Low-level mount descriptor, as passed to the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDescriptor {
    /// Filesystem type ("bind", "overlay", "nullfs", ...)
    #[serde(rename = "type")]
    pub typ: String,
    /// Source path or device
    pub source: String,
    /// Mount options
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountDescriptor {
    /// Create a mount descriptor
    pub fn new(typ: &str, source: &str, options: Vec<String>) -> Self {
        Self {
            typ: typ.to_string(),
            source: source.to_string(),
            options,
        }
    }

    /// Create a recursive bind mount descriptor
    pub fn rbind(source: &str, readonly: bool) -> Self {
        let mut options = vec!["rbind".to_string()];
        if readonly {
            options.push("ro".to_string());
        }
        Self::new("bind", source, options)
    }

    /// Whether this is a bind mount
    pub fn is_bind(&self) -> bool {
        self.typ == "bind"
            || self
                .options
                .iter()
                .any(|o| o == "bind" || o == "rbind")
    }

    /// Whether the mount is read-only
    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Something that can be turned into mount descriptors.
///
/// The returned release action undoes whatever `mount` acquired.
pub trait Mountable: Send + Sync {
    fn mount(&self) -> Result<(Vec<MountDescriptor>, ReleaseFn)>;
}

/// Source of a mountable, typically a snapshot reference
#[async_trait]
pub trait MountSource: Send + Sync {
    async fn mount(&self, readonly: bool) -> Result<Arc<dyn Mountable>>;
}

/// Mount reference attached to a run request
#[derive(Clone)]
pub struct Mount {
    /// Where the mount comes from
    pub src: Arc<dyn MountSource>,
    /// Destination inside the container
    pub dest: String,
    /// Sub-path of the source to expose
    pub selector: String,
    /// Mount read-only
    pub readonly: bool,
}

impl Mount {
    /// Create a read-write mount at `dest`
    pub fn new(src: Arc<dyn MountSource>, dest: &str) -> Self {
        Self {
            src,
            dest: dest.to_string(),
            selector: String::new(),
            readonly: false,
        }
    }

    /// Root mount reference
    pub fn root(src: Arc<dyn MountSource>) -> Self {
        Self::new(src, "/")
    }

    /// Expose only a sub-path of the source
    pub fn selector(mut self, selector: &str) -> Self {
        self.selector = selector.to_string();
        self
    }

    /// Mount read-only
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("dest", &self.dest)
            .field("selector", &self.selector)
            .field("readonly", &self.readonly)
            .finish()
    }
}

/// Mount source that hands back an already resolved mountable instead of
/// acquiring a new one
pub struct StubMountSource {
    mountable: Arc<dyn Mountable>,
}

impl StubMountSource {
    pub fn new(mountable: Arc<dyn Mountable>) -> Self {
        Self { mountable }
    }

    /// Wrap a resolved mountable as a root mount reference
    pub fn root_mount(mountable: Arc<dyn Mountable>) -> Mount {
        Mount::root(Arc::new(Self::new(mountable)))
    }
}

#[async_trait]
impl MountSource for StubMountSource {
    async fn mount(&self, _readonly: bool) -> Result<Arc<dyn Mountable>> {
        Ok(Arc::clone(&self.mountable))
    }
}

/// A directory on the host holding materialized mounts
pub struct LocalMount {
    /// Host path of the mounted tree
    pub path: PathBuf,
    /// Undo action, `None` when nothing was mounted
    pub unmount: Option<ReleaseFn>,
}

impl fmt::Debug for LocalMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMount")
            .field("path", &self.path)
            .field("mounted", &self.unmount.is_some())
            .finish()
    }
}

/// Materializes mount descriptors into a host path
pub trait LocalMounter: Send + Sync {
    fn mount(&self, mounts: &[MountDescriptor]) -> Result<LocalMount>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl Mountable for Fixed {
        fn mount(&self) -> Result<(Vec<MountDescriptor>, ReleaseFn)> {
            let release: ReleaseFn = Box::new(|| -> Result<()> { Ok(()) });
            Ok((vec![MountDescriptor::rbind("/snap/1", false)], release))
        }
    }

    #[test]
    fn test_rbind_descriptor() {
        let m = MountDescriptor::rbind("/src", true);
        assert!(m.is_bind());
        assert!(m.is_readonly());
        assert_eq!(m.options, vec!["rbind", "ro"]);
    }

    #[test]
    fn test_overlay_descriptor_not_bind() {
        let m = MountDescriptor::new("overlay", "overlay", vec!["lowerdir=/a".to_string()]);
        assert!(!m.is_bind());
        assert!(!m.is_readonly());
    }

    #[tokio::test]
    async fn test_stub_source_reuses_mountable() {
        let mountable: Arc<dyn Mountable> = Arc::new(Fixed);
        let mount = StubMountSource::root_mount(Arc::clone(&mountable));

        let resolved = mount.src.mount(true).await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &mountable));
        assert_eq!(mount.dest, "/");
    }

    #[test]
    fn test_descriptor_json_shape() {
        let m = MountDescriptor::rbind("/src", false);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["type"], "bind");
        assert_eq!(json["source"], "/src");
    }
}
