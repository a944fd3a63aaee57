//! Host-side materialization of mount descriptors

use super::{LocalMount, LocalMounter, MountDescriptor};
use crate::error::{ExecutorError, Result};
use std::path::PathBuf;

/// Local mounter that mounts descriptors under a host directory.
///
/// A single writable bind mount is used in place; anything else is mounted
/// onto a fresh directory below `mount_root` and detached on release.
pub struct HostLocalMounter {
    mount_root: PathBuf,
}

impl HostLocalMounter {
    /// Create a mounter that places mount points under `mount_root`
    pub fn new(mount_root: PathBuf) -> Self {
        Self { mount_root }
    }
}

impl LocalMounter for HostLocalMounter {
    fn mount(&self, mounts: &[MountDescriptor]) -> Result<LocalMount> {
        let descriptor = match mounts {
            [single] => single,
            _ => {
                return Err(ExecutorError::mount(
                    "local mount",
                    format!("unsupported number of mounts: {}", mounts.len()),
                ))
            }
        };

        if descriptor.is_bind() && !descriptor.is_readonly() {
            tracing::debug!(source = %descriptor.source, "using bind source in place");
            return Ok(LocalMount {
                path: PathBuf::from(&descriptor.source),
                unmount: None,
            });
        }

        self.mount_at_new_target(descriptor)
    }
}

#[cfg(target_os = "linux")]
impl HostLocalMounter {
    fn mount_at_new_target(&self, descriptor: &MountDescriptor) -> Result<LocalMount> {
        use super::syscall::{mount, mount_flags, parse_options, umount2, umount_flags};
        use std::fs;

        fs::create_dir_all(&self.mount_root)?;
        let target = self.mount_root.join(uuid::Uuid::new_v4().simple().to_string());
        fs::create_dir(&target)?;
        let target_str = target.to_string_lossy().to_string();

        let (flags, data) = parse_options(&descriptor.options);
        let fstype = if descriptor.is_bind() {
            None
        } else {
            Some(descriptor.typ.as_str())
        };

        // Bind mounts ignore MS_RDONLY on the first call; read-only needs a remount
        let first_flags = if descriptor.is_bind() {
            flags & !mount_flags::MS_RDONLY
        } else {
            flags
        };

        let mounted = mount(
            Some(&descriptor.source),
            &target_str,
            fstype,
            first_flags,
            data.as_deref(),
        )
        .and_then(|_| {
            if descriptor.is_bind() && flags & mount_flags::MS_RDONLY != 0 {
                mount(None, &target_str, None, flags | mount_flags::MS_REMOUNT, None)
            } else {
                Ok(())
            }
        });

        if let Err(e) = mounted {
            let _ = umount2(&target_str, umount_flags::MNT_DETACH);
            let _ = fs::remove_dir(&target);
            return Err(ExecutorError::mount(
                format!("mounting {} at {}", descriptor.source, target_str),
                e,
            ));
        }

        tracing::debug!(
            source = %descriptor.source,
            fstype = %descriptor.typ,
            target = %target_str,
            "local mount created"
        );

        let unmount_target = target.clone();
        Ok(LocalMount {
            path: target,
            unmount: Some(Box::new(move || -> Result<()> {
                let path = unmount_target.to_string_lossy().to_string();
                umount2(&path, umount_flags::MNT_DETACH).map_err(|e| {
                    ExecutorError::Runtime(format!("Failed to unmount {}: {}", path, e))
                })?;
                fs::remove_dir(&unmount_target)?;
                Ok(())
            })),
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl HostLocalMounter {
    fn mount_at_new_target(&self, descriptor: &MountDescriptor) -> Result<LocalMount> {
        Err(ExecutorError::UnsupportedFeature(format!(
            "local {} mounts under {}",
            descriptor.typ,
            self.mount_root.display()
        )))
    }
}
