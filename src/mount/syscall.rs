//! Raw mount system calls for Linux
//!
//! Thin wrappers over `libc::mount`/`libc::umount2` plus translation of
//! containerd-style mount option strings into mount flags and data.

use std::ffi::CString;
use std::io;

/// Mount flags
pub mod mount_flags {
    /// Mount read-only
    pub const MS_RDONLY: u64 = 1;
    /// Ignore suid and sgid bits
    pub const MS_NOSUID: u64 = 2;
    /// Disallow access to device special files
    pub const MS_NODEV: u64 = 4;
    /// Disallow program execution
    pub const MS_NOEXEC: u64 = 8;
    /// Alter flags of a mounted FS
    pub const MS_REMOUNT: u64 = 32;
    /// Do not update access times
    pub const MS_NOATIME: u64 = 1024;
    /// Bind directory at different place
    pub const MS_BIND: u64 = 4096;
    /// Recursive mount
    pub const MS_REC: u64 = 16384;
    /// Change to private propagation
    pub const MS_PRIVATE: u64 = 1 << 18;
    /// Update atime relative to mtime/ctime
    pub const MS_RELATIME: u64 = 1 << 21;
}

/// Umount flags
pub mod umount_flags {
    /// Lazy unmount
    pub const MNT_DETACH: i32 = 2;
}

/// Result type for syscall operations
pub type SyscallResult<T> = std::result::Result<T, io::Error>;

fn cstring(value: &str, what: &str) -> SyscallResult<CString> {
    CString::new(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid {}", what)))
}

/// Mount a filesystem
pub fn mount(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: u64,
    data: Option<&str>,
) -> SyscallResult<()> {
    let source_cstr = source.map(|s| cstring(s, "source path")).transpose()?;
    let target_cstr = cstring(target, "target path")?;
    let fstype_cstr = fstype.map(|s| cstring(s, "fstype")).transpose()?;
    let data_cstr = data.map(|s| cstring(s, "data")).transpose()?;

    let source_ptr = source_cstr.as_ref().map(|s| s.as_ptr()).unwrap_or(std::ptr::null());
    let fstype_ptr = fstype_cstr.as_ref().map(|s| s.as_ptr()).unwrap_or(std::ptr::null());
    let data_ptr = data_cstr
        .as_ref()
        .map(|s| s.as_ptr() as *const libc::c_void)
        .unwrap_or(std::ptr::null());

    let result = unsafe {
        libc::mount(
            source_ptr,
            target_cstr.as_ptr(),
            fstype_ptr,
            flags as libc::c_ulong,
            data_ptr,
        )
    };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Unmount a filesystem
pub fn umount2(target: &str, flags: i32) -> SyscallResult<()> {
    let target_cstr = cstring(target, "target path")?;

    let result = unsafe { libc::umount2(target_cstr.as_ptr(), flags) };

    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Split mount options into flags and filesystem-specific data
pub fn parse_options(options: &[String]) -> (u64, Option<String>) {
    use mount_flags::*;

    let mut flags = 0u64;
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "ro" => flags |= MS_RDONLY,
            "rw" => flags &= !MS_RDONLY,
            "bind" => flags |= MS_BIND,
            "rbind" => flags |= MS_BIND | MS_REC,
            "nosuid" => flags |= MS_NOSUID,
            "nodev" => flags |= MS_NODEV,
            "noexec" => flags |= MS_NOEXEC,
            "noatime" => flags |= MS_NOATIME,
            "relatime" => flags |= MS_RELATIME,
            "rprivate" => flags |= MS_PRIVATE | MS_REC,
            other => data.push(other.to_string()),
        }
    }

    let data = if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    };
    (flags, data)
}
