//! Identity resolution
//!
//! Maps a user reference from a build step (`"app"`, `"1000:1000"`,
//! `"ContainerUser"`) to the identity the kernel understands: a UID/GID set
//! on POSIX hosts, a security identifier on Windows hosts.

#[cfg(windows)]
pub mod account;
pub mod chown;
pub mod lookup;
pub mod passwd;

#[cfg(windows)]
pub use account::lookup_account_sid;
pub use chown::{ChownOpt, UserOpt};
pub use lookup::{resolve_in_container, HelperRunner, IdentityRecord, GET_USER_INFO_COMMAND};
pub use passwd::{lookup_user, parse_uid_gid};

use serde::{Deserialize, Serialize};

/// Built-in administrator account of Windows containers
pub const CONTAINER_ADMINISTRATOR: &str = "ContainerAdministrator";
/// Built-in unprivileged account of Windows containers
pub const CONTAINER_USER: &str = "ContainerUser";
/// SID of `ContainerAdministrator`
pub const CONTAINER_ADMINISTRATOR_SID: &str = "S-1-5-93-2-1";
/// SID of `ContainerUser`
pub const CONTAINER_USER_SID: &str = "S-1-5-93-2-2";

/// Kernel-level identity of a process or file owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedIdentity {
    /// POSIX identity
    Numeric {
        uid: u32,
        gid: u32,
        #[serde(default)]
        additional_gids: Vec<u32>,
    },
    /// Windows security identifier
    Sid { sid: String, name: String },
}

impl ResolvedIdentity {
    /// POSIX identity without supplementary groups
    pub fn numeric(uid: u32, gid: u32) -> Self {
        ResolvedIdentity::Numeric {
            uid,
            gid,
            additional_gids: Vec::new(),
        }
    }

    /// Windows identity
    pub fn sid(sid: &str, name: &str) -> Self {
        ResolvedIdentity::Sid {
            sid: sid.to_string(),
            name: name.to_string(),
        }
    }

    /// Identity of `ContainerAdministrator`
    pub fn container_administrator() -> Self {
        Self::sid(CONTAINER_ADMINISTRATOR_SID, CONTAINER_ADMINISTRATOR)
    }

    /// Identity of `ContainerUser`
    pub fn container_user() -> Self {
        Self::sid(CONTAINER_USER_SID, CONTAINER_USER)
    }

    /// UID and GID, if this is a POSIX identity
    pub fn uid_gid(&self) -> Option<(u32, u32)> {
        match self {
            ResolvedIdentity::Numeric { uid, gid, .. } => Some((*uid, *gid)),
            ResolvedIdentity::Sid { .. } => None,
        }
    }

    /// Security identifier, if this is a Windows identity
    pub fn sid_str(&self) -> Option<&str> {
        match self {
            ResolvedIdentity::Sid { sid, .. } => Some(sid),
            ResolvedIdentity::Numeric { .. } => None,
        }
    }
}

/// Map a built-in Windows account alias to its identity.
///
/// The empty string means the administrator. Returns `None` for any other
/// name, which can only be resolved from inside the image.
pub fn builtin_windows_identity(user: &str) -> Option<ResolvedIdentity> {
    if user.is_empty() || user.eq_ignore_ascii_case(CONTAINER_ADMINISTRATOR) {
        Some(ResolvedIdentity::container_administrator())
    } else if user.eq_ignore_ascii_case(CONTAINER_USER) {
        Some(ResolvedIdentity::container_user())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_aliases() {
        let admin = builtin_windows_identity("containeradministrator").unwrap();
        assert_eq!(admin.sid_str(), Some(CONTAINER_ADMINISTRATOR_SID));
        assert_eq!(builtin_windows_identity(""), Some(admin));

        let user = builtin_windows_identity("CONTAINERUSER").unwrap();
        assert_eq!(user.sid_str(), Some(CONTAINER_USER_SID));

        assert!(builtin_windows_identity("app").is_none());
    }

    #[test]
    fn test_numeric_accessors() {
        let id = ResolvedIdentity::numeric(1000, 100);
        assert_eq!(id.uid_gid(), Some((1000, 100)));
        assert!(id.sid_str().is_none());
    }
}
