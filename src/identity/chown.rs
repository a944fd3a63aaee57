//! Ownership requests of file operations
//!
//! File copies and mkdirs in a build can ask for a new owner by name or id.
//! These helpers resolve such a request with the same machinery used for
//! process identities.

use super::lookup::{resolve_in_container, HelperRunner};
use super::passwd::{exec_user, parse_group, parse_passwd, read_user_file};
use super::{builtin_windows_identity, ResolvedIdentity};
use crate::error::{ExecutorError, Result};
use crate::mount::Mountable;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// User or group reference of a chown request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOpt {
    ByName(String),
    ById(u32),
}

/// Ownership change requested by a file operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChownOpt {
    pub user: Option<UserOpt>,
    pub group: Option<UserOpt>,
}

/// Resolve a chown request against a POSIX image root.
///
/// A user given by id also sets the group to that id unless a group is
/// given explicitly. Names need `rootfs`.
pub fn resolve_chown_posix(opt: Option<&ChownOpt>, rootfs: Option<&Path>) -> Result<Option<ResolvedIdentity>> {
    let opt = match opt {
        Some(opt) => opt,
        None => return Ok(None),
    };

    let database = |what: &str| {
        rootfs.ok_or_else(|| ExecutorError::IdentityNotFound(format!("invalid missing {} mount", what)))
    };

    let (mut uid, mut gid) = (0, 0);
    match &opt.user {
        Some(UserOpt::ByName(name)) => {
            let rootfs = database("user")?;
            let passwd = parse_passwd(&read_user_file(rootfs, "/etc/passwd")?);
            let user = passwd
                .iter()
                .find(|e| &e.name == name)
                .ok_or_else(|| ExecutorError::IdentityNotFound(name.clone()))?;
            uid = user.uid;
            gid = user.gid;
        }
        Some(UserOpt::ById(id)) => {
            uid = *id;
            gid = *id;
        }
        None => {}
    }

    match &opt.group {
        Some(UserOpt::ByName(name)) => {
            let rootfs = database("group")?;
            let groups = parse_group(&read_user_file(rootfs, "/etc/group")?);
            gid = match exec_user(&format!("{}:{}", uid, name), &[], &groups)? {
                ResolvedIdentity::Numeric { gid, .. } => gid,
                ResolvedIdentity::Sid { .. } => gid,
            };
        }
        Some(UserOpt::ById(id)) => gid = *id,
        None => {}
    }

    Ok(Some(ResolvedIdentity::numeric(uid, gid)))
}

/// Resolve a chown request for a Windows image.
///
/// Built-in accounts resolve directly; other names are looked up inside
/// `root`. Requests by id and requests without a user fall back to
/// `ContainerAdministrator`.
pub async fn resolve_chown_windows(
    opt: Option<&ChownOpt>,
    root: Option<Arc<dyn Mountable>>,
    runner: &dyn HelperRunner,
    cancel: &CancellationToken,
) -> Result<Option<ResolvedIdentity>> {
    let opt = match opt {
        Some(opt) => opt,
        None => return Ok(None),
    };

    match &opt.user {
        Some(UserOpt::ByName(name)) => {
            if let Some(identity) = builtin_windows_identity(name) {
                return Ok(Some(identity));
            }
            let root = root.ok_or_else(|| {
                ExecutorError::IdentityNotFound("invalid missing user mount".to_string())
            })?;
            resolve_in_container(runner, root, name, cancel).await.map(Some)
        }
        _ => Ok(Some(ResolvedIdentity::container_administrator())),
    }
}
