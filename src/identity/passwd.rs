//! User and group database lookup for POSIX images
//!
//! Reads `/etc/passwd` and `/etc/group` from the image root (never from the
//! host) and applies the same rules container runtimes use for the
//! `user[:group]` syntax.

use super::ResolvedIdentity;
use crate::error::{ExecutorError, Result};
use crate::fsutil::root_path;
use std::fs;
use std::io;
use std::path::Path;

/// One line of `/etc/passwd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/// One line of `/etc/group`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

fn records(content: &str) -> impl Iterator<Item = Vec<&str>> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').collect())
}

/// Parse passwd content, skipping malformed lines
pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    records(content)
        .filter_map(|fields| {
            let name = fields.first()?.to_string();
            let uid = fields.get(2)?.parse().ok()?;
            let gid = fields.get(3)?.parse().ok()?;
            Some(PasswdEntry {
                name,
                uid,
                gid,
                home: fields.get(5).map(|s| s.to_string()).unwrap_or_default(),
                shell: fields.get(6).map(|s| s.to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

/// Parse group content, skipping malformed lines
pub fn parse_group(content: &str) -> Vec<GroupEntry> {
    records(content)
        .filter_map(|fields| {
            let name = fields.first()?.to_string();
            let gid = fields.get(2)?.parse().ok()?;
            let members = fields
                .get(3)
                .map(|m| {
                    m.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(GroupEntry { name, gid, members })
        })
        .collect()
}

/// Parse a fully numeric `uid:gid` reference.
///
/// The empty reference is root. Anything else (a name, a bare uid) needs
/// the database and yields `None`.
pub fn parse_uid_gid(user: &str) -> Option<(u32, u32)> {
    if user.is_empty() {
        return Some((0, 0));
    }
    let (uid, gid) = user.split_once(':')?;
    Some((uid.parse().ok()?, gid.parse().ok()?))
}

/// Resolve `user[:group]` against parsed database entries
pub fn exec_user(
    user: &str,
    passwd: &[PasswdEntry],
    groups: &[GroupEntry],
) -> Result<ResolvedIdentity> {
    let (user_arg, group_arg) = match user.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (user, None),
    };

    let mut uid = 0;
    let mut gid = 0;
    let mut name = None;

    if !user_arg.is_empty() {
        let entry = passwd
            .iter()
            .find(|e| e.name == user_arg || e.uid.to_string() == user_arg);
        match entry {
            Some(e) => {
                uid = e.uid;
                gid = e.gid;
                name = Some(e.name.as_str());
            }
            None => {
                uid = user_arg.parse().map_err(|_| {
                    ExecutorError::IdentityNotFound(format!(
                        "no matching entries in passwd file for user {}",
                        user_arg
                    ))
                })?;
            }
        }
    }

    let mut additional_gids = Vec::new();
    match group_arg {
        Some(g) if !g.is_empty() => {
            let entry = groups
                .iter()
                .find(|e| e.name == g || e.gid.to_string() == g);
            gid = match entry {
                Some(e) => e.gid,
                None => g.parse().map_err(|_| {
                    ExecutorError::IdentityNotFound(format!(
                        "no matching entries in group file for group {}",
                        g
                    ))
                })?,
            };
        }
        _ => {
            if let Some(name) = name {
                for group in groups.iter().filter(|g| g.members.iter().any(|m| m == name)) {
                    if !additional_gids.contains(&group.gid) {
                        additional_gids.push(group.gid);
                    }
                }
            }
        }
    }

    Ok(ResolvedIdentity::Numeric {
        uid,
        gid,
        additional_gids,
    })
}

/// Read a database file of the image, treating a missing file as empty
pub(crate) fn read_user_file(rootfs: &Path, path: &str) -> Result<String> {
    let full = root_path(rootfs, path)?;
    match fs::read_to_string(&full) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

/// Resolve a user reference against the image mounted at `rootfs`.
///
/// Fully numeric `uid:gid` references are returned as-is without reading the
/// database.
pub fn lookup_user(rootfs: &Path, user: &str) -> Result<ResolvedIdentity> {
    if let Some((uid, gid)) = parse_uid_gid(user) {
        return Ok(ResolvedIdentity::numeric(uid, gid));
    }

    let passwd = parse_passwd(&read_user_file(rootfs, "/etc/passwd")?);
    let groups = parse_group(&read_user_file(rootfs, "/etc/group")?);
    let identity = exec_user(user, &passwd, &groups)?;

    tracing::debug!(user = %user, identity = ?identity, "resolved user from image database");
    Ok(identity)
}
