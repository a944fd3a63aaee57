//! In-container identity lookup
//!
//! A Windows account name can only be mapped to its SID by code running
//! inside a container of that image. The host runs the `get-user-info`
//! helper as `ContainerAdministrator` against the same root mount and reads
//! a single JSON record back from the helper's standard output.

use super::{ResolvedIdentity, CONTAINER_ADMINISTRATOR};
use crate::error::{ExecutorError, Result};
use crate::executor::{CaptureBuffer, ProcessInfo, RunRequest};
use crate::mount::Mountable;
use crate::release::ReleaseChain;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Helper subcommand executed inside the container
pub const GET_USER_INFO_COMMAND: &str = "get-user-info";

/// Record printed by the helper.
///
/// The record has no version field; unknown keys are ignored and a missing
/// SID is treated as malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(rename = "UID", default)]
    pub uid: u32,
    #[serde(rename = "GID", default)]
    pub gid: u32,
    #[serde(rename = "SID", default)]
    pub sid: String,
}

impl IdentityRecord {
    /// Decode helper output
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(ExecutorError::MalformedIdentityResponse {
                message: "helper produced no output".to_string(),
                source: None,
            });
        }
        serde_json::from_slice(data).map_err(|e| ExecutorError::MalformedIdentityResponse {
            message: "reading user info".to_string(),
            source: Some(e),
        })
    }

    /// Convert to an identity for the account `name`
    pub fn into_identity(self, name: &str) -> ResolvedIdentity {
        if self.sid.is_empty() {
            ResolvedIdentity::numeric(self.uid, self.gid)
        } else {
            ResolvedIdentity::Sid {
                sid: self.sid,
                name: name.to_string(),
            }
        }
    }
}

impl From<&ResolvedIdentity> for IdentityRecord {
    fn from(identity: &ResolvedIdentity) -> Self {
        match identity {
            ResolvedIdentity::Numeric { uid, gid, .. } => IdentityRecord {
                uid: *uid,
                gid: *gid,
                sid: String::new(),
            },
            ResolvedIdentity::Sid { sid, .. } => IdentityRecord {
                sid: sid.clone(),
                ..Default::default()
            },
        }
    }
}

/// Narrow execution path used for helper processes.
///
/// Implementations run `process` against `root` without acquiring a new
/// mount. On cancellation they stop the helper before returning
/// [`ExecutorError::Cancelled`]. The process always runs as `ContainerAdministrator`, which resolves
/// without a lookup, so a helper run never triggers another helper run.
#[async_trait]
pub trait HelperRunner: Send + Sync {
    async fn run_helper(
        &self,
        root: Arc<dyn Mountable>,
        process: ProcessInfo,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Build the helper process for looking up `user`
pub fn helper_process(user: &str, stdout: CaptureBuffer, stderr: CaptureBuffer) -> ProcessInfo {
    let request = RunRequest::new(vec![GET_USER_INFO_COMMAND.to_string(), user.to_string()])
        .user(CONTAINER_ADMINISTRATOR)
        .cwd("/");

    ProcessInfo::new(request)
        .stdout(Box::new(stdout))
        .stderr(Box::new(stderr))
}

/// Resolve `user` to a SID by running the helper inside `root`
pub async fn resolve_in_container(
    runner: &dyn HelperRunner,
    root: Arc<dyn Mountable>,
    user: &str,
    cancel: &CancellationToken,
) -> Result<ResolvedIdentity> {
    let mut chain = ReleaseChain::new();
    let (mounts, release) = root
        .mount()
        .map_err(|e| ExecutorError::mount("getting root mounts", e))?;
    chain.acquire_boxed("helper root mount", release);

    if mounts.len() != 1 {
        return Err(ExecutorError::UnsupportedMountTopology(mounts.len()));
    }

    let stdout = CaptureBuffer::new();
    let stderr = CaptureBuffer::new();
    let process = helper_process(user, stdout.clone(), stderr.clone());

    tracing::debug!(user = %user, "resolving user inside container");
    let outcome = runner.run_helper(Arc::clone(&root), process, cancel).await;
    chain.release_all();

    if let Err(e) = outcome {
        if e.is_cancelled() {
            return Err(e);
        }
        let stderr = String::from_utf8_lossy(&stderr.contents()).trim().to_string();
        if !stderr.is_empty() {
            tracing::warn!(user = %user, stderr = %stderr, "user lookup helper failed");
        }
        return Err(ExecutorError::IdentityResolutionFailed {
            user: user.to_string(),
            source: Box::new(e),
        });
    }

    let record = IdentityRecord::decode(&stdout.contents())?;
    if record.sid.is_empty() {
        return Err(ExecutorError::MalformedIdentityResponse {
            message: format!("response for {} carries no SID", user),
            source: None,
        });
    }

    let identity = record.into_identity(user);
    tracing::debug!(user = %user, identity = ?identity, "resolved user inside container");
    Ok(identity)
}
