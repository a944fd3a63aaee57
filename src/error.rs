//! Error types for the Rune executor

use std::path::PathBuf;
use thiserror::Error;

/// Boxed cause carried by errors that wrap a collaborator failure
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for executor operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Executor error types
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("mount acquisition failed: {context}")]
    MountAcquisitionFailed {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("identity not found: {0}")]
    IdentityNotFound(String),

    #[error("unexpected number of root mounts: {0}")]
    UnsupportedMountTopology(usize),

    #[error("failed to resolve identity of user {user}")]
    IdentityResolutionFailed {
        user: String,
        #[source]
        source: BoxError,
    },

    #[error("malformed identity response: {message}")]
    MalformedIdentityResponse {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("working dir {path} points to invalid target: {reason}")]
    InvalidWorkingDirectory { path: String, reason: String },

    #[error("failed to create working directory {}", path.display())]
    WorkingDirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported security mode: {0}")]
    UnsupportedSecurityMode(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("process exited with status {code}")]
    ProcessExited { code: i32 },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("OCI spec error: {0}")]
    Spec(#[from] oci_spec::OciSpecError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{op}")]
    Context {
        op: &'static str,
        #[source]
        source: Box<ExecutorError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Wrap a collaborator failure raised while acquiring a mount
    pub fn mount(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        ExecutorError::MountAcquisitionFailed {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Strip every `Context` layer and return the original error
    pub fn innermost(&self) -> &ExecutorError {
        let mut current = self;
        while let ExecutorError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether the failure was caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.innermost(), ExecutorError::Cancelled)
    }
}

/// Attach the name of the failing operation to an error before it crosses a
/// component boundary
pub trait ResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|e| ExecutorError::Context {
            op,
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested() -> ExecutorError {
        let result: Result<()> = Err(ExecutorError::IdentityNotFound("app".to_string()));
        result.op("resolving user").op("running step").unwrap_err()
    }

    #[test]
    fn test_context_preserves_cause() {
        let err = nested();
        assert_eq!(err.to_string(), "running step");
        assert!(matches!(
            err.innermost(),
            ExecutorError::IdentityNotFound(name) if name == "app"
        ));
    }

    #[test]
    fn test_context_chain_renders_each_cause_once() {
        let rendered = format!("{:#}", anyhow::Error::from(nested()));
        assert_eq!(rendered, "running step: resolving user: identity not found: app");
    }

    #[test]
    fn test_cancelled_detection() {
        let err = ExecutorError::Context {
            op: "launching task",
            source: Box::new(ExecutorError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!ExecutorError::Internal("x".to_string()).is_cancelled());
    }

    #[test]
    fn test_mount_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no snapshot");
        let err = ExecutorError::mount("mounting root", io);

        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "no snapshot");
    }
}
