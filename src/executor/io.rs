//! Process standard streams

use super::request::RunRequest;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed reader for a process standard input
pub type Reader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writer for a process output stream
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A run request together with its standard streams.
///
/// Streams left as `None` are not connected.
pub struct ProcessInfo {
    pub request: RunRequest,
    pub stdin: Option<Reader>,
    pub stdout: Option<Writer>,
    pub stderr: Option<Writer>,
}

impl ProcessInfo {
    /// Process without connected streams
    pub fn new(request: RunRequest) -> Self {
        Self {
            request,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Connect standard input
    pub fn stdin(mut self, stdin: Reader) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Connect standard output
    pub fn stdout(mut self, stdout: Writer) -> Self {
        self.stdout = Some(stdout);
        self
    }

    /// Connect standard error
    pub fn stderr(mut self, stderr: Writer) -> Self {
        self.stderr = Some(stderr);
        self
    }
}

impl fmt::Debug for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("request", &self.request)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// In-memory writer whose clones share one buffer
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        match self.inner.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer poisoned"))?;
        inner.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_capture_shared_between_clones() {
        let capture = CaptureBuffer::new();
        let mut process = ProcessInfo::new(RunRequest::default()).stdout(Box::new(capture.clone()));

        let stdout = process.stdout.as_mut().unwrap();
        stdout.write_all(b"hello ").await.unwrap();
        stdout.write_all(b"world").await.unwrap();

        assert_eq!(capture.contents(), b"hello world");
        assert!(process.stderr.is_none());
    }
}
