//! The peer transport seam
//!
//! The transfer engine never talks to the network directly. It drives a
//! [`PeerTransport`], which owns connection establishment, NAT traversal and
//! the content-addressed byte store. The engine only holds the opaque
//! [`ContentHandle`]s and [`Locator`]s the transport hands out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::transfer::TransferError;

/// Progress callback: `(bytes_so_far, total_bytes)`; a total of zero means unknown
pub type OnProgress = Arc<dyn Fn(u64, u64) + Send + Sync + 'static>;

/// Errors reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("import failed: {0}")]
    Import(Arc<str>),

    #[error("resolve failed: {0}")]
    Resolve(Arc<str>),

    #[error("fetch failed: {0}")]
    Fetch(Arc<str>),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(Arc<str>),

    /// The local destination rejected a write or flush
    #[error("write failed: {0}")]
    Write(Arc<str>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(Arc<str>),
}

impl TransportError {
    #[inline]
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(Arc::from(msg.into()))
    }

    #[inline]
    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::Resolve(Arc::from(msg.into()))
    }

    #[inline]
    pub fn import(msg: impl Into<String>) -> Self {
        Self::Import(Arc::from(msg.into()))
    }

    #[inline]
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(Arc::from(msg.into()))
    }

    #[inline]
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::PeerUnreachable(Arc::from(msg.into()))
    }
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Import(msg) => TransferError::Import(msg),
            TransportError::Resolve(msg) => TransferError::Resolve(msg),
            TransportError::Fetch(msg) => TransferError::Fetch(msg),
            TransportError::PeerUnreachable(msg) => TransferError::PeerUnreachable(msg),
            TransportError::Write(msg) => TransferError::Write(msg),
            TransportError::Cancelled => TransferError::Fetch(Arc::from("operation cancelled")),
            TransportError::Timeout(msg) => {
                TransferError::PeerUnreachable(Arc::from(format!("timed out: {msg}")))
            }
        }
    }
}

/// Shareable address of published content, as produced by the transport
///
/// Locators are embedded verbatim in tickets, so a transport must never
/// produce one containing the ticket separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(Arc<str>);

impl Locator {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Locator {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for Locator {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Handle to content imported into the transport's store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHandle {
    pub id: Arc<str>,
    pub size: u64,
}

/// A peer and content identifier resolved from a locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPeer {
    pub address: Arc<str>,
    pub content_id: Arc<str>,
    pub size_hint: Option<u64>,
    pub locator: Locator,
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Identity of the local node
    fn node_id(&self) -> Arc<str>;

    /// Ingests local content into the store.
    async fn import(&self, bytes: Bytes) -> Result<ContentHandle, TransportError>;

    /// Makes imported content servable and returns its shareable locator.
    async fn publish(&self, content: &ContentHandle) -> Result<Locator, TransportError>;

    /// Reports serve progress for published content.
    ///
    /// Resolves once the transport considers the content delivered, or with
    /// [`TransportError::Cancelled`] after `cancel` fires.
    async fn serve(
        &self,
        content: &ContentHandle,
        on_progress: OnProgress,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    async fn resolve(&self, locator: &Locator) -> Result<ResolvedPeer, TransportError>;

    /// Streams the content from the peer into `destination`, returning the byte count.
    ///
    /// `cancel` is checked between writes; no write is interrupted midway.
    async fn fetch(
        &self,
        peer: &ResolvedPeer,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
        on_progress: OnProgress,
        cancel: CancellationToken,
    ) -> Result<u64, TransportError>;
}

/// Writes `data` to `destination` in chunks, reporting progress after each chunk.
pub async fn write_chunked(
    data: &Bytes,
    chunk_size: usize,
    pace: Option<Duration>,
    destination: &mut (dyn AsyncWrite + Send + Unpin),
    on_progress: &OnProgress,
    cancel: &CancellationToken,
) -> Result<u64, TransportError> {
    let total = data.len() as u64;
    let mut written = 0u64;

    for chunk in data.chunks(chunk_size.max(1)) {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        destination
            .write_all(chunk)
            .await
            .map_err(|e| TransportError::write(e.to_string()))?;
        written += chunk.len() as u64;
        on_progress(written, total);
        if let Some(pace) = pace {
            tokio::time::sleep(pace).await;
        }
    }

    finish_writer(destination).await?;
    Ok(written)
}

/// Copies a reader into `destination`, reporting progress after each buffer.
pub async fn copy_reader(
    source: &mut (dyn AsyncRead + Send + Unpin),
    total: u64,
    chunk_size: usize,
    destination: &mut (dyn AsyncWrite + Send + Unpin),
    on_progress: &OnProgress,
    cancel: &CancellationToken,
) -> Result<u64, TransportError> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::fetch(format!("read failed: {e}")))?;
        if n == 0 {
            break;
        }
        destination
            .write_all(&buf[..n])
            .await
            .map_err(|e| TransportError::write(e.to_string()))?;
        written += n as u64;
        on_progress(written, total.max(written));
    }

    finish_writer(destination).await?;
    Ok(written)
}

async fn finish_writer(destination: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<(), TransportError> {
    destination
        .shutdown()
        .await
        .map_err(|e| TransportError::write(format!("failed to flush destination: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Destination whose every write fails, like a full or vanished disk
    struct BrokenDestination;

    impl AsyncWrite for BrokenDestination {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "disk gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn recorder() -> (OnProgress, Arc<Mutex<Vec<(u64, u64)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let on_progress: OnProgress = Arc::new(move |done, total| sink.lock().push((done, total)));
        (on_progress, seen)
    }

    #[tokio::test]
    async fn test_write_chunked_reports_each_chunk() {
        let data = Bytes::from_static(b"0123456789");
        let (on_progress, seen) = recorder();
        let mut out: Vec<u8> = Vec::new();

        let written = write_chunked(&data, 4, None, &mut out, &on_progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 10);
        assert_eq!(out, b"0123456789");
        assert_eq!(*seen.lock(), vec![(4, 10), (8, 10), (10, 10)]);
    }

    #[tokio::test]
    async fn test_write_chunked_stops_when_cancelled() {
        let data = Bytes::from_static(b"0123456789");
        let (on_progress, seen) = recorder();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out: Vec<u8> = Vec::new();

        let result = write_chunked(&data, 4, None, &mut out, &on_progress, &cancel).await;
        assert_eq!(result, Err(TransportError::Cancelled));
        assert!(out.is_empty());
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_copy_reader() {
        let mut source: &[u8] = b"hello world";
        let (on_progress, seen) = recorder();
        let mut out: Vec<u8> = Vec::new();

        let written = copy_reader(&mut source, 11, 5, &mut out, &on_progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 11);
        assert_eq!(out, b"hello world");
        assert_eq!(seen.lock().last(), Some(&(11, 11)));
    }

    #[tokio::test]
    async fn test_destination_failure_is_a_write_error() {
        let data = Bytes::from_static(b"0123456789");
        let (on_progress, seen) = recorder();

        let result = write_chunked(&data, 4, None, &mut BrokenDestination, &on_progress, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Write(ref msg)) if msg.contains("disk gone")));
        assert!(seen.lock().is_empty());

        let mut source: &[u8] = b"hello";
        let result = copy_reader(&mut source, 5, 5, &mut BrokenDestination, &on_progress, &CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::Write(_))));

        let err: TransferError = result.unwrap_err().into();
        assert!(matches!(err, TransferError::Write(_)));
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: TransferError = TransportError::resolve("bad ticket").into();
        assert_eq!(err, TransferError::Resolve(Arc::from("bad ticket")));

        let err: TransferError = TransportError::Timeout(Arc::from("dial")).into();
        assert!(matches!(err, TransferError::PeerUnreachable(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_locator_display() {
        let locator = Locator::from("abc");
        assert_eq!(locator.as_str(), "abc");
        assert_eq!(locator.to_string(), "abc");
    }
}
