//! iroh-blobs transport
//!
//! Content lives in an in-memory blob store served over the endpoint for as
//! long as the transport is alive. Locators are `BlobTicket` strings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use iroh::protocol::Router;
use iroh::Endpoint as IrohEndpoint;
use iroh_blobs::downloader::DownloadRequest;
use iroh_blobs::net_protocol::Blobs;
use iroh_blobs::store::mem::Store as MemStore;
use iroh_blobs::store::{ExportMode, ReadableStore, Store};
use iroh_blobs::ticket::BlobTicket;
use iroh_blobs::util::TempTag;
use iroh_blobs::{BlobFormat, HashAndFormat};
use tempfile::TempDir;
use tokio::fs;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::endpoint::Endpoint;
use super::transport::{
    copy_reader, ContentHandle, Locator, OnProgress, PeerTransport, ResolvedPeer, TransportError,
};

/// How long resolve waits for the sending node to answer
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for a single blob download
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Buffer size used when streaming the downloaded blob to its destination
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Callback shape the blob store reports export offsets through
type ExportProgress = Box<dyn Fn(u64) -> std::io::Result<()> + Send + Sync>;

/// [`PeerTransport`] over an iroh endpoint and an in-memory blob store
pub struct IrohTransport {
    endpoint: IrohEndpoint,
    blobs: Blobs<MemStore>,
    router: Router,
    /// Keeps imported blobs alive until the transport is dropped
    tags: DashMap<Arc<str>, TempTag>,
    fetch_timeout: Duration,
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("node_id", &self.endpoint.node_id())
            .field("blobs", &self.tags.len())
            .field("fetch_timeout", &self.fetch_timeout)
            .finish()
    }
}

impl IrohTransport {
    /// Registers the blobs protocol on the endpoint and starts serving.
    #[instrument(skip(endpoint))]
    pub fn new(endpoint: &Endpoint) -> Result<Self> {
        let iroh_endpoint = endpoint.iroh_endpoint()?;
        let blobs = Blobs::memory().build(&iroh_endpoint);

        let router = Router::builder(iroh_endpoint.clone())
            .accept(iroh_blobs::ALPN, blobs.clone())
            .spawn();

        info!(node_id = %iroh_endpoint.node_id(), "Blob transport ready");

        Ok(Self {
            endpoint: iroh_endpoint,
            blobs,
            router,
            tags: DashMap::new(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Stops serving and closes the endpoint.
    pub async fn shutdown(&self) {
        if let Err(e) = self.router.shutdown().await {
            warn!(error = %e, "Router shutdown failed");
        }
    }

    fn parse_ticket(locator: &Locator) -> Result<BlobTicket, TransportError> {
        locator
            .as_str()
            .parse::<BlobTicket>()
            .map_err(|e| TransportError::resolve(format!("invalid blob ticket: {e}")))
    }

    /// Private scratch directory for one fetch, removed when dropped.
    fn scratch_dir() -> Result<TempDir, TransportError> {
        tempfile::Builder::new()
            .prefix("ticketshare-")
            .tempdir()
            .map_err(|e| TransportError::write(format!("cannot create scratch directory: {e}")))
    }
}

/// Forwards export offsets as progress; the total stays whatever the record knows.
fn export_progress(on_progress: OnProgress) -> ExportProgress {
    Box::new(move |offset| {
        on_progress(offset, 0);
        Ok(())
    })
}

#[async_trait]
impl PeerTransport for IrohTransport {
    fn node_id(&self) -> Arc<str> {
        Arc::from(self.endpoint.node_id().to_string())
    }

    async fn import(&self, bytes: Bytes) -> Result<ContentHandle, TransportError> {
        let size = bytes.len() as u64;
        let tag = self
            .blobs
            .store()
            .import_bytes(bytes, BlobFormat::Raw)
            .await
            .map_err(|e| TransportError::import(e.to_string()))?;

        let id: Arc<str> = Arc::from(tag.hash().to_string());
        debug!(hash = %id, size, "Imported blob");
        self.tags.insert(id.clone(), tag);
        Ok(ContentHandle { id, size })
    }

    async fn publish(&self, content: &ContentHandle) -> Result<Locator, TransportError> {
        let hash = *self
            .tags
            .get(&content.id)
            .ok_or_else(|| TransportError::import(format!("blob {} was never imported", content.id)))?
            .hash();

        let node_addr = self
            .endpoint
            .node_addr()
            .await
            .map_err(|e| TransportError::import(format!("node address unavailable: {e}")))?;

        let ticket = BlobTicket::new(node_addr, hash, BlobFormat::Raw)
            .map_err(|e| TransportError::import(e.to_string()))?;
        Ok(Locator::from(ticket.to_string()))
    }

    /// The router serves published blobs to any number of peers without
    /// reporting back, so the content counts as delivered once published.
    async fn serve(
        &self,
        content: &ContentHandle,
        on_progress: OnProgress,
        _cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        on_progress(content.size, content.size);
        Ok(())
    }

    async fn resolve(&self, locator: &Locator) -> Result<ResolvedPeer, TransportError> {
        let ticket = Self::parse_ticket(locator)?;
        let node_addr = ticket.node_addr().clone();

        let connection = tokio::time::timeout(
            DIAL_TIMEOUT,
            self.endpoint.connect(node_addr.clone(), iroh_blobs::ALPN),
        )
        .await
        .map_err(|_| TransportError::Timeout(Arc::from(format!("dialing {}", node_addr.node_id))))?
        .map_err(|e| TransportError::unreachable(e.to_string()))?;
        connection.close(0u32.into(), b"resolved");

        Ok(ResolvedPeer {
            address: Arc::from(node_addr.node_id.to_string()),
            content_id: Arc::from(ticket.hash().to_string()),
            size_hint: None,
            locator: locator.clone(),
        })
    }

    async fn fetch(
        &self,
        peer: &ResolvedPeer,
        destination: &mut (dyn AsyncWrite + Send + Unpin),
        on_progress: OnProgress,
        cancel: CancellationToken,
    ) -> Result<u64, TransportError> {
        let ticket = Self::parse_ticket(&peer.locator)?;
        let request = DownloadRequest::new(HashAndFormat::raw(ticket.hash()), [ticket.node_addr().clone()]);

        // The downloader reports nothing until it finishes, so mark the start.
        on_progress(0, peer.size_hint.unwrap_or(0));

        let download = async {
            let handle = self.blobs.downloader().queue(request).await;
            handle.await
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(self.fetch_timeout) => {
                return Err(TransportError::Timeout(Arc::from(format!("downloading {}", ticket.hash()))));
            }
            result = download => {
                result.map_err(|e| TransportError::fetch(e.to_string()))?;
            }
        }
        debug!(hash = %ticket.hash(), "Blob downloaded");

        let scratch_dir = Self::scratch_dir()?;
        let scratch = scratch_dir.path().join(format!("{}.part", ticket.hash()));
        self.blobs
            .store()
            .export(ticket.hash(), scratch.clone(), ExportMode::Copy, export_progress(on_progress.clone()))
            .await
            .map_err(|e| TransportError::fetch(format!("export failed: {e}")))?;

        let mut file = fs::File::open(&scratch)
            .await
            .map_err(|e| TransportError::fetch(format!("cannot open downloaded blob: {e}")))?;
        let total = file
            .metadata()
            .await
            .map(|m| m.len())
            .map_err(|e| TransportError::fetch(e.to_string()))?;
        let copied = copy_reader(&mut file, total, COPY_CHUNK_SIZE, destination, &on_progress, &cancel).await;
        drop(file);

        if let Err(e) = scratch_dir.close() {
            debug!(path = %scratch.display(), error = %e, "Could not remove scratch directory");
        }
        copied
    }
}
