//! In-process transport
//!
//! A [`LoopbackNetwork`] is a set of named nodes, each with its own
//! content-addressed (BLAKE3) store. Nodes can be taken offline to simulate
//! unreachable peers, and fetches can be slowed down so cancellation can be
//! exercised. Locators have the form `loop:<node>:<hash>`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::transport::{
    write_chunked, ContentHandle, Locator, OnProgress, PeerTransport, ResolvedPeer, TransportError,
};

const LOCATOR_SCHEME: &str = "loop:";

/// Default fetch chunk size (16 KiB)
const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct StoredBlob {
    data: Bytes,
    published: bool,
    /// Highest byte offset any peer has fetched since the last publish
    served: Arc<watch::Sender<u64>>,
}

#[derive(Debug)]
struct LoopbackNode {
    online: AtomicBool,
    blobs: DashMap<Arc<str>, StoredBlob>,
}

impl LoopbackNode {
    fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            blobs: DashMap::new(),
        }
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// Shared registry of loopback nodes
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    nodes: DashMap<Arc<str>, Arc<LoopbackNode>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a node (or reattaches to an existing one) and returns its transport.
    pub fn join(self: &Arc<Self>, name: &str) -> LoopbackTransport {
        let name: Arc<str> = Arc::from(name);
        let node = self
            .nodes
            .entry(name.clone())
            .or_insert_with(|| Arc::new(LoopbackNode::new()))
            .clone();

        debug!(node = %name, "Loopback node joined");

        LoopbackTransport {
            network: self.clone(),
            node,
            node_id: name,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: None,
        }
    }

    pub fn set_online(&self, name: &str, online: bool) {
        if let Some(node) = self.nodes.get(name) {
            node.online.store(online, Ordering::Release);
            info!(node = %name, online, "Loopback node availability changed");
        }
    }

    fn node(&self, name: &str) -> Option<Arc<LoopbackNode>> {
        self.nodes.get(name).map(|entry| entry.value().clone())
    }
}

/// [`PeerTransport`] backed by a [`LoopbackNetwork`]
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    node: Arc<LoopbackNode>,
    node_id: Arc<str>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

impl LoopbackTransport {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Sleeps after every chunk written during a fetch.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    fn locator_for(&self, hash: &str) -> Locator {
        Locator::from(format!("{LOCATOR_SCHEME}{}:{hash}", self.node_id))
    }

    fn parse_locator(locator: &Locator) -> Result<(&str, &str), TransportError> {
        locator
            .as_str()
            .strip_prefix(LOCATOR_SCHEME)
            .and_then(|rest| rest.rsplit_once(':'))
            .filter(|(node, hash)| !node.is_empty() && !hash.is_empty())
            .ok_or_else(|| TransportError::resolve(format!("not a loopback locator: {locator}")))
    }

    fn reachable(&self, name: &str) -> Result<Arc<LoopbackNode>, TransportError> {
        let node = self
            .network
            .node(name)
            .ok_or_else(|| TransportError::unreachable(format!("unknown node {name}")))?;
        if !node.is_online() {
            return Err(TransportError::unreachable(format!("node {name} is offline")));
        }
        Ok(node)
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    fn node_id(&self) -> Arc<str> {
        self.node_id.clone()
    }

    async fn import(&self, bytes: Bytes) -> Result<ContentHandle, TransportError> {
        let hash: Arc<str> = Arc::from(blake3::hash(&bytes).to_hex().as_str());
        let size = bytes.len() as u64;

        self.node.blobs.entry(hash.clone()).or_insert_with(|| StoredBlob {
            data: bytes,
            published: false,
            served: Arc::new(watch::channel(0).0),
        });

        debug!(node = %self.node_id, hash = %hash, size, "Imported content");
        Ok(ContentHandle { id: hash, size })
    }

    async fn publish(&self, content: &ContentHandle) -> Result<Locator, TransportError> {
        let mut blob = self
            .node
            .blobs
            .get_mut(&content.id)
            .ok_or_else(|| TransportError::import(format!("content {} was never imported", content.id)))?;
        blob.published = true;
        blob.served.send_replace(0);
        Ok(self.locator_for(&content.id))
    }

    async fn serve(
        &self,
        content: &ContentHandle,
        on_progress: OnProgress,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut served = self
            .node
            .blobs
            .get(&content.id)
            .map(|blob| blob.served.subscribe())
            .ok_or_else(|| TransportError::import(format!("content {} was never imported", content.id)))?;

        loop {
            let offset = *served.borrow_and_update();
            on_progress(offset, content.size);
            if offset >= content.size {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(mut blob) = self.node.blobs.get_mut(&content.id) {
                        blob.published = false;
                    }
                    debug!(node = %self.node_id, hash = %content.id, "Stopped serving content");
                    return Err(TransportError::Cancelled);
                }
                changed = served.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::fetch("content dropped from store"));
                    }
                }
            }
        }
    }

    async fn resolve(&self, locator: &Locator) -> Result<ResolvedPeer, TransportError> {
        let (name, hash) = Self::parse_locator(locator)?;
        let node = self.reachable(name)?;
        let blob = node
            .blobs
            .get(hash)
            .filter(|blob| blob.published)
            .ok_or_else(|| TransportError::resolve(format!("content {hash} is not published by {name}")))?;

        Ok(ResolvedPeer {
            address: Arc::from(name),
            content_id: Arc::from(hash),
            size_hint: Some(blob.data.len() as u64),
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
        let node = self.reachable(&peer.address)?;
        let (data, served) = node
            .blobs
            .get(peer.content_id.as_ref())
            .filter(|blob| blob.published)
            .map(|blob| (blob.data.clone(), blob.served.clone()))
            .ok_or_else(|| TransportError::fetch(format!("content {} is no longer served", peer.content_id)))?;

        let serving_node = node.clone();
        let address = peer.address.clone();
        let report: OnProgress = Arc::new(move |done, total| {
            served.send_modify(|offset| *offset = (*offset).max(done));
            on_progress(done, total);
        });

        let written = write_chunked(&data, self.chunk_size, self.chunk_delay, destination, &report, &cancel).await?;

        if !serving_node.is_online() {
            return Err(TransportError::unreachable(format!("node {address} went offline")));
        }
        Ok(written)
    }
}
