//! Transfer orchestration
//!
//! [`TransferManager`] ties the ticket codec, the registry and the progress
//! multiplexer to a [`PeerTransport`] and a [`FileAccess`] implementation.
//! `send` and `receive` return as soon as the transfer has started; the byte
//! streaming runs in a background task and is observed through the registry
//! and its event subscriptions.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::events::{TransferEvent, TransferSubscription};
use super::progress::ProgressMultiplexer;
use super::seal;
use super::ticket::{self, TicketCodec, TicketMetadata};
use super::transfer::{
    TransferDirection, TransferError, TransferId, TransferRecord, TransferRegistry, Transition,
};
use super::transport::{PeerTransport, TransportError};
use crate::config::TransferConfig;
use crate::platform::FileAccess;

/// What a successful `send` hands back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTicket {
    /// The string to share with the receiver
    pub ticket: String,
    pub transfer_id: TransferId,
    pub file_name: Arc<str>,
    pub file_size: u64,
}

/// Background task driving one transfer
#[derive(Debug)]
struct ActiveTransfer {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Starts, tracks and cancels transfers
pub struct TransferManager {
    transport: Arc<dyn PeerTransport>,
    files: Arc<dyn FileAccess>,
    registry: Arc<TransferRegistry>,
    progress: ProgressMultiplexer,
    codec: TicketCodec,
    active: Arc<DashMap<TransferId, ActiveTransfer>>,
    config: TransferConfig,
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("node_id", &self.transport.node_id())
            .field("transfers", &self.registry.len())
            .field("active", &self.active.len())
            .field("config", &self.config)
            .finish()
    }
}

impl TransferManager {
    /// Creates a manager using the file access layer selected by `config`.
    pub fn new(transport: Arc<dyn PeerTransport>, config: TransferConfig) -> Self {
        let files = config.file_access.build(None);
        Self::with_file_access(transport, files, config)
    }

    pub fn with_file_access(
        transport: Arc<dyn PeerTransport>,
        files: Arc<dyn FileAccess>,
        config: TransferConfig,
    ) -> Self {
        let registry = Arc::new(TransferRegistry::new(config.event_channel_capacity));
        let progress = ProgressMultiplexer::new(registry.clone(), config.progress_interval());
        let codec = TicketCodec::new(config.placeholder_file_name.clone());

        info!(
            node_id = %transport.node_id(),
            progress_batch_ms = config.progress_batch_ms,
            seal_tickets = config.seal_tickets,
            "Transfer manager initialized"
        );

        Self {
            transport,
            files,
            registry,
            progress,
            codec,
            active: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Imports a file, publishes it and returns the ticket to share.
    ///
    /// Read and import failures are returned before any record exists. The
    /// record then follows the transport's serve progress.
    #[instrument(skip(self))]
    pub async fn send(&self, path: &str) -> Result<SendTicket, TransferError> {
        let data = self.files.read_all(path).await?;
        let file_size = data.len() as u64;
        let file_name: Arc<str> = self
            .files
            .file_name(path)
            .map(Arc::from)
            .unwrap_or_else(|| Arc::from(self.codec.placeholder()));

        let content = self.transport.import(data).await?;
        let locator = self.transport.publish(&content).await?;

        let mut ticket = self.codec.encode(&file_name, file_size, &locator)?;
        if self.config.seal_tickets {
            ticket = seal::seal(&ticket, &self.transport.node_id())
                .map_err(|e| TransferError::invalid_ticket(e.to_string()))?;
        }

        let id = self
            .registry
            .create(TransferDirection::Send, file_name.clone(), file_size, locator);
        info!(transfer_id = %id, file_name = %file_name, file_size, "Ticket created");

        let cancel = CancellationToken::new();
        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let reporter = self.progress.reporter(id);
        let token = cancel.clone();

        self.spawn_tracked(id, cancel, async move {
            let outcome = transport.serve(&content, reporter.callback(), token.clone()).await;
            if outcome.is_ok() {
                reporter.finish(content.size);
            }
            settle(&registry, id, &token, outcome);
        });

        Ok(SendTicket {
            ticket,
            transfer_id: id,
            file_name,
            file_size,
        })
    }

    /// Starts downloading the ticket's content to `output`.
    ///
    /// Returns once the fetch has been started. Resolve and write errors that
    /// happen before that are returned here and also recorded as `Failed`;
    /// later failures only show up on the record.
    #[instrument(skip(self, ticket))]
    pub async fn receive(&self, ticket: &str, output: &str) -> Result<TransferId, TransferError> {
        let decoded = self.codec.decode(ticket)?;

        let file_name: Arc<str> = match &decoded.file_name {
            Some(name) => name.clone(),
            None => self
                .files
                .file_name(output)
                .map(Arc::from)
                .unwrap_or_else(|| Arc::from(self.codec.placeholder())),
        };
        let id = self.registry.create(
            TransferDirection::Receive,
            file_name,
            decoded.file_size_or_unknown(),
            decoded.locator.clone(),
        );

        let peer = match self.transport.resolve(&decoded.locator).await {
            Ok(peer) => peer,
            Err(e) => return Err(self.fail_early(id, e.into())),
        };
        debug!(transfer_id = %id, peer = %peer.address, "Resolved peer");

        let mut writer = match self.files.open_for_write(output).await {
            Ok(writer) => writer,
            Err(e) => return Err(self.fail_early(id, e.into())),
        };

        let cancel = CancellationToken::new();
        let transport = self.transport.clone();
        let registry = self.registry.clone();
        let reporter = self.progress.reporter(id);
        let token = cancel.clone();

        self.spawn_tracked(id, cancel, async move {
            let outcome = transport
                .fetch(&peer, &mut *writer, reporter.callback(), token.clone())
                .await
                .map(|total| {
                    reporter.finish(total);
                });
            settle(&registry, id, &token, outcome);
        });

        info!(transfer_id = %id, output, "Download started");
        Ok(id)
    }

    /// Asks `approve` before receiving; `Ok(None)` when declined.
    ///
    /// Legacy tickets carry no metadata, so `approve` sees `None` for them.
    pub async fn receive_with_approval<F>(
        &self,
        ticket: &str,
        output: &str,
        approve: F,
    ) -> Result<Option<TransferId>, TransferError>
    where
        F: FnOnce(Option<&TicketMetadata>) -> bool,
    {
        let metadata = match self.parse_metadata(ticket) {
            Ok(metadata) => Some(metadata),
            Err(TransferError::MetadataUnavailable) => None,
            Err(e) => return Err(e),
        };

        if !approve(metadata.as_ref()) {
            info!("Transfer declined");
            return Ok(None);
        }
        self.receive(ticket, output).await.map(Some)
    }

    /// Reads the name and size embedded in a ticket without touching the network.
    pub fn parse_metadata(&self, ticket: &str) -> Result<TicketMetadata, TransferError> {
        ticket::parse_metadata_only(ticket)
    }

    pub fn status(&self, id: TransferId) -> Result<TransferRecord, TransferError> {
        self.registry.get(id)
    }

    pub fn list(&self) -> Vec<TransferRecord> {
        self.registry.list()
    }

    pub fn active(&self) -> Vec<TransferRecord> {
        self.registry.active()
    }

    pub fn clear_finished(&self) -> usize {
        self.registry.clear_finished()
    }

    /// Current record plus a stream of its later events
    pub fn subscribe(&self, id: TransferId) -> Result<(TransferRecord, TransferSubscription), TransferError> {
        self.registry.watch(id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<TransferEvent> {
        self.registry.events().subscribe_all()
    }

    /// Requests cancellation and waits up to `cancel_grace_ms` for the task.
    ///
    /// The record ends up `Cancelled` whether or not the transport stopped in
    /// time; a partially written destination is left for the caller to remove.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: TransferId) -> Result<TransferRecord, TransferError> {
        let record = self.registry.get(id)?;

        if record.is_active() {
            if let Some((_, active)) = self.active.remove(&id) {
                active.cancel.cancel();
                if let Some(task) = active.task {
                    match tokio::time::timeout(self.config.cancel_grace(), task).await {
                        Ok(_) => debug!(transfer_id = %id, "Transfer task stopped"),
                        Err(_) => warn!(
                            transfer_id = %id,
                            grace_ms = self.config.cancel_grace_ms,
                            "Transport did not stop in time, forcing cancellation"
                        ),
                    }
                }
            }
        }

        self.registry.cancel(id).map(Transition::into_record)
    }

    fn fail_early(&self, id: TransferId, err: TransferError) -> TransferError {
        if let Err(e) = self.registry.fail(id, err.to_string()) {
            warn!(transfer_id = %id, error = %e, "Could not record failure");
        }
        err
    }

    fn spawn_tracked<F>(&self, id: TransferId, cancel: CancellationToken, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.active.insert(id, ActiveTransfer { cancel, task: None });

        let active = self.active.clone();
        let task = tokio::spawn(async move {
            work.await;
            active.remove(&id);
        });

        // The task may already have finished and removed its entry.
        if let Some(mut entry) = self.active.get_mut(&id) {
            entry.task = Some(task);
        }
    }
}

/// Records the outcome of a transport operation on the transfer.
///
/// A requested cancellation wins over whatever the transport returned.
fn settle(
    registry: &TransferRegistry,
    id: TransferId,
    cancel: &CancellationToken,
    outcome: Result<(), TransportError>,
) {
    let result = match outcome {
        _ if cancel.is_cancelled() => registry.cancel(id),
        Err(TransportError::Cancelled) => registry.cancel(id),
        Ok(()) => registry.complete(id),
        Err(e) => registry.fail(id, TransferError::from(e).to_string()),
    };

    if let Err(e) = result {
        warn!(transfer_id = %id, error = %e, "Could not record transfer outcome");
    }
}
