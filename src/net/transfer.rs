//! Transfer records and the registry that owns them
//!
//! Every send or receive operation is tracked by exactly one [`TransferRecord`],
//! keyed by a [`TransferId`] and owned by the [`TransferRegistry`]. The registry
//! enforces the transfer state machine:
//!
//! ```text
//! Pending ──first sample──▶ InProgress ──▶ Completed | Failed | Cancelled
//!    └──────────────────────────────────▶ Completed | Failed | Cancelled
//! ```
//!
//! Terminal states are final. Events describing each mutation are published
//! while the record is still locked, so subscribers observe them in the same
//! order the registry applied them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::events::{EventBus, TransferEvent, TransferSubscription};
use super::transport::Locator;

/// Errors surfaced by the transfer engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("invalid ticket: {0}")]
    InvalidTicket(Arc<str>),

    #[error("ticket carries no file metadata")]
    MetadataUnavailable,

    #[error("failed to read file: {0}")]
    FileRead(Arc<str>),

    #[error("failed to write file: {0}")]
    Write(Arc<str>),

    #[error("failed to import content: {0}")]
    Import(Arc<str>),

    #[error("failed to resolve ticket: {0}")]
    Resolve(Arc<str>),

    #[error("fetch failed: {0}")]
    Fetch(Arc<str>),

    #[error("peer unreachable: {0}")]
    PeerUnreachable(Arc<str>),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: TransferId,
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("transfer not found: {0}")]
    NotFound(TransferId),
}

impl TransferError {
    #[inline]
    pub(crate) fn invalid_ticket(msg: impl Into<String>) -> Self {
        Self::InvalidTicket(Arc::from(msg.into()))
    }
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Current status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Returns true if the transfer is in a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    /// Returns true if the state machine has an edge from `self` to `next`
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Pending, InProgress) => true,
            (Pending | InProgress, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier for a transfer
///
/// Identifiers come from a process-wide counter, so they are never reused and
/// sort in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(u64);

impl TransferId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw u64 value of this transfer ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Snapshot of a single transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub file_name: Arc<str>,
    /// Zero means the size is not known yet.
    pub file_size: u64,
    pub bytes_transferred: u64,
    pub speed_bytes_per_second: f64,
    pub status: TransferStatus,
    /// Set iff `status` is `Failed`.
    pub error: Option<Arc<str>>,
    pub locator: Locator,
    pub created_at: SystemTime,
}

impl TransferRecord {
    pub fn percent(&self) -> u8 {
        if self.file_size == 0 {
            return if self.status == TransferStatus::Completed { 100 } else { 0 };
        }
        let pct = (self.bytes_transferred as f64 / self.file_size as f64) * 100.0;
        pct.min(100.0) as u8
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Calculates ETA in seconds based on the last measured speed
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.speed_bytes_per_second <= 0.0
            || self.file_size == 0
            || self.bytes_transferred >= self.file_size
        {
            return None;
        }
        let remaining = (self.file_size - self.bytes_transferred) as f64;
        Some((remaining / self.speed_bytes_per_second) as u64)
    }
}

/// Result of a terminal transition request
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The record moved into the requested state
    Applied(TransferRecord),
    /// The record was already in the requested state
    Unchanged(TransferRecord),
}

impl Transition {
    pub fn record(&self) -> &TransferRecord {
        match self {
            Transition::Applied(record) | Transition::Unchanged(record) => record,
        }
    }

    pub fn into_record(self) -> TransferRecord {
        match self {
            Transition::Applied(record) | Transition::Unchanged(record) => record,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Owns every transfer record for the lifetime of the process
#[derive(Debug)]
pub struct TransferRegistry {
    records: DashMap<TransferId, TransferRecord>,
    events: EventBus,
}

impl TransferRegistry {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            events: EventBus::new(event_capacity),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Registers a new transfer in the `Pending` state.
    pub fn create(
        &self,
        direction: TransferDirection,
        file_name: impl Into<Arc<str>>,
        file_size: u64,
        locator: Locator,
    ) -> TransferId {
        let id = TransferId::new();
        let record = TransferRecord {
            id,
            direction,
            file_name: file_name.into(),
            file_size,
            bytes_transferred: 0,
            speed_bytes_per_second: 0.0,
            status: TransferStatus::Pending,
            error: None,
            locator,
            created_at: SystemTime::now(),
        };

        info!(
            transfer_id = %id,
            direction = ?direction,
            file_name = %record.file_name,
            file_size,
            "Transfer registered"
        );

        self.events.open(id);
        let entry = self.records.entry(id).or_insert(record);
        self.events.publish(TransferEvent::Updated(entry.value().clone()));
        id
    }

    pub fn get(&self, id: TransferId) -> Result<TransferRecord, TransferError> {
        self.records
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(TransferError::NotFound(id))
    }

    /// Applies a progress sample.
    ///
    /// Returns `Ok(None)` when the record is already terminal and the sample was
    /// ignored. `bytes_transferred` never decreases and is clamped to
    /// `file_size` once the size is known.
    pub fn update_progress(
        &self,
        id: TransferId,
        bytes_transferred: u64,
        file_size: Option<u64>,
        speed: Option<f64>,
    ) -> Result<Option<TransferRecord>, TransferError> {
        let mut entry = self.records.get_mut(&id).ok_or(TransferError::NotFound(id))?;
        let record = entry.value_mut();

        if record.status.is_terminal() {
            debug!(transfer_id = %id, status = %record.status, "Ignoring progress on finished transfer");
            return Ok(None);
        }

        // A size correction never drops below what was already recorded.
        if let Some(size) = file_size.filter(|size| *size > 0) {
            record.file_size = size.max(record.bytes_transferred);
        }

        let mut bytes = bytes_transferred.max(record.bytes_transferred);
        if record.file_size > 0 {
            bytes = bytes.min(record.file_size);
        }
        record.bytes_transferred = bytes;

        if let Some(speed) = speed.filter(|speed| speed.is_finite() && *speed >= 0.0) {
            record.speed_bytes_per_second = speed;
        }

        if record.status == TransferStatus::Pending {
            record.status = TransferStatus::InProgress;
            debug!(transfer_id = %id, "Transfer started");
            self.events.publish(TransferEvent::Updated(record.clone()));
        }

        let snapshot = record.clone();
        self.events.publish(TransferEvent::Progress(snapshot.clone()));
        Ok(Some(snapshot))
    }

    pub fn complete(&self, id: TransferId) -> Result<Transition, TransferError> {
        self.finish(id, TransferStatus::Completed, None)
    }

    pub fn fail(&self, id: TransferId, error: impl Into<Arc<str>>) -> Result<Transition, TransferError> {
        self.finish(id, TransferStatus::Failed, Some(error.into()))
    }

    pub fn cancel(&self, id: TransferId) -> Result<Transition, TransferError> {
        self.finish(id, TransferStatus::Cancelled, None)
    }

    fn finish(
        &self,
        id: TransferId,
        target: TransferStatus,
        error: Option<Arc<str>>,
    ) -> Result<Transition, TransferError> {
        let mut entry = self.records.get_mut(&id).ok_or(TransferError::NotFound(id))?;
        let record = entry.value_mut();

        if record.status == target {
            debug!(transfer_id = %id, status = %target, "Transfer already in requested state");
            return Ok(Transition::Unchanged(record.clone()));
        }

        if !record.status.can_transition_to(target) {
            warn!(transfer_id = %id, from = %record.status, to = %target, "Rejected transition on finished transfer");
            return Err(TransferError::InvalidTransition {
                id,
                from: record.status,
                to: target,
            });
        }

        record.status = target;
        record.error = error;
        if target == TransferStatus::Completed && record.file_size > 0 {
            record.bytes_transferred = record.file_size;
        }

        match (&record.status, &record.error) {
            (TransferStatus::Failed, Some(reason)) => {
                tracing::error!(transfer_id = %id, error = %reason, "Transfer failed")
            }
            (status, _) => info!(transfer_id = %id, status = %status, "Transfer finished"),
        }

        let snapshot = record.clone();
        self.events.publish(TransferEvent::Updated(snapshot.clone()));
        Ok(Transition::Applied(snapshot))
    }

    /// Snapshot of every transfer, oldest first
    pub fn list(&self) -> Vec<TransferRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Snapshot of the transfers that have not reached a terminal state
    pub fn active(&self) -> Vec<TransferRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    /// Removes finished transfers and closes their event channels
    pub fn clear_finished(&self) -> usize {
        let mut removed = Vec::new();
        self.records.retain(|id, record| {
            if record.is_terminal() {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        for id in &removed {
            self.events.close(*id);
        }
        removed.len()
    }

    /// Returns the current record together with a subscription to its later events.
    ///
    /// The subscription is taken while the record is locked, so no event is
    /// lost or duplicated between the snapshot and the stream.
    pub fn watch(&self, id: TransferId) -> Result<(TransferRecord, TransferSubscription), TransferError> {
        let entry = self.records.get(&id).ok_or(TransferError::NotFound(id))?;
        let snapshot = entry.value().clone();
        let subscription = self
            .events
            .subscribe(id, snapshot.is_terminal())
            .ok_or(TransferError::NotFound(id))?;
        Ok((snapshot, subscription))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
