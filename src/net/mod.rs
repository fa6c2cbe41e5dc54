//! Ticket-based transfers
//!
//! - **Ticket**: the `name|size|locator` string a sender shares, optionally sealed
//! - **Transfer**: records, the registry and the transfer state machine
//! - **Progress**: throttling raw transport samples into registry updates
//! - **Engine**: `TransferManager`, which starts, tracks and cancels transfers
//! - **Transport**: the seam to the peer-to-peer byte mover, with an
//!   in-process loopback implementation and (feature `iroh`) an iroh-blobs one
//!
//! # Example
//!
//! ```rust,ignore
//! use ticketshare::net::{LoopbackNetwork, TransferManager};
//! use ticketshare::TransferConfig;
//!
//! let network = LoopbackNetwork::new();
//! let alice = TransferManager::new(Arc::new(network.join("alice")), TransferConfig::default());
//! let bob = TransferManager::new(Arc::new(network.join("bob")), TransferConfig::default());
//!
//! let sent = alice.send("photo.jpg").await?;
//! let id = bob.receive(&sent.ticket, "downloads/photo.jpg").await?;
//! ```

pub mod engine;
pub mod events;
pub mod loopback;
pub mod progress;
pub mod seal;
pub mod ticket;
pub mod transfer;
pub mod transport;

#[cfg(feature = "iroh")]
pub mod blobs;
#[cfg(feature = "iroh")]
pub mod endpoint;

#[cfg(feature = "iroh")]
pub use blobs::IrohTransport;
#[cfg(feature = "iroh")]
pub use endpoint::Endpoint;
pub use engine::{SendTicket, TransferManager};
pub use events::{TransferEvent, TransferSubscription};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use progress::{ProgressMultiplexer, ProgressReporter};
pub use ticket::{Ticket, TicketCodec, TicketMetadata};
pub use transfer::{
    TransferDirection, TransferError, TransferId, TransferRecord, TransferRegistry, TransferStatus,
};
pub use transport::{ContentHandle, Locator, OnProgress, PeerTransport, ResolvedPeer, TransportError};
