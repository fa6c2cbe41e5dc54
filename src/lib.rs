//! ticketshare - share a file by handing over a ticket
//!
//! The sender imports a file into a peer-to-peer transport and gets back a
//! compact ticket string carrying the file's name, size and locator. The
//! receiver decodes the ticket, can show what it is about to download, and
//! pulls the bytes while progress is tracked per transfer.
//!
//! # Modules
//!
//! - [`net`]: ticket codec, transfer registry, progress throttling, the
//!   transfer engine and the transport seam
//! - [`platform`]: file access for plain paths and `file://` URIs
//! - [`config`]: engine configuration with environment overrides

pub mod config;
pub mod net;
pub mod platform;

pub use config::TransferConfig;
pub use net::{TransferError, TransferManager};
