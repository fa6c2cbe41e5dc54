//! Ticket encoding
//!
//! A ticket is the string a sender shares with a receiver. The enhanced form
//! carries the file name and size in front of the transport locator so the
//! receiver can show them before touching the network:
//!
//! ```text
//! <file_name>|<file_size>|<locator>     enhanced
//! <locator>                             legacy (anything without that shape)
//! ```
//!
//! Legacy tickets are a first-class input: anything that does not have the
//! enhanced shape is treated as a bare locator, never rejected. Sealed tickets
//! (see [`super::seal`]) are opened transparently before decoding.

use std::sync::Arc;

use serde::Serialize;

use super::seal;
use super::transfer::TransferError;
use super::transport::Locator;

/// Field separator of the enhanced ticket form
pub const SEPARATOR: char = '|';

/// File name given to legacy tickets when the caller has nothing better
pub const DEFAULT_PLACEHOLDER_NAME: &str = "received_file";

/// A decoded ticket; `Legacy` tickets have neither name nor size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub file_name: Option<Arc<str>>,
    pub file_size: Option<u64>,
    pub locator: Locator,
}

impl Ticket {
    pub fn is_legacy(&self) -> bool {
        self.file_name.is_none() && self.file_size.is_none()
    }

    pub fn metadata(&self) -> Option<TicketMetadata> {
        Some(TicketMetadata {
            file_name: self.file_name.clone()?,
            file_size: self.file_size?,
        })
    }

    pub fn file_name_or(&self, placeholder: &str) -> Arc<str> {
        self.file_name
            .clone()
            .unwrap_or_else(|| Arc::from(placeholder))
    }

    /// Zero means unknown; the transport corrects it once it reports a size.
    pub fn file_size_or_unknown(&self) -> u64 {
        self.file_size.unwrap_or(0)
    }
}

/// Name and size embedded in an enhanced ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketMetadata {
    pub file_name: Arc<str>,
    pub file_size: u64,
}

/// Builds the enhanced ticket string.
///
/// Fails only for a locator that is empty or contains [`SEPARATOR`].
pub fn encode(file_name: &str, file_size: u64, locator: &Locator) -> Result<String, TransferError> {
    let locator = locator.as_str();
    if locator.is_empty() {
        return Err(TransferError::invalid_ticket("locator is empty"));
    }
    if locator.contains(SEPARATOR) {
        return Err(TransferError::invalid_ticket(format!(
            "locator contains the separator '{SEPARATOR}'"
        )));
    }
    Ok(format!("{file_name}{SEPARATOR}{file_size}{SEPARATOR}{locator}"))
}

/// Decodes a ticket string, falling back to a legacy locator.
///
/// Only an empty ticket, or a sealed ticket that cannot be opened, is an error.
pub fn decode(ticket: &str) -> Result<Ticket, TransferError> {
    let ticket = ticket.trim();
    if ticket.is_empty() {
        return Err(TransferError::invalid_ticket("ticket is empty"));
    }

    if seal::is_sealed(ticket) {
        let opened = seal::open(ticket).map_err(|e| TransferError::invalid_ticket(e.to_string()))?;
        return decode_plain(opened.trim());
    }

    decode_plain(ticket)
}

fn decode_plain(ticket: &str) -> Result<Ticket, TransferError> {
    if ticket.is_empty() {
        return Err(TransferError::invalid_ticket("ticket is empty"));
    }

    // Split from the right: the locator and size never contain the separator,
    // the file name might.
    let mut parts = ticket.rsplitn(3, SEPARATOR);
    let (locator, size, name) = (parts.next(), parts.next(), parts.next());

    if let (Some(locator), Some(size), Some(name)) = (locator, size, name) {
        if let (Some(size), false) = (parse_size(size), locator.is_empty()) {
            return Ok(Ticket {
                file_name: Some(Arc::from(name)),
                file_size: Some(size),
                locator: Locator::from(locator),
            });
        }
    }

    // Anything else is the bare locator of an older client, separators included.
    Ok(Ticket {
        file_name: None,
        file_size: None,
        locator: Locator::from(ticket),
    })
}

fn parse_size(field: &str) -> Option<u64> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

/// Reads the embedded name and size without contacting any transport.
pub fn parse_metadata_only(ticket: &str) -> Result<TicketMetadata, TransferError> {
    decode(ticket)?
        .metadata()
        .ok_or(TransferError::MetadataUnavailable)
}

/// Ticket codec bound to a placeholder name for legacy tickets
#[derive(Debug, Clone)]
pub struct TicketCodec {
    placeholder: Arc<str>,
}

impl Default for TicketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PLACEHOLDER_NAME)
    }
}

impl TicketCodec {
    pub fn new(placeholder: impl Into<Arc<str>>) -> Self {
        Self {
            placeholder: placeholder.into(),
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    pub fn encode(&self, file_name: &str, file_size: u64, locator: &Locator) -> Result<String, TransferError> {
        encode(file_name, file_size, locator)
    }

    pub fn decode(&self, ticket: &str) -> Result<Ticket, TransferError> {
        decode(ticket)
    }

    /// Name and size for display, with defaults filled in for legacy tickets
    pub fn describe(&self, ticket: &Ticket) -> TicketMetadata {
        TicketMetadata {
            file_name: ticket.file_name_or(&self.placeholder),
            file_size: ticket.file_size_or_unknown(),
        }
    }
}
