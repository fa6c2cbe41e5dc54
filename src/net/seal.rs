//! Sealed ticket envelope
//!
//! Wraps a plain ticket as `ticketshare://<sender_id>:<base64url(nonce || ciphertext)>`
//! using AES-256-GCM. The key is derived from the sender's node id, which the
//! envelope carries, so any receiver can open it: this keeps file names out
//! of casual view (chat logs, QR scanners) but is not access control.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Scheme prefix identifying a sealed ticket
pub const SEALED_PREFIX: &str = "ticketshare://";

const KEY_CONTEXT: &[u8] = b"ticketshare-ticket-key-";
const NONCE_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("missing '{SEALED_PREFIX}' prefix")]
    MissingPrefix,

    #[error("sender id is empty or contains ':'")]
    InvalidSender,

    #[error("sealed ticket has no sender id")]
    MissingSender,

    #[error("invalid encoding: {0}")]
    Encoding(String),

    #[error("sealed ticket too short")]
    TooShort,

    #[error("encryption failed")]
    Encrypt,

    #[error("ticket could not be opened")]
    Decrypt,

    #[error("sealed ticket is not valid UTF-8")]
    Utf8,
}

fn derive_key(sender_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_CONTEXT);
    hasher.update(sender_id.as_bytes());
    hasher.finalize().into()
}

pub fn is_sealed(ticket: &str) -> bool {
    ticket.starts_with(SEALED_PREFIX)
}

pub fn seal(ticket: &str, sender_id: &str) -> Result<String, SealError> {
    if sender_id.is_empty() || sender_id.contains(':') {
        return Err(SealError::InvalidSender);
    }

    let cipher = Aes256Gcm::new(&derive_key(sender_id).into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), ticket.as_bytes())
        .map_err(|_| SealError::Encrypt)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!(
        "{SEALED_PREFIX}{sender_id}:{}",
        URL_SAFE_NO_PAD.encode(&combined)
    ))
}

pub fn open(sealed: &str) -> Result<String, SealError> {
    let body = sealed
        .strip_prefix(SEALED_PREFIX)
        .ok_or(SealError::MissingPrefix)?;
    let (sender_id, encoded) = body.split_once(':').ok_or(SealError::MissingSender)?;
    if sender_id.is_empty() {
        return Err(SealError::MissingSender);
    }

    let combined = URL_SAFE_NO_PAD
        .decode(encoded.as_bytes())
        .map_err(|e| SealError::Encoding(e.to_string()))?;
    if combined.len() < NONCE_LEN {
        return Err(SealError::TooShort);
    }
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(&derive_key(sender_id).into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SealError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| SealError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let plain = "test.txt|1234|blobhash123";
        let sealed = seal(plain, "node-a").unwrap();

        assert!(is_sealed(&sealed));
        assert!(sealed.contains("node-a"));
        assert_eq!(open(&sealed).unwrap(), plain);
    }

    #[test]
    fn test_nonce_makes_output_differ() {
        let plain = "test.txt|1234|blobhash123";
        assert_ne!(seal(plain, "node-a").unwrap(), seal(plain, "node-a").unwrap());
    }

    #[test]
    fn test_sealed_output_is_url_safe_and_separator_free() {
        let sealed = seal("a|1|b", "node").unwrap();
        let body = sealed.strip_prefix(SEALED_PREFIX).unwrap();
        assert!(!body.contains('='));
        assert!(!body.contains('+'));
        assert!(!body.contains('/'));
        assert!(!sealed.contains('|'));
    }

    #[test]
    fn test_tampered_sender_fails() {
        let sealed = seal("a|1|b", "node-a").unwrap();
        let forged = sealed.replacen("node-a", "node-b", 1);
        assert_eq!(open(&forged), Err(SealError::Decrypt));
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(open("invalid"), Err(SealError::MissingPrefix));
        assert_eq!(open("ticketshare://nocolon"), Err(SealError::MissingSender));
        assert!(matches!(open("ticketshare://n:!!!"), Err(SealError::Encoding(_))));
        assert_eq!(open("ticketshare://n:AA"), Err(SealError::TooShort));
        assert_eq!(seal("x", "bad:id"), Err(SealError::InvalidSender));
        assert_eq!(seal("x", ""), Err(SealError::InvalidSender));
    }
}
