//! Engine configuration

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::net::ticket::DEFAULT_PLACEHOLDER_NAME;
use crate::platform::FileAccessKind;

/// Default progress update batching interval in milliseconds
pub const DEFAULT_PROGRESS_BATCH_MS: u64 = 100;

/// Default capacity of the event broadcast channels
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default time `cancel` waits for the transport to stop
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 2000;

const ENV_PROGRESS_BATCH_MS: &str = "TICKETSHARE_PROGRESS_BATCH_MS";
const ENV_EVENT_CAPACITY: &str = "TICKETSHARE_EVENT_CAPACITY";
const ENV_CANCEL_GRACE_MS: &str = "TICKETSHARE_CANCEL_GRACE_MS";
const ENV_SEAL_TICKETS: &str = "TICKETSHARE_SEAL_TICKETS";
const ENV_FILE_ACCESS: &str = "TICKETSHARE_FILE_ACCESS";

/// Configuration for a [`TransferManager`](crate::net::TransferManager)
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Progress update batching interval in milliseconds
    pub progress_batch_ms: u64,
    /// Capacity of the global and per-transfer event channels
    pub event_channel_capacity: usize,
    /// File name recorded for legacy tickets without a better candidate
    pub placeholder_file_name: Arc<str>,
    /// How long `cancel` waits for the transfer task before forcing the state
    pub cancel_grace_ms: u64,
    /// Wrap produced tickets in the sealed envelope
    pub seal_tickets: bool,
    pub file_access: FileAccessKind,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress_batch_ms: DEFAULT_PROGRESS_BATCH_MS,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            placeholder_file_name: Arc::from(DEFAULT_PLACEHOLDER_NAME),
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            seal_tickets: false,
            file_access: FileAccessKind::Path,
        }
    }
}

impl TransferConfig {
    /// Defaults overridden by `TICKETSHARE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = parsed(&lookup, ENV_PROGRESS_BATCH_MS) {
            config.progress_batch_ms = value;
        }
        if let Some(value) = parsed(&lookup, ENV_EVENT_CAPACITY) {
            config.event_channel_capacity = value;
        }
        if let Some(value) = parsed(&lookup, ENV_CANCEL_GRACE_MS) {
            config.cancel_grace_ms = value;
        }
        if let Some(raw) = lookup(ENV_SEAL_TICKETS) {
            match parse_flag(&raw) {
                Some(flag) => config.seal_tickets = flag,
                None => warn!(key = ENV_SEAL_TICKETS, value = %raw, "Ignoring invalid boolean"),
            }
        }
        if let Some(value) = parsed(&lookup, ENV_FILE_ACCESS) {
            config.file_access = value;
        }

        config
    }

    #[inline]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_batch_ms)
    }

    #[inline]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring invalid configuration value");
            None
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert_eq!(config.progress_batch_ms, 100);
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.placeholder_file_name.as_ref(), "received_file");
        assert_eq!(config.cancel_grace(), Duration::from_secs(2));
        assert!(!config.seal_tickets);
        assert_eq!(config.file_access, FileAccessKind::Path);
    }

    #[test]
    fn test_overrides_applied() {
        let config = TransferConfig::from_lookup(lookup(&[
            (ENV_PROGRESS_BATCH_MS, "250"),
            (ENV_EVENT_CAPACITY, "32"),
            (ENV_CANCEL_GRACE_MS, " 10 "),
            (ENV_SEAL_TICKETS, "yes"),
            (ENV_FILE_ACCESS, "uri"),
        ]));

        assert_eq!(config.progress_interval(), Duration::from_millis(250));
        assert_eq!(config.event_channel_capacity, 32);
        assert_eq!(config.cancel_grace_ms, 10);
        assert!(config.seal_tickets);
        assert_eq!(config.file_access, FileAccessKind::Uri);
    }

    #[test]
    fn test_invalid_values_ignored() {
        let config = TransferConfig::from_lookup(lookup(&[
            (ENV_PROGRESS_BATCH_MS, "fast"),
            (ENV_EVENT_CAPACITY, "-1"),
            (ENV_SEAL_TICKETS, "maybe"),
            (ENV_FILE_ACCESS, "smb"),
        ]));

        assert_eq!(config.progress_batch_ms, DEFAULT_PROGRESS_BATCH_MS);
        assert_eq!(config.event_channel_capacity, DEFAULT_EVENT_CHANNEL_CAPACITY);
        assert!(!config.seal_tickets);
        assert_eq!(config.file_access, FileAccessKind::Path);
    }
}
