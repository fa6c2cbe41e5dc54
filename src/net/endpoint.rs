//! Iroh endpoint and device identity
//!
//! Each device has a persistent secret key stored at
//! `<config_dir>/ticketshare/device_key`, so tickets produced across restarts
//! point at the same node id. Set `TICKETSHARE_CONFIG_DIR` to run several
//! instances on one machine.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use iroh::{Endpoint as IrohEndpoint, PublicKey, SecretKey};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// Default configuration directory name
const CONFIG_DIR: &str = "ticketshare";

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "TICKETSHARE_CONFIG_DIR";

const DEVICE_KEY_FILE: &str = "device_key";

static CONFIG_DIR_CACHE: OnceCell<PathBuf> = OnceCell::new();

#[derive(Error, Debug, Clone)]
pub enum EndpointError {
    #[error("failed to access configuration directory: {0}")]
    ConfigDir(Arc<str>),

    #[error("failed to persist device key: {0}")]
    KeyPersistence(Arc<str>),

    #[error("endpoint has been shut down")]
    Shutdown,
}

impl EndpointError {
    #[inline]
    fn config_dir(msg: impl Into<String>) -> Self {
        Self::ConfigDir(Arc::from(msg.into()))
    }

    #[inline]
    fn key_persistence(msg: impl Into<String>) -> Self {
        Self::KeyPersistence(Arc::from(msg.into()))
    }
}

#[derive(Debug)]
enum EndpointState {
    Running(IrohEndpoint),
    Shutdown,
}

/// Bound iroh endpoint carrying this device's identity
#[derive(Debug)]
pub struct Endpoint {
    public_key: PublicKey,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    /// Loads (or creates) the device key and binds the endpoint.
    #[instrument(name = "endpoint_bind")]
    pub async fn bind() -> Result<Self> {
        let secret_key = load_or_create_device_key(&config_dir()?).await?;
        let public_key = secret_key.public();

        info!(device_id = %public_key, "Device identity loaded");

        let endpoint = IrohEndpoint::builder()
            .secret_key(secret_key)
            .discovery_n0()
            .discovery_local_network()
            .bind()
            .await
            .context("failed to bind iroh endpoint")?;

        debug!("Endpoint initialized");

        Ok(Self {
            public_key,
            state: RwLock::new(EndpointState::Running(endpoint)),
        })
    }

    #[inline]
    pub fn device_id(&self) -> PublicKey {
        self.public_key
    }

    /// Clone of the underlying iroh endpoint, for protocol handlers
    pub fn iroh_endpoint(&self) -> Result<IrohEndpoint, EndpointError> {
        match &*self.state.read() {
            EndpointState::Running(endpoint) => Ok(endpoint.clone()),
            EndpointState::Shutdown => Err(EndpointError::Shutdown),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.state.read(), EndpointState::Running(_))
    }

    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let endpoint = {
            let mut state = self.state.write();
            match std::mem::replace(&mut *state, EndpointState::Shutdown) {
                EndpointState::Running(endpoint) => endpoint,
                EndpointState::Shutdown => {
                    warn!("Endpoint already shut down");
                    return;
                }
            }
        };

        info!("Shutting down endpoint");
        endpoint.close().await;
    }
}

/// Configuration directory (cached after the first call).
pub fn config_dir() -> Result<PathBuf> {
    CONFIG_DIR_CACHE
        .get_or_try_init(|| {
            if let Ok(custom_dir) = std::env::var(CONFIG_DIR_ENV) {
                return Ok(PathBuf::from(custom_dir));
            }

            dirs::config_dir()
                .map(|p| p.join(CONFIG_DIR))
                .ok_or_else(|| EndpointError::config_dir("could not determine config directory").into())
        })
        .cloned()
}

#[instrument]
async fn load_or_create_device_key(dir: &Path) -> Result<SecretKey> {
    let key_path = dir.join(DEVICE_KEY_FILE);

    if fs::try_exists(&key_path).await.unwrap_or(false) {
        debug!(path = %key_path.display(), "Loading existing device key");

        let buffer = fs::read(&key_path)
            .await
            .context("failed to read device key")?;

        let key_array: [u8; 32] = buffer
            .try_into()
            .map_err(|_| EndpointError::key_persistence("invalid key length"))?;

        info!("Loaded existing device identity");
        return Ok(SecretKey::from_bytes(&key_array));
    }

    debug!("No existing device key found, generating new identity");
    let secret_key = SecretKey::generate(rand::thread_rng());

    fs::create_dir_all(dir)
        .await
        .context("failed to create config directory")?;
    write_key(key_path.clone(), secret_key.to_bytes()).await?;

    info!(path = %key_path.display(), "Generated and saved new device identity");
    Ok(secret_key)
}

/// Writes the key readable by the owner only.
async fn write_key(key_path: PathBuf, key_bytes: [u8; 32]) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&key_path)
            .map_err(|e| EndpointError::key_persistence(format!("failed to open key file: {e}")))?;
        file.write_all(&key_bytes)
            .and_then(|_| file.flush())
            .map_err(|e| EndpointError::key_persistence(format!("failed to write key: {e}")))?;

        Ok::<_, anyhow::Error>(())
    })
    .await
    .context("key write task failed")??;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_error_types() {
        let err = EndpointError::config_dir("test error");
        assert!(matches!(err, EndpointError::ConfigDir(_)));
        assert!(err.to_string().contains("test error"));

        let err: anyhow::Error = EndpointError::Shutdown.into();
        assert!(err.to_string().contains("shut down"));
    }

    #[tokio::test]
    async fn test_device_key_generation_and_loading() {
        let temp_dir = TempDir::new().unwrap();

        let key1 = load_or_create_device_key(temp_dir.path()).await.unwrap();

        let file_content = fs::read(temp_dir.path().join(DEVICE_KEY_FILE)).await.unwrap();
        assert_eq!(file_content, key1.to_bytes().as_slice());

        let key2 = load_or_create_device_key(temp_dir.path()).await.unwrap();
        assert_eq!(key1.to_bytes(), key2.to_bytes());
        assert_eq!(key1.public(), key2.public());
    }

    #[tokio::test]
    async fn test_device_key_created_in_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a/b");

        load_or_create_device_key(&nested).await.unwrap();
        assert!(nested.join(DEVICE_KEY_FILE).exists());
    }

    #[tokio::test]
    async fn test_device_key_invalid_length() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(DEVICE_KEY_FILE), b"too short")
            .await
            .unwrap();

        let err = load_or_create_device_key(temp_dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("invalid key length"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_file_permissions_unix() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        load_or_create_device_key(temp_dir.path()).await.unwrap();

        let metadata = fs::metadata(temp_dir.path().join(DEVICE_KEY_FILE)).await.unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}
