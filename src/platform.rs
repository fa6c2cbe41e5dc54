//! Platform file access
//!
//! The engine treats paths as opaque strings and goes through a
//! [`FileAccess`] implementation for every read and write. [`LocalFiles`]
//! handles plain filesystem paths; [`UriFiles`] additionally accepts
//! `file://` URIs, which is how content pickers on mobile platforms hand
//! out locations.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncWrite, BufWriter};
use tracing::debug;
use url::Url;

use crate::net::TransferError;

/// Writer handed to the transport during a fetch
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FileAccessError {
    #[error("cannot read {path}: {reason}")]
    Read { path: Arc<str>, reason: Arc<str> },

    #[error("cannot write {path}: {reason}")]
    Write { path: Arc<str>, reason: Arc<str> },
}

impl FileAccessError {
    fn read(path: &str, reason: impl ToString) -> Self {
        Self::Read {
            path: Arc::from(path),
            reason: Arc::from(reason.to_string()),
        }
    }

    fn write(path: &str, reason: impl ToString) -> Self {
        Self::Write {
            path: Arc::from(path),
            reason: Arc::from(reason.to_string()),
        }
    }
}

impl From<FileAccessError> for TransferError {
    fn from(err: FileAccessError) -> Self {
        match err {
            FileAccessError::Read { .. } => TransferError::FileRead(Arc::from(err.to_string())),
            FileAccessError::Write { .. } => TransferError::Write(Arc::from(err.to_string())),
        }
    }
}

#[async_trait]
pub trait FileAccess: Send + Sync + 'static {
    async fn read_all(&self, location: &str) -> Result<Bytes, FileAccessError>;

    /// Creates (or truncates) the destination and returns a writer for it.
    async fn open_for_write(&self, location: &str) -> Result<FileWriter, FileAccessError>;

    /// Display name of the file at `location`, if it has one.
    fn file_name(&self, location: &str) -> Option<String>;
}

/// Plain filesystem paths, relative ones resolved against `base_dir`
#[derive(Debug, Clone, Default)]
pub struct LocalFiles {
    base_dir: Option<PathBuf>,
}

impl LocalFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn read_path(&self, path: &Path, location: &str) -> Result<Bytes, FileAccessError> {
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| FileAccessError::read(location, e))?;
        if !metadata.is_file() {
            return Err(FileAccessError::read(location, "not a regular file"));
        }

        let data = fs::read(path)
            .await
            .map_err(|e| FileAccessError::read(location, e))?;
        debug!(path = %path.display(), size = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    async fn open_path(&self, path: &Path, location: &str) -> Result<FileWriter, FileAccessError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FileAccessError::write(location, e))?;
        }

        let file = fs::File::create(path)
            .await
            .map_err(|e| FileAccessError::write(location, e))?;
        debug!(path = %path.display(), "Opened destination");
        Ok(Box::new(BufWriter::new(file)))
    }
}

#[async_trait]
impl FileAccess for LocalFiles {
    async fn read_all(&self, location: &str) -> Result<Bytes, FileAccessError> {
        self.read_path(&self.resolve(location), location).await
    }

    async fn open_for_write(&self, location: &str) -> Result<FileWriter, FileAccessError> {
        self.open_path(&self.resolve(location), location).await
    }

    fn file_name(&self, location: &str) -> Option<String> {
        Path::new(location)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Accepts `file://` URIs as well as plain paths
#[derive(Debug, Clone, Default)]
pub struct UriFiles {
    local: LocalFiles,
}

impl UriFiles {
    pub fn new(local: LocalFiles) -> Self {
        Self { local }
    }

    fn to_path(&self, location: &str, write: bool) -> Result<PathBuf, FileAccessError> {
        let error = |reason: &str| {
            if write {
                FileAccessError::write(location, reason)
            } else {
                FileAccessError::read(location, reason)
            }
        };

        match Url::parse(location) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| error("not a local file URI")),
            // Windows drive letters parse as a one-letter scheme
            Ok(url) if url.scheme().len() > 1 => {
                Err(error(&format!("unsupported URI scheme '{}'", url.scheme())))
            }
            _ => Ok(self.local.resolve(location)),
        }
    }
}

#[async_trait]
impl FileAccess for UriFiles {
    async fn read_all(&self, location: &str) -> Result<Bytes, FileAccessError> {
        let path = self.to_path(location, false)?;
        self.local.read_path(&path, location).await
    }

    async fn open_for_write(&self, location: &str) -> Result<FileWriter, FileAccessError> {
        let path = self.to_path(location, true)?;
        self.local.open_path(&path, location).await
    }

    fn file_name(&self, location: &str) -> Option<String> {
        let path = self.to_path(location, false).ok()?;
        path.file_name().map(|name| name.to_string_lossy().into_owned())
    }
}

/// Which [`FileAccess`] implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileAccessKind {
    #[default]
    Path,
    Uri,
}

impl FileAccessKind {
    pub fn build(self, base_dir: Option<PathBuf>) -> Arc<dyn FileAccess> {
        let local = LocalFiles { base_dir };
        match self {
            FileAccessKind::Path => Arc::new(local),
            FileAccessKind::Uri => Arc::new(UriFiles::new(local)),
        }
    }
}

impl FromStr for FileAccessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" => Ok(FileAccessKind::Path),
            "uri" => Ok(FileAccessKind::Uri),
            other => Err(format!("unknown file access kind '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    // ==================== LocalFiles Tests ====================

    #[tokio::test]
    async fn test_local_read_all() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let files = LocalFiles::new();
        let data = files.read_all(path.to_str().unwrap()).await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn test_local_relative_to_base_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), b"relative").unwrap();

        let files = LocalFiles::with_base_dir(dir.path());
        assert_eq!(&files.read_all("b.txt").await.unwrap()[..], b"relative");
    }

    #[tokio::test]
    async fn test_local_read_missing_and_directory() {
        let dir = TempDir::new().unwrap();
        let files = LocalFiles::with_base_dir(dir.path());

        assert!(matches!(
            files.read_all("missing.txt").await,
            Err(FileAccessError::Read { .. })
        ));
        assert!(matches!(
            files.read_all(dir.path().to_str().unwrap()).await,
            Err(FileAccessError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_open_for_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let files = LocalFiles::with_base_dir(dir.path());

        let mut writer = files.open_for_write("nested/deeper/out.bin").await.unwrap();
        writer.write_all(b"payload").await.unwrap();
        writer.shutdown().await.unwrap();

        let written = std::fs::read(dir.path().join("nested/deeper/out.bin")).unwrap();
        assert_eq!(written, b"payload");
    }

    #[tokio::test]
    async fn test_local_open_for_write_under_file_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blocker"), b"x").unwrap();
        let files = LocalFiles::with_base_dir(dir.path());

        assert!(matches!(
            files.open_for_write("blocker/out.bin").await,
            Err(FileAccessError::Write { .. })
        ));
    }

    #[test]
    fn test_local_file_name() {
        let files = LocalFiles::new();
        assert_eq!(files.file_name("/tmp/photo.jpg").as_deref(), Some("photo.jpg"));
        assert_eq!(files.file_name("/"), None);
    }

    // ==================== UriFiles Tests ====================

    #[tokio::test]
    async fn test_uri_file_scheme() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.txt");
        std::fs::write(&path, b"from uri").unwrap();
        let uri = Url::from_file_path(&path).unwrap().to_string();

        let files = UriFiles::default();
        assert_eq!(&files.read_all(&uri).await.unwrap()[..], b"from uri");
        assert_eq!(files.file_name(&uri).as_deref(), Some("c.txt"));
    }

    #[tokio::test]
    async fn test_uri_plain_path_still_works() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.txt");
        std::fs::write(&path, b"plain").unwrap();

        let files = UriFiles::default();
        assert_eq!(&files.read_all(path.to_str().unwrap()).await.unwrap()[..], b"plain");
    }

    #[tokio::test]
    async fn test_uri_unsupported_scheme() {
        let files = UriFiles::default();
        let err = files.read_all("content://media/external/1").await.unwrap_err();
        assert!(err.to_string().contains("unsupported URI scheme"));
        assert!(matches!(
            files.open_for_write("https://example.com/x").await,
            Err(FileAccessError::Write { .. })
        ));
    }

    // ==================== Kind / Error Tests ====================

    #[test]
    fn test_file_access_kind_from_str() {
        assert_eq!("path".parse::<FileAccessKind>(), Ok(FileAccessKind::Path));
        assert_eq!(" URI ".parse::<FileAccessKind>(), Ok(FileAccessKind::Uri));
        assert!("ftp".parse::<FileAccessKind>().is_err());
    }

    #[test]
    fn test_error_conversion() {
        let err: TransferError = FileAccessError::read("a.txt", "gone").into();
        assert_eq!(err, TransferError::FileRead(Arc::from("cannot read a.txt: gone")));

        let err: TransferError = FileAccessError::write("b.txt", "denied").into();
        assert!(matches!(err, TransferError::Write(_)));
    }
}
