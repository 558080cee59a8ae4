use async_trait::async_trait;
use atalaya_core::error::{CodedError, ErrorCode};
use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage misconfigured: {0}")]
    Configuration(String),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("storage permission denied: {0}")]
    Permission(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl CodedError for StorageError {
    fn error_code(&self) -> ErrorCode {
        match self {
            StorageError::Configuration(_) => ErrorCode::ServiceUnavailable,
            StorageError::NotFound(_) => ErrorCode::Missing,
            StorageError::Permission(_) => ErrorCode::Forbidden,
            StorageError::Unavailable(_) => ErrorCode::StorageError,
        }
    }
}

/// Blob storage port. Keys follow `documents/{document_id}/{file_name}`;
/// delete is idempotent; presigned URLs are GET-only.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StorageError>;

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn presign(
        &self,
        key: &str,
        ttl_seconds: u64,
        suggested_filename: Option<&str>,
    ) -> Result<String, StorageError>;
}

/// `Content-Disposition: attachment; filename="..."` with quotes escaped.
fn content_disposition(filename: &str) -> String {
    let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
    format!("attachment; filename=\"{}\"", escaped)
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(StorageError::Permission(format!("invalid key: {}", key)));
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryFileStorage {
    blobs: DashMap<String, (Vec<u8>, Option<String>)>,
}

impl InMemoryFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }
}

#[async_trait]
impl FileStorage for InMemoryFileStorage {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs
            .insert(key.to_string(), (bytes, content_type.map(str::to_string)));
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .get(key)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn presign(
        &self,
        key: &str,
        ttl_seconds: u64,
        suggested_filename: Option<&str>,
    ) -> Result<String, StorageError> {
        if !self.blobs.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl_seconds as i64;
        let mut url = format!("memory://{}?expires={}", key, expires);
        if let Some(filename) = suggested_filename {
            url.push_str("&response-content-disposition=");
            url.push_str(&content_disposition(filename));
        }
        Ok(url)
    }
}

/// Filesystem-backed storage rooted at a directory; the development and test
/// stand-in for an object store.
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Unavailable(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Unavailable(e.to_string())),
        }
    }

    async fn presign(
        &self,
        key: &str,
        ttl_seconds: u64,
        suggested_filename: Option<&str>,
    ) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + ttl_seconds as i64;
        let mut url = format!("file://{}?expires={}", path.display(), expires);
        if let Some(filename) = suggested_filename {
            url.push_str("&response-content-disposition=");
            url.push_str(&content_disposition(filename));
        }
        Ok(url)
    }
}
