//! Blob storage for delivered images.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::core::config::StorageConfig;
use crate::core::errors::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// Durable sink for result images
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under a fresh key below `prefix`
    async fn put(&self, bytes: Vec<u8>, content_type: &str, prefix: &str) -> StorageResult<String>;

    /// Time-limited URL for `key`
    fn presign(&self, key: &str, ttl: Duration) -> StorageResult<String>;

    /// Permanent URL for `key`, when the store is publicly readable
    fn public_url(&self, key: &str) -> Option<String>;
}

/// Filesystem store; blobs are served back through the signed `/blobs` route
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: Option<String>,
    signed_base_url: String,
    secret: String,
}

impl LocalBlobStore {
    /// Initialise storage rooted at the configured directory, creating it if necessary
    pub fn new(config: &StorageConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.dir).map_err(|source| StorageError::WriteFailed {
            key: config.dir.display().to_string(),
            source,
        })?;

        Ok(Self {
            root: config.dir.clone(),
            public_base_url: config.public_base_url.clone(),
            signed_base_url: config.signed_base_url.clone(),
            secret: config.signing_secret.clone(),
        })
    }

    /// Read a stored blob back into memory
    pub async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let absolute = self.resolve(key)?;
        fs::read(&absolute).await.map_err(|source| StorageError::ReadFailed {
            key: key.to_string(),
            source,
        })
    }

    /// Check a presigned URL's `expires` and `sig` query values for `key`
    pub fn verify(&self, key: &str, expires: u64, signature: &str) -> StorageResult<()> {
        self.verify_at(key, expires, signature, unix_now())
    }

    fn verify_at(&self, key: &str, expires: u64, signature: &str, now: u64) -> StorageResult<()> {
        self.resolve(key)?;
        let expected = self.sign(key, expires)?;
        let matches: bool = expected.as_bytes().ct_eq(signature.as_bytes()).into();
        if now > expires || !matches {
            return Err(StorageError::InvalidSignature(key.to_string()));
        }
        Ok(())
    }

    /// Hex HMAC-SHA256 over `key` and `expires`
    fn sign(&self, key: &str, expires: u64) -> StorageResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| StorageError::SigningKey(e.to_string()))?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn presign_at(&self, key: &str, ttl: Duration, now: u64) -> StorageResult<String> {
        self.resolve(key)?;
        let expires = now.saturating_add(ttl.as_secs());
        Ok(format!(
            "{}/{}?expires={}&sig={}",
            self.signed_base_url,
            key,
            expires,
            self.sign(key, expires)?
        ))
    }

    /// Keys are relative paths; absolute paths and `..` are refused
    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: Vec<u8>, content_type: &str, prefix: &str) -> StorageResult<String> {
        let prefix = prefix.trim_matches('/');
        let key = format!("{}/{}.{}", prefix, Uuid::new_v4(), extension_for(content_type));
        let absolute = self.resolve(&key)?;

        let write_failed = |source| StorageError::WriteFailed {
            key: key.clone(),
            source,
        };
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await.map_err(write_failed)?;
        }
        let file = fs::File::create(&absolute).await.map_err(write_failed)?;
        write_or_discard(file, &bytes, &absolute).await.map_err(write_failed)?;

        debug!("Stored blob {} ({} bytes, {})", key, bytes.len(), content_type);
        Ok(key)
    }

    fn presign(&self, key: &str, ttl: Duration) -> StorageResult<String> {
        self.presign_at(key, ttl, unix_now())
    }

    fn public_url(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{}/{}", base, key))
    }
}

/// File extension for a stored content type
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/bmp" => "bmp",
        "image/tiff" => "tiff",
        "application/json" => "json",
        _ => "bin",
    }
}

/// Content type served for a stored key
pub fn content_type_for(key: &str) -> &'static str {
    match Path::new(key).extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("tiff") | Some("tif") => "image/tiff",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write and flush `bytes`; on failure the partial file at `path` is removed
async fn write_or_discard<W>(mut writer: W, bytes: &[u8], path: &Path) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let written = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    }
    .await;

    if written.is_err() {
        drop(writer);
        let _ = fs::remove_file(path).await;
    }
    written
}
