//! Image storage backends
//!
//! Source uploads and transformed results go through the [`Storage`] trait,
//! backed either by a local directory or by an S3-compatible bucket. The
//! backend is picked once at startup by [`from_config`].

pub mod local;
pub mod mock;
pub mod s3;

pub use local::LocalStorage;
pub use mock::MockStorage;
pub use s3::S3Storage;

use crate::config::StorageConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `content` under `name` and return the backend location.
    async fn put(&self, name: &str, content: &[u8]) -> Result<String>;

    /// Fetch the content previously stored under `name`.
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
}

/// Build the configured backend.
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match config {
        StorageConfig::Local { root } => {
            info!("Storage backend: local ({})", root.display());
            Ok(Arc::new(LocalStorage::new(root)))
        }
        StorageConfig::S3(s3) => {
            info!("Storage backend: s3 (bucket: {})", s3.bucket);
            Ok(Arc::new(S3Storage::new(s3).await?))
        }
    }
}

/// Reject keys that are empty, absolute, or step outside the root.
pub(crate) fn validate_key(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.starts_with('\\')
        || name.split(['/', '\\']).any(|part| part == ".." || part.is_empty());

    if invalid {
        return Err(Error::InvalidKey(name.to_string()));
    }
    Ok(())
}
