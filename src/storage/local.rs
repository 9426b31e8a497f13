use super::{validate_key, Storage};
use crate::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Stores images as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_key(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put(&self, name: &str, content: &[u8]) -> Result<String> {
        let path = self.path_for(name)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| upload_error(format!("Failed to create {}", parent.display()), e))?;
        }

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| upload_error(format!("Failed to write {}", path.display()), e))?;

        tracing::debug!("Stored {} bytes at {}", content.len(), path.display());
        Ok(path.to_string_lossy().into_owned())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;

        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotFound(name.to_string()),
            _ => Error::Transport(format!("Failed to read {}: {}", path.display(), e)),
        })
    }
}

/// Interruptions and timeouts are transient; every other I/O failure is
/// permanent.
fn upload_error(context: String, err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            Error::Upload(format!("{}: {}", context, err))
        }
        _ => Error::UploadRejected(format!("{}: {}", context, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(&dir.path().join("nested"));

        let location = storage.put("results/cmp-a.jpg", b"data").await.unwrap();

        let expected = dir.path().join("nested").join("results").join("cmp-a.jpg");
        assert_eq!(location, expected.to_string_lossy());
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn test_put_into_existing_directory_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage.put("a/one.png", b"1").await.unwrap();
        storage.put("a/two.png", b"2").await.unwrap();
        storage.put("a/one.png", b"3").await.unwrap();

        assert_eq!(storage.get("a/one.png").await.unwrap(), b"3");
        assert_eq!(storage.get("a/two.png").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_get_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        let err = storage.get("missing.jpg").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(ref name) if name == "missing.jpg"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(matches!(
            storage.put("../escape.jpg", b"x").await,
            Err(Error::InvalidKey(_))
        ));
        assert!(matches!(
            storage.get("/etc/hosts").await,
            Err(Error::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_put_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let file_root = dir.path().join("not-a-dir");
        std::fs::write(&file_root, b"").unwrap();
        let storage = LocalStorage::new(&file_root);

        let err = storage.put("a.jpg", b"x").await.unwrap_err();
        assert!(matches!(err, Error::UploadRejected(_)));
        assert!(!err.is_transient());

        let err = storage.put("results/a.jpg", b"x").await.unwrap_err();
        assert!(matches!(err, Error::UploadRejected(_)));
    }

    #[test]
    fn test_upload_error_classification() {
        let timed_out = upload_error(
            "write".to_string(),
            std::io::Error::new(ErrorKind::TimedOut, "slow disk"),
        );
        assert!(timed_out.is_transient());

        let denied = upload_error(
            "write".to_string(),
            std::io::Error::new(ErrorKind::PermissionDenied, "read-only"),
        );
        assert!(matches!(denied, Error::UploadRejected(_)));
    }
}
