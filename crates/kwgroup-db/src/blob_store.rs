//! Blob storage for uploaded CSV files.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use kwgroup_core::defaults::UPLOAD_PREFIX;
use kwgroup_core::{Error, Result};

/// Opaque byte store addressed by relative paths.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read a blob. Missing blobs are [`Error::NotFound`].
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a blob; deleting a missing blob is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Content-addressed storage path of an upload:
/// `uploads/{project_id}/{blake3-hex}.csv`.
///
/// Identical bytes uploaded twice to one project land on the same path.
pub fn upload_path(project_id: Uuid, content: &[u8]) -> String {
    format!(
        "{}/{}/{}.csv",
        UPLOAD_PREFIX,
        project_id,
        blake3::hash(content).to_hex()
    )
}

/// Filesystem blob store rooted at `base_path`.
pub struct FilesystemBlobStore {
    base_path: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Resolve a relative blob path, refusing anything that escapes the root.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(Error::Storage(format!("invalid blob path: {path:?}")));
        }
        Ok(self.base_path.join(relative))
    }

    /// Round-trip a probe file so misconfigured storage fails at startup.
    pub async fn validate(&self) -> Result<()> {
        let probe = ".health-check/probe.bin";
        let data = b"kwgroup-storage-probe";
        self.write(probe, data).await?;
        if self.read(probe).await? != data {
            return Err(Error::Storage("blob store read-back mismatch".to_string()));
        }
        self.delete(probe).await?;
        let _ = fs::remove_dir(self.base_path.join(".health-check")).await;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        debug!(
            subsystem = "storage",
            storage_path = %path,
            size = data.len(),
            "blob_store: write"
        );

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "blob_store: create_dir_all failed");
                e
            })?;
        }

        // Temp file + rename so readers never see a partial upload.
        let temp_path = full_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &full_path).await.map_err(|e| {
            warn!(to = %full_path.display(), error = %e, "blob_store: rename failed");
            e
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        match fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {path}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(fs::try_exists(full_path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_path_is_content_addressed() {
        let project = Uuid::new_v4();
        let a = upload_path(project, b"keyword\nshoe\n");
        assert_eq!(a, upload_path(project, b"keyword\nshoe\n"));
        assert_ne!(a, upload_path(project, b"keyword\nboot\n"));
        assert!(a.starts_with(&format!("uploads/{project}/")));
        assert!(a.ends_with(".csv"));
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());

        store.write("uploads/p/a.csv", b"keyword\nshoe\n").await.unwrap();
        assert!(store.exists("uploads/p/a.csv").await.unwrap());
        assert_eq!(store.read("uploads/p/a.csv").await.unwrap(), b"keyword\nshoe\n");

        store.delete("uploads/p/a.csv").await.unwrap();
        assert!(!store.exists("uploads/p/a.csv").await.unwrap());
        store.delete("uploads/p/a.csv").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        assert!(matches!(
            store.read("uploads/nope.csv").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path());
        assert!(matches!(
            store.write("../outside.csv", b"x").await,
            Err(Error::Storage(_))
        ));
        assert!(matches!(store.read("/etc/passwd").await, Err(Error::Storage(_))));
        assert!(matches!(store.exists("").await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_validate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        FilesystemBlobStore::new(dir.path()).validate().await.unwrap();
        assert!(!dir.path().join(".health-check").exists());
    }
}
