//! # Registry storage
//!
//! On-disk engine behind the image registry: content-addressed blobs, tag
//! pointers, and resumable upload sessions.
//!
//! ```text
//! {root}/{repository}/{image}/{digest}      blobs
//! {root}/{repository}/{image}/tags/{tag}    tag pointers
//! {uploads}/{id}.tmp                        in-flight uploads
//! ```

use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Deserialize;

mod blob;
mod digest;
mod error;
mod namespace;
mod tag;
mod upload;

#[doc(inline)]
pub use blob::{Blob, BlobStore};
#[doc(inline)]
pub use digest::{Digest, SHA256_PREFIX};
#[doc(inline)]
pub use error::{StorageError, StorageErrorKind};
#[doc(inline)]
pub use namespace::Namespace;
#[doc(inline)]
pub use tag::TagStore;
#[doc(inline)]
pub use upload::{Appended, CommittedUpload, SweepReport, UploadId, UploadSessions};

/// Where the registry keeps its data.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Root directory for blobs and tags.
    #[serde(default = "StorageConfig::default_root")]
    pub root: Utf8PathBuf,

    /// Directory for in-flight upload files.
    #[serde(default = "StorageConfig::default_uploads")]
    pub uploads: Utf8PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: Self::default_root(),
            uploads: Self::default_uploads(),
        }
    }
}

impl StorageConfig {
    fn default_root() -> Utf8PathBuf {
        Utf8PathBuf::from("/tmp/storage")
    }

    fn default_uploads() -> Utf8PathBuf {
        Utf8PathBuf::from("/tmp/uploads")
    }

    /// Build the stores described by this configuration.
    pub fn build(self) -> Storage {
        let blobs = BlobStore::new(self.root);
        Storage {
            tags: TagStore::new(blobs.clone()),
            blobs,
            uploads: Arc::new(UploadSessions::new(self.uploads)),
        }
    }
}

/// The three stores, sharing one configuration.
#[derive(Debug, Clone)]
pub struct Storage {
    /// Content-addressed blobs.
    pub blobs: BlobStore,

    /// Tag pointers.
    pub tags: TagStore,

    /// Upload sessions, shared with the sweeper task.
    pub uploads: Arc<UploadSessions>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.root.as_str(), "/tmp/storage");
        assert_eq!(config.uploads.as_str(), "/tmp/uploads");
    }

    #[tokio::test]
    async fn stores_share_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let storage = StorageConfig {
            root: root.join("blobs"),
            uploads: root.join("uploads"),
        }
        .build();

        let ns = Namespace::new("acme", "app").unwrap();
        let digest = storage
            .blobs
            .ingest(&ns, &mut &b"manifest"[..])
            .await
            .unwrap();
        storage.tags.put_tag(&ns, "v1", &digest).await.unwrap();
        assert_eq!(storage.tags.resolve(&ns, "v1").await.unwrap(), digest);
        assert_eq!(storage.uploads.dir(), root.join("uploads").as_path());
    }
}
