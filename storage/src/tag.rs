//! Mutable tag pointers.

use camino::Utf8PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::blob::{Blob, BlobStore};
use crate::digest::Digest;
use crate::error::{StorageError, StorageErrorKind};
use crate::namespace::{validate_segment, Namespace};

/// Tags stored as small files holding a digest, under
/// `{root}/{repository}/{image}/tags/{tag}`.
///
/// The store does not check that the digest a tag points to exists; a dangling
/// tag simply resolves to a not-found blob.
#[derive(Debug, Clone)]
pub struct TagStore {
    blobs: BlobStore,
}

impl TagStore {
    /// Create a tag store sharing the root of `blobs`.
    pub fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    /// Check that `tag` can be stored as a tag file name.
    pub fn validate_tag(tag: &str) -> Result<(), StorageError> {
        validate_segment("tag", tag)
    }

    fn tags_dir(&self, namespace: &Namespace) -> Utf8PathBuf {
        self.blobs.namespace_dir(namespace).join("tags")
    }

    /// Point `tag` at `digest`, replacing any previous value.
    #[tracing::instrument(skip(self), fields(%namespace, %digest))]
    pub async fn put_tag(
        &self,
        namespace: &Namespace,
        tag: &str,
        digest: &Digest,
    ) -> Result<(), StorageError> {
        Self::validate_tag(tag)?;

        let dir = self.tags_dir(namespace);
        fs::create_dir_all(&dir)
            .await
            .map_err(StorageError::io("create tag storage", &dir))?;

        let staging = dir.join(format!(".{tag}.{}", uuid::Uuid::new_v4()));
        let target = dir.join(tag);

        let written = async {
            let mut file = fs::File::create(&staging).await?;
            file.write_all(digest.as_str().as_bytes()).await?;
            file.sync_all().await?;
            fs::rename(&staging, &target).await
        }
        .await;

        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&staging).await {
                tracing::warn!(path = %staging, "unable to remove staged tag: {cleanup}");
            }
            return Err(StorageError::io("write tag file", &target)(err));
        }

        tracing::debug!(%tag, "tag updated");
        Ok(())
    }

    /// Read the digest a tag points to.
    #[tracing::instrument(skip(self), fields(%namespace))]
    pub async fn resolve(&self, namespace: &Namespace, tag: &str) -> Result<Digest, StorageError> {
        Self::validate_tag(tag).map_err(|err| {
            StorageError::new(StorageErrorKind::NotFound, format!("tag {tag:?}")).with_source(err)
        })?;

        let path = self.tags_dir(namespace).join(tag);
        let content = fs::read_to_string(&path)
            .await
            .map_err(StorageError::io("read tag file", &path))?;

        content.trim().parse().map_err(|err: StorageError| {
            StorageError::new(StorageErrorKind::Io, "corrupt tag file")
                .with_path(&path)
                .with_source(err)
        })
    }

    /// Resolve a tag and open the blob it points to.
    ///
    /// A missing tag and a tag pointing at a missing blob both report
    /// [`StorageErrorKind::NotFound`].
    pub async fn get_tag(&self, namespace: &Namespace, tag: &str) -> Result<Blob, StorageError> {
        let digest = self.resolve(namespace, tag).await?;
        self.blobs.get(namespace, &digest).await
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;

    use super::*;

    fn stores() -> (tempfile::TempDir, BlobStore, TagStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        let blobs = BlobStore::new(root);
        let tags = TagStore::new(blobs.clone());
        (dir, blobs, tags)
    }

    fn acme() -> Namespace {
        Namespace::new("acme", "app").unwrap()
    }

    #[tokio::test]
    async fn tag_round_trip() {
        let (_dir, blobs, tags) = stores();
        let manifest = br#"{"schemaVersion":2,"layers":[]}"#;
        let digest = blobs.ingest(&acme(), &mut &manifest[..]).await.unwrap();

        tags.put_tag(&acme(), "latest", &digest).await.unwrap();

        let by_tag = tags.get_tag(&acme(), "latest").await.unwrap();
        assert_eq!(by_tag.digest(), &digest);
        let by_digest = blobs.get(&acme(), &digest).await.unwrap();
        assert_eq!(
            by_tag.read_to_vec().await.unwrap(),
            by_digest.read_to_vec().await.unwrap()
        );
    }

    #[tokio::test]
    async fn overwrite_replaces_pointer() {
        let (_dir, blobs, tags) = stores();
        let first = blobs.ingest(&acme(), &mut &b"one"[..]).await.unwrap();
        let second = blobs.ingest(&acme(), &mut &b"two"[..]).await.unwrap();

        tags.put_tag(&acme(), "v1", &first).await.unwrap();
        tags.put_tag(&acme(), "v1", &second).await.unwrap();

        assert_eq!(tags.resolve(&acme(), "v1").await.unwrap(), second);
        let on_disk =
            std::fs::read_to_string(tags.tags_dir(&acme()).join("v1")).unwrap();
        assert_eq!(on_disk, second.as_str());
    }

    #[tokio::test]
    async fn missing_tag_is_not_found() {
        let (_dir, _blobs, tags) = stores();
        let err = tags.get_tag(&acme(), "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn dangling_tag_is_not_found() {
        let (_dir, _blobs, tags) = stores();
        let digest = Digest::sha256(b"never pushed");
        tags.put_tag(&acme(), "latest", &digest).await.unwrap();

        let err = tags.get_tag(&acme(), "latest").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rejects_path_like_tags() {
        let (_dir, _blobs, tags) = stores();
        let digest = Digest::sha256(b"x");
        let err = tags.put_tag(&acme(), "..", &digest).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidName);
    }
}
