//! Content-addressed blob storage on the local filesystem.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::digest::{Digest, Hasher};
use crate::error::{StorageError, StorageErrorKind};
use crate::namespace::Namespace;

const COPY_BUFFER: usize = 64 * 1024;

/// Blob store rooted at a directory, laid out as `{root}/{repository}/{image}/{digest}`.
///
/// Every write goes to a private temporary file in the namespace directory and is
/// renamed into place only after its digest has been verified, so readers never
/// observe partial or mismatched content and concurrent pushes of the same
/// digest cannot interleave.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: Utf8PathBuf,
}

/// An open blob, ready to be streamed to a client.
#[derive(Debug)]
pub struct Blob {
    digest: Digest,
    size: u64,
    file: fs::File,
}

impl Blob {
    /// The digest the blob is stored under.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Size of the blob in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Consume the blob, returning the open file.
    pub fn into_file(self) -> fs::File {
        self.file
    }

    /// Read the whole blob into memory.
    pub async fn read_to_vec(mut self) -> Result<Vec<u8>, StorageError> {
        let mut data = Vec::with_capacity(self.size as usize);
        self.file
            .read_to_end(&mut data)
            .await
            .map_err(|err| {
                StorageError::new(StorageErrorKind::Io, format!("read blob {}", self.digest))
                    .with_source(err)
            })?;
        Ok(data)
    }
}

/// Content written to a temporary file but not yet visible.
#[derive(Debug)]
struct Staged {
    path: Utf8PathBuf,
    digest: Digest,
    size: u64,
}

impl Staged {
    async fn publish(self, target: &Utf8Path) -> Result<u64, StorageError> {
        if let Err(err) = fs::rename(&self.path, target).await {
            let err = StorageError::io("publish blob", target)(err);
            self.discard().await;
            return Err(err);
        }
        Ok(self.size)
    }

    async fn discard(self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path, "unable to remove staged blob: {err}");
        }
    }
}

impl BlobStore {
    /// Create a blob store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory of this store.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub(crate) fn namespace_dir(&self, namespace: &Namespace) -> Utf8PathBuf {
        let mut path = self.root.join(namespace.repository());
        path.push(namespace.image());
        path
    }

    fn blob_path(&self, namespace: &Namespace, digest: &Digest) -> Utf8PathBuf {
        self.namespace_dir(namespace).join(digest.as_str())
    }

    /// Store `reader` under `digest`, verifying the content matches.
    ///
    /// On mismatch nothing is left on disk and the error kind is
    /// [`StorageErrorKind::DigestMismatch`]. Returns the blob size.
    #[tracing::instrument(skip(self, reader), fields(%namespace, %digest))]
    pub async fn put<R>(
        &self,
        namespace: &Namespace,
        digest: &Digest,
        reader: &mut R,
    ) -> Result<u64, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let staged = self.stage(namespace, reader).await?;

        if &staged.digest != digest {
            let err = StorageError::new(
                StorageErrorKind::DigestMismatch,
                format!("expected {digest}, got {}", staged.digest),
            );
            staged.discard().await;
            return Err(err);
        }

        staged.publish(&self.blob_path(namespace, digest)).await
    }

    /// Store `reader` under whatever digest its content hashes to.
    #[tracing::instrument(skip(self, reader), fields(%namespace))]
    pub async fn ingest<R>(
        &self,
        namespace: &Namespace,
        reader: &mut R,
    ) -> Result<Digest, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let staged = self.stage(namespace, reader).await?;
        let digest = staged.digest.clone();
        staged.publish(&self.blob_path(namespace, &digest)).await?;
        Ok(digest)
    }

    /// Open a blob for reading.
    #[tracing::instrument(skip(self), fields(%namespace, %digest))]
    pub async fn get(&self, namespace: &Namespace, digest: &Digest) -> Result<Blob, StorageError> {
        let path = self.blob_path(namespace, digest);
        let file = fs::File::open(&path)
            .await
            .map_err(StorageError::io("open blob", &path))?;
        let size = file
            .metadata()
            .await
            .map_err(StorageError::io("blob metadata", &path))?
            .len();

        Ok(Blob {
            digest: digest.clone(),
            size,
            file,
        })
    }

    /// Size of a blob, without opening it.
    #[tracing::instrument(skip(self), fields(%namespace, %digest))]
    pub async fn stat(&self, namespace: &Namespace, digest: &Digest) -> Result<u64, StorageError> {
        let path = self.blob_path(namespace, digest);
        let metadata = fs::metadata(&path)
            .await
            .map_err(StorageError::io("stat blob", &path))?;
        Ok(metadata.len())
    }

    /// Delete staging files left behind by writes that never finished.
    ///
    /// Staging files are the dot-files in namespace and tag directories;
    /// namespaces and tags never start with a dot. Must not run while writes
    /// are in flight. Returns the number of files removed.
    #[tracing::instrument(skip(self), fields(root = %self.root))]
    pub async fn remove_staging_files(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for repository in subdirectories(&self.root).await? {
            for image in subdirectories(&repository).await? {
                removed += remove_dot_files(&image).await?;
                removed += remove_dot_files(&image.join("tags")).await?;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "removed abandoned staging files");
        }
        Ok(removed)
    }

    /// Copy `reader` into a fresh temporary file next to its final location,
    /// hashing as it goes.
    async fn stage<R>(&self, namespace: &Namespace, reader: &mut R) -> Result<Staged, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)
            .await
            .map_err(StorageError::io("create image storage", &dir))?;

        let path = dir.join(format!(".upload.{}", uuid::Uuid::new_v4()));
        let file = fs::File::create(&path)
            .await
            .map_err(StorageError::io("create blob file", &path))?;

        match copy_hashing(reader, file).await {
            Ok((digest, size)) => Ok(Staged { path, digest, size }),
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&path).await {
                    tracing::warn!(%path, "unable to remove staged blob: {cleanup}");
                }
                Err(StorageError::new(StorageErrorKind::Io, "copy blob")
                    .with_path(&path)
                    .with_source(err))
            }
        }
    }
}

async fn read_dir(dir: &Utf8Path) -> Result<Option<fs::ReadDir>, StorageError> {
    match fs::read_dir(dir).await {
        Ok(entries) => Ok(Some(entries)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StorageError::io("list directory", dir)(err)),
    }
}

async fn subdirectories(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StorageError> {
    let mut found = Vec::new();
    let Some(mut entries) = read_dir(dir).await? else {
        return Ok(found);
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(StorageError::io("list directory", dir))?
    {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let is_dir = entry.file_type().await.is_ok_and(|kind| kind.is_dir());
        if is_dir && !name.starts_with('.') {
            found.push(dir.join(name));
        }
    }
    Ok(found)
}

async fn remove_dot_files(dir: &Utf8Path) -> Result<usize, StorageError> {
    let mut removed = 0;
    let Some(mut entries) = read_dir(dir).await? else {
        return Ok(removed);
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(StorageError::io("list directory", dir))?
    {
        let staging = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'));
        let is_file = entry.file_type().await.is_ok_and(|kind| kind.is_file());
        if !(staging && is_file) {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(err) => {
                tracing::warn!(path = %path.display(), "unable to remove staging file: {err}")
            }
        }
    }
    Ok(removed)
}

async fn copy_hashing<R>(reader: &mut R, mut file: fs::File) -> std::io::Result<(Digest, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = Hasher::default();
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n]).await?;
        size += n as u64;
    }

    file.sync_all().await?;
    Ok((hasher.finish(), size))
}
