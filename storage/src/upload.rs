//! Resumable upload sessions.
//!
//! Each session owns one temporary file, `{dir}/{id}.tmp`, which is created on
//! the first append. Sessions expire after their time-to-live; a periodic sweep
//! removes expired sessions and any file in the upload directory that does not
//! belong to an active session.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{StorageError, StorageErrorKind};

const UPLOAD_SUFFIX: &str = ".tmp";

/// Deadline used when a time-to-live does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Identifier of an upload session, a random v4 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UploadId(Uuid);

impl UploadId {
    fn generate() -> Self {
        UploadId(Uuid::new_v4())
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for UploadId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(UploadId).map_err(|err| {
            StorageError::new(StorageErrorKind::InvalidUpload, format!("upload id {s:?}"))
                .with_source(err)
        })
    }
}

/// Result of appending a chunk to an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Bytes written by this call.
    pub written: u64,

    /// Total size of the upload after this call.
    pub offset: u64,
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that had passed their expiry.
    pub expired: usize,

    /// Files in the upload directory without an active session.
    pub orphaned: usize,
}

/// Tracks in-flight uploads and their backing files.
///
/// A single lock serializes every change to the set of active sessions and
/// every deletion the sweeper performs. Appends only hold it while validating
/// the id and opening the file; the copy itself runs unlocked, so uploads to
/// different ids stream in parallel.
#[derive(Debug)]
pub struct UploadSessions {
    dir: Utf8PathBuf,
    active: Mutex<HashMap<UploadId, Instant>>,
}

impl UploadSessions {
    /// Create a session manager keeping its files in `dir`.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// The directory holding upload files.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Path of the temporary file backing `id`.
    pub fn upload_path(&self, id: &UploadId) -> Utf8PathBuf {
        self.dir.join(format!("{id}{UPLOAD_SUFFIX}"))
    }

    fn id_for_file(name: &str) -> Option<UploadId> {
        name.strip_suffix(UPLOAD_SUFFIX)?.parse().ok()
    }

    /// Allocate a new session which stays valid for `ttl`.
    ///
    /// A `ttl` too large to represent is capped at roughly thirty years.
    pub async fn start(&self, ttl: Duration) -> UploadId {
        let id = UploadId::generate();
        let now = Instant::now();
        let deadline = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.active.lock().await.insert(id, deadline);
        tracing::debug!(%id, ?ttl, "upload started");
        id
    }

    fn check(active: &HashMap<UploadId, Instant>, id: &UploadId) -> Result<(), StorageError> {
        match active.get(id) {
            None => Err(StorageError::new(
                StorageErrorKind::InvalidUpload,
                format!("unknown upload id {id}"),
            )),
            Some(deadline) if *deadline <= Instant::now() => Err(StorageError::new(
                StorageErrorKind::InvalidUpload,
                format!("upload id {id} expired"),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Append everything `reader` yields to the upload.
    ///
    /// Not transactional: if the copy fails part way, the bytes already written
    /// stay in the upload file.
    #[tracing::instrument(skip(self, reader), fields(%id))]
    pub async fn append<R>(&self, id: &UploadId, reader: &mut R) -> Result<Appended, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.upload_path(id);
        let file = {
            let active = self.active.lock().await;
            Self::check(&active, id)?;

            fs::create_dir_all(&self.dir)
                .await
                .map_err(StorageError::io("create upload directory", &self.dir))?;
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(StorageError::io("open upload file", &path))?
        };

        let mut writer = tokio::io::BufWriter::new(file);
        let written = tokio::io::copy(reader, &mut writer)
            .await
            .map_err(StorageError::io("copy upload data", &path))?;
        writer
            .shutdown()
            .await
            .map_err(StorageError::io("flush upload file", &path))?;

        let offset = writer
            .get_ref()
            .metadata()
            .await
            .map_err(StorageError::io("upload metadata", &path))?
            .len();

        Ok(Appended { written, offset })
    }

    /// Finish the upload and hand its content to the caller.
    ///
    /// The session stops being active, so a concurrent commit or append on the
    /// same id fails. The file is removed from disk when the returned handle is
    /// dropped.
    #[tracing::instrument(skip(self), fields(%id))]
    pub async fn commit(&self, id: &UploadId) -> Result<CommittedUpload, StorageError> {
        let mut active = self.active.lock().await;
        Self::check(&active, id)?;

        let path = self.upload_path(id);
        let file = fs::File::open(&path).await.map_err(|err| {
            StorageError::new(StorageErrorKind::Io, "open upload file")
                .with_path(&path)
                .with_source(err)
        })?;

        active.remove(id);
        Ok(CommittedUpload {
            path,
            file: Some(file),
        })
    }

    /// Abandon an upload, deleting its file right away.
    ///
    /// Unknown or already finished ids are fine; returns whether the id was
    /// still active.
    #[tracing::instrument(skip(self), fields(%id))]
    pub async fn cancel(&self, id: &UploadId) -> bool {
        let mut active = self.active.lock().await;
        let was_active = active.remove(id).is_some();
        remove_logged(&self.upload_path(id)).await;
        was_active
    }

    /// Remove expired sessions and orphaned upload files.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut active = self.active.lock().await;

        let now = Instant::now();
        let expired: Vec<UploadId> = active
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            remove_logged(&self.upload_path(&id)).await;
            active.remove(&id);
            report.expired += 1;
        }

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return report,
            Err(err) => {
                tracing::error!(dir = %self.dir, "unable to list upload files: {err}");
                return report;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(dir = %self.dir, "unable to list upload files: {err}");
                    break;
                }
            };

            let name = entry.file_name();
            let live = name
                .to_str()
                .and_then(Self::id_for_file)
                .is_some_and(|id| active.contains_key(&id));
            if live {
                continue;
            }

            let path = entry.path();
            let removed = match entry.file_type().await {
                Ok(kind) if kind.is_dir() => fs::remove_dir_all(&path).await,
                _ => fs::remove_file(&path).await,
            };
            match removed {
                Ok(()) => report.orphaned += 1,
                Err(err) => {
                    tracing::error!(path = %path.display(), "unable to delete upload file: {err}")
                }
            }
        }

        report
    }

    /// Run [`sweep`](Self::sweep) every `period` until `shutdown` is cancelled.
    ///
    /// Once cancellation is observed the next tick is skipped and the task
    /// returns; callers should await the handle when shutting down.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sessions = Arc::clone(self);
        let period = period.max(Duration::from_millis(1));

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let report = sessions.sweep().await;
                            if report != SweepReport::default() {
                                tracing::info!(
                                    expired = report.expired,
                                    orphaned = report.orphaned,
                                    "reclaimed upload files"
                                );
                            }
                        }
                    }
                }

                tracing::debug!("upload sweeper stopped");
            }
            .instrument(tracing::info_span!("upload-sweeper")),
        )
    }
}

async fn remove_logged(path: &Utf8Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::error!(%path, "unable to delete upload file: {err}"),
    }
}

/// Content of a committed upload.
///
/// Reads like a file. Dropping it closes the file and deletes it from disk,
/// so it must be kept alive until the content has been consumed.
#[derive(Debug)]
pub struct CommittedUpload {
    path: Utf8PathBuf,
    file: Option<fs::File>,
}

impl CommittedUpload {
    /// Path of the backing file, deleted on drop.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl AsyncRead for CommittedUpload {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for CommittedUpload {
    fn drop(&mut self) {
        drop(self.file.take());
        // Drop cannot await, so this is one blocking unlink on the current worker.
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(path = %self.path, "unable to delete upload file: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn sessions() -> (tempfile::TempDir, Arc<UploadSessions>) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("uploads");
        (dir, Arc::new(UploadSessions::new(root)))
    }

    async fn read_all(mut upload: CommittedUpload) -> Vec<u8> {
        let mut data = Vec::new();
        upload.read_to_end(&mut data).await.unwrap();
        data
    }

    #[tokio::test]
    async fn start_creates_no_file() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(TTL).await;
        assert!(!sessions.upload_path(&id).exists());
    }

    #[tokio::test]
    async fn lifecycle() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(TTL).await;

        let first = sessions.append(&id, &mut &b"hello "[..]).await.unwrap();
        assert_eq!(first, Appended { written: 6, offset: 6 });
        let second = sessions.append(&id, &mut &b"world"[..]).await.unwrap();
        assert_eq!(second, Appended { written: 5, offset: 11 });

        let upload = sessions.commit(&id).await.unwrap();
        let path = upload.path().to_owned();
        assert_eq!(read_all(upload).await, b"hello world");
        assert!(!path.exists(), "committed upload file should be removed on drop");

        let err = sessions.append(&id, &mut &b"late"[..]).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidUpload);
    }

    #[tokio::test]
    async fn huge_ttl_does_not_overflow() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(Duration::from_secs(i64::MAX as u64)).await;

        let appended = sessions.append(&id, &mut &b"data"[..]).await.unwrap();
        assert_eq!(appended.offset, 4);
        assert_eq!(sessions.sweep().await, SweepReport::default());

        let id = sessions.start(Duration::MAX).await;
        sessions.append(&id, &mut &b"more"[..]).await.unwrap();
    }

    #[tokio::test]
    async fn commit_twice_fails() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(TTL).await;
        sessions.append(&id, &mut &b"data"[..]).await.unwrap();

        let _upload = sessions.commit(&id).await.unwrap();
        let err = sessions.commit(&id).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidUpload);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids_are_invalid() {
        let (_dir, sessions) = sessions();

        let err = "not-a-uuid".parse::<UploadId>().unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidUpload);

        let stranger = UploadId::generate();
        let err = sessions.append(&stranger, &mut &b"x"[..]).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidUpload);
    }

    #[tokio::test]
    async fn expired_upload_is_swept() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(TTL).await;
        sessions.append(&id, &mut &b"partial"[..]).await.unwrap();
        let short = sessions.start(Duration::from_nanos(1)).await;

        // Force the first session past its deadline as well.
        sessions
            .active
            .lock()
            .await
            .insert(id, Instant::now() - Duration::from_secs(1));

        let report = sessions.sweep().await;
        assert_eq!(report.expired, 2);
        assert!(!sessions.upload_path(&id).exists());

        for stale in [id, short] {
            let err = sessions.append(&stale, &mut &b"x"[..]).await.unwrap_err();
            assert_eq!(err.kind(), StorageErrorKind::InvalidUpload);
        }
    }

    #[tokio::test]
    async fn expired_upload_rejected_before_sweep() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(Duration::from_nanos(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let err = sessions.append(&id, &mut &b"x"[..]).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidUpload);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(TTL).await;
        sessions.append(&id, &mut &b"data"[..]).await.unwrap();

        assert!(sessions.cancel(&id).await);
        assert!(!sessions.upload_path(&id).exists());
        assert!(!sessions.cancel(&id).await);
        assert!(!sessions.upload_path(&id).exists());

        let err = sessions.append(&id, &mut &b"x"[..]).await.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidUpload);
    }

    #[tokio::test]
    async fn sweep_removes_orphans_only() {
        let (_dir, sessions) = sessions();
        let live = sessions.start(TTL).await;
        sessions.append(&live, &mut &b"keep"[..]).await.unwrap();

        let orphan = sessions.upload_path(&UploadId::generate());
        std::fs::write(&orphan, b"left over").unwrap();
        let junk = sessions.dir().join("junk");
        std::fs::write(&junk, b"junk").unwrap();

        let report = sessions.sweep().await;
        assert_eq!(report, SweepReport { expired: 0, orphaned: 2 });
        assert!(!orphan.exists());
        assert!(!junk.exists());
        assert!(sessions.upload_path(&live).exists());
    }

    #[tokio::test]
    async fn sweep_without_directory_is_a_no_op() {
        let (_dir, sessions) = sessions();
        assert_eq!(sessions.sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let (_dir, sessions) = sessions();
        let id = sessions.start(Duration::from_nanos(1)).await;

        let shutdown = CancellationToken::new();
        let handle = sessions.spawn_sweeper(Duration::from_millis(10), shutdown.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while sessions.active.lock().await.contains_key(&id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sweeper should reclaim the expired session");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should stop")
            .unwrap();
    }
}
