//! Errors produced by the on-disk registry stores.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tracing_error::SpanTrace;

/// Categorizes storage errors by what went wrong, so that the protocol layer
/// can pick a response without inspecting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The blob, tag or file does not exist.
    NotFound,

    /// Content was written, but its digest did not match the digest asserted
    /// by the caller. Nothing was made visible.
    DigestMismatch,

    /// The digest string is not a well formed `sha256:<hex>` digest.
    InvalidDigest,

    /// A repository, image or tag name cannot be used as a path segment.
    InvalidName,

    /// The upload id is malformed, unknown or expired.
    InvalidUpload,

    /// Any other filesystem failure.
    Io,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::DigestMismatch => write!(f, "digest mismatch"),
            StorageErrorKind::InvalidDigest => write!(f, "invalid digest"),
            StorageErrorKind::InvalidName => write!(f, "invalid name"),
            StorageErrorKind::InvalidUpload => write!(f, "invalid upload"),
            StorageErrorKind::Io => write!(f, "I/O error"),
        }
    }
}

/// Storage error with a kind, a short description of the failed step, the
/// path involved (if any), and the span trace at the point of failure.
pub struct StorageError {
    kind: StorageErrorKind,
    context: String,
    path: Option<Utf8PathBuf>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    span_trace: SpanTrace,
}

impl StorageError {
    /// Create a new error of the given kind.
    #[track_caller]
    pub fn new(kind: StorageErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            path: None,
            source: None,
            span_trace: SpanTrace::capture(),
        }
    }

    /// Attach the path the failed operation was working on.
    pub fn with_path(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.path = Some(path.as_ref().to_owned());
        self
    }

    /// Attach the underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        self.source = Some(source.into());
        self
    }

    /// Build a mapper for `io::Error`s raised while touching `path`.
    ///
    /// `io::ErrorKind::NotFound` becomes [`StorageErrorKind::NotFound`], everything
    /// else is [`StorageErrorKind::Io`].
    pub fn io<'p>(
        context: &'static str,
        path: &'p Utf8Path,
    ) -> impl FnOnce(io::Error) -> StorageError + 'p {
        move |error| {
            let kind = if error.kind() == io::ErrorKind::NotFound {
                StorageErrorKind::NotFound
            } else {
                StorageErrorKind::Io
            };
            StorageError::new(kind, context)
                .with_path(path)
                .with_source(error)
        }
    }

    /// The category of this error.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Shorthand for `kind() == StorageErrorKind::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind == StorageErrorKind::NotFound
    }

    /// The path involved, if the error concerns a specific file.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// The span trace captured when this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.span_trace
    }
}

impl fmt::Debug for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageError")
            .field("kind", &self.kind)
            .field("context", &self.context)
            .field("path", &self.path)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.context)?;
        if let Some(path) = &self.path {
            write!(f, " ({path})")?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}
