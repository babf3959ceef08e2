//! Repository/image namespaces.

use std::fmt;

use crate::error::{StorageError, StorageErrorKind};

/// The `(repository, image)` pair every blob and tag lives under.
///
/// Purely a path prefix: nothing is stored for the namespace itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    repository: String,
    image: String,
}

impl Namespace {
    /// Create a namespace, rejecting names that are not usable as a single
    /// path segment.
    pub fn new(
        repository: impl Into<String>,
        image: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let repository = repository.into();
        let image = image.into();
        validate_segment("repository", &repository)?;
        validate_segment("image", &image)?;
        Ok(Self { repository, image })
    }

    /// The repository name.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The image name.
    pub fn image(&self) -> &str {
        &self.image
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository, self.image)
    }
}

/// Check that `value` is a plain, non-hidden file name.
pub(crate) fn validate_segment(what: &str, value: &str) -> Result<(), StorageError> {
    if value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::new(
            StorageErrorKind::InvalidName,
            format!("{what} name {value:?}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        let ns = Namespace::new("acme", "app").unwrap();
        assert_eq!(ns.to_string(), "acme/app");
    }

    #[test]
    fn rejects_traversal() {
        for (repo, image) in [("..", "app"), ("acme", "."), ("", "app"), ("a/b", "c")] {
            let err = Namespace::new(repo, image).unwrap_err();
            assert_eq!(err.kind(), StorageErrorKind::InvalidName);
        }
    }
}
