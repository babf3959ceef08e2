//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use registry_storage::{StorageError, StorageErrorKind};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Boxed error returned by pluggable collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Missing or invalid credentials
    #[error("authentication required")]
    Unauthorized,

    /// Blob not found
    #[error("blob unknown to registry: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest unknown to registry: {0}")]
    ManifestNotFound(String),

    /// Upload id is malformed, unknown or expired
    #[error("blob upload unknown to registry: {0}")]
    BlobUploadUnknown(String),

    /// Digest mismatch, or a missing or malformed digest
    #[error("digest invalid: {0}")]
    DigestInvalid(String),

    /// No operation matches the request method and path
    #[error("unsupported operation")]
    Unsupported,

    /// Repository, image or reference could not be extracted from the path
    #[error("malformed request path: {0}")]
    MalformedPath(String),

    /// The tag event sink rejected a new tag
    #[error("event handler failed: {0}")]
    Notification(#[source] BoxError),

    /// Storage error
    #[error("{0}")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for RegistryError {
    fn from(error: StorageError) -> Self {
        match error.kind() {
            StorageErrorKind::NotFound => RegistryError::BlobNotFound(error.to_string()),
            StorageErrorKind::DigestMismatch | StorageErrorKind::InvalidDigest => {
                RegistryError::DigestInvalid(error.to_string())
            }
            StorageErrorKind::InvalidUpload => RegistryError::BlobUploadUnknown(error.to_string()),
            StorageErrorKind::InvalidName | StorageErrorKind::Io => RegistryError::Storage(error),
        }
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::BlobUploadUnknown(_) => StatusCode::NOT_FOUND,
            RegistryError::DigestInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::MalformedPath(_)
            | RegistryError::Notification(_)
            | RegistryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::Unauthorized => "UNAUTHORIZED",
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::DigestInvalid(_) => "DIGEST_INVALID",
            RegistryError::Unsupported => "UNSUPPORTED",
            RegistryError::MalformedPath(_)
            | RegistryError::Notification(_)
            | RegistryError::Storage(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_kinds_map_to_wire_codes() {
        let cases = [
            (StorageErrorKind::NotFound, "BLOB_UNKNOWN", StatusCode::NOT_FOUND),
            (StorageErrorKind::DigestMismatch, "DIGEST_INVALID", StatusCode::BAD_REQUEST),
            (StorageErrorKind::InvalidUpload, "BLOB_UPLOAD_UNKNOWN", StatusCode::NOT_FOUND),
            (StorageErrorKind::Io, "INTERNAL_SERVER_ERROR", StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (kind, code, status) in cases {
            let err = RegistryError::from(StorageError::new(kind, "test"));
            assert_eq!(err.error_code(), code);
            assert_eq!(err.status_code(), status);
        }
    }

    #[tokio::test]
    async fn error_body_shape() {
        let response = RegistryError::Unsupported.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "errors": [{"code": "UNSUPPORTED", "message": "unsupported operation"}]
            })
        );
    }
}
