//! Manifest operations for the registry

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use registry_storage::{Digest, StorageError, TagStore};
use tokio_util::io::ReaderStream;

use crate::api::{DOCKER_CONTENT_DIGEST, RegistryState};
use crate::blob::body_reader;
use crate::error::{RegistryError, RegistryResult};
use crate::request::Request;

/// Manifests are buffered to detect their media type; anything larger is
/// streamed as opaque bytes.
const MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Get a manifest by tag or digest. With `head_only` the body is omitted.
pub(crate) async fn get(
    registry: &RegistryState,
    request: &Request<'_>,
    head_only: bool,
) -> RegistryResult<Response> {
    let target = request.target("manifests")?;
    let reference = target.reference;
    let storage = &registry.storage;

    let found = if Digest::is_digest_reference(reference) {
        let digest: Digest = reference.parse()?;
        storage.blobs.get(&target.namespace, &digest).await
    } else {
        storage.tags.get_tag(&target.namespace, reference).await
    };

    let blob = found.map_err(|err: StorageError| {
        if err.is_not_found() {
            RegistryError::ManifestNotFound(format!("{}:{reference}", target.namespace))
        } else {
            err.into()
        }
    })?;

    let digest = blob.digest().clone();
    if blob.size() > MAX_MANIFEST_SIZE {
        // Too large to be a manifest; most likely a layer fetched by digest.
        let headers = [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, blob.size().to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ];
        if head_only {
            return Ok((StatusCode::OK, headers).into_response());
        }
        let body = Body::from_stream(ReaderStream::new(blob.into_file()));
        return Ok((StatusCode::OK, headers, body).into_response());
    }

    let data = blob.read_to_vec().await?;

    let headers = [
        (header::CONTENT_TYPE, detect_manifest_type(&data)),
        (header::CONTENT_LENGTH, data.len().to_string()),
        (DOCKER_CONTENT_DIGEST, digest.to_string()),
    ];

    if head_only {
        Ok((StatusCode::OK, headers).into_response())
    } else {
        Ok((StatusCode::OK, headers, Body::from(data)).into_response())
    }
}

/// Put a manifest
///
/// The manifest is stored as a blob under its own digest. When the reference
/// is a tag, the tag is pointed at that digest and the event sink is told.
pub(crate) async fn put(
    registry: &RegistryState,
    request: &Request<'_>,
    body: Body,
) -> RegistryResult<Response> {
    let target = request.target("manifests")?;
    let reference = target.reference;
    let namespace = &target.namespace;
    let storage = &registry.storage;
    let mut reader = body_reader(body);

    let digest = if Digest::is_digest_reference(reference) {
        let digest: Digest = reference.parse()?;
        storage.blobs.put(namespace, &digest, &mut reader).await?;
        tracing::info!("new manifest upload {namespace}@{digest}");
        digest
    } else {
        TagStore::validate_tag(reference)?;
        let digest = storage.blobs.ingest(namespace, &mut reader).await?;
        storage.tags.put_tag(namespace, reference, &digest).await?;

        if let Some(events) = &registry.events {
            events
                .new_tag(namespace.repository(), namespace.image(), reference)
                .await
                .map_err(|err| {
                    tracing::error!("event handler failed: {err}");
                    RegistryError::Notification(err)
                })?;
        }

        tracing::info!("new manifest tag upload {namespace}:{reference}");
        digest
    };

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{namespace}/manifests/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Detect manifest type from content
fn detect_manifest_type(data: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
            return media_type.to_string();
        }

        if let Some(schema_version) = json.get("schemaVersion").and_then(|v| v.as_u64()) {
            return match schema_version {
                1 => "application/vnd.docker.distribution.manifest.v1+prettyjws".to_string(),
                2 if json.get("manifests").is_some() => {
                    "application/vnd.oci.image.index.v1+json".to_string()
                }
                _ => "application/vnd.oci.image.manifest.v1+json".to_string(),
            };
        }
    }

    "application/json".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_wins() {
        let data = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json"}"#;
        assert_eq!(
            detect_manifest_type(data),
            "application/vnd.docker.distribution.manifest.v2+json"
        );
    }

    #[test]
    fn schema_version_fallbacks() {
        assert_eq!(
            detect_manifest_type(br#"{"schemaVersion":1}"#),
            "application/vnd.docker.distribution.manifest.v1+prettyjws"
        );
        assert_eq!(
            detect_manifest_type(br#"{"schemaVersion":2,"manifests":[]}"#),
            "application/vnd.oci.image.index.v1+json"
        );
        assert_eq!(
            detect_manifest_type(br#"{"schemaVersion":2,"layers":[]}"#),
            "application/vnd.oci.image.manifest.v1+json"
        );
    }

    #[test]
    fn opaque_content() {
        assert_eq!(detect_manifest_type(b"not json"), "application/json");
    }
}
