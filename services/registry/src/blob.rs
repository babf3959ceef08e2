//! Blob operations for the registry

use std::io;

use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use registry_storage::{Digest, Namespace, UploadId};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::api::{DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID, RegistryState};
use crate::error::{RegistryError, RegistryResult};
use crate::request::Request;

/// Adapt a request body into a byte reader for the stores.
pub(crate) fn body_reader(body: Body) -> impl AsyncRead + Unpin + Send {
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

fn upload_location(namespace: &Namespace, id: &UploadId) -> String {
    format!("/v2/{namespace}/blobs/upload/id/{id}")
}

fn blob_location(namespace: &Namespace, digest: &Digest) -> String {
    format!("/v2/{namespace}/blobs/{digest}")
}

/// Check if a blob exists
pub(crate) async fn stat(
    registry: &RegistryState,
    request: &Request<'_>,
) -> RegistryResult<Response> {
    let target = request.target("blobs")?;
    let digest: Digest = target.reference.parse()?;

    let size = registry.storage.blobs.stat(&target.namespace, &digest).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_LENGTH, size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Get a blob
pub(crate) async fn get(
    registry: &RegistryState,
    request: &Request<'_>,
) -> RegistryResult<Response> {
    let target = request.target("blobs")?;
    let digest: Digest = target.reference.parse()?;

    let blob = registry.storage.blobs.get(&target.namespace, &digest).await?;
    let size = blob.size();
    let body = Body::from_stream(ReaderStream::new(blob.into_file()));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, size.to_string()),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
        body,
    )
        .into_response())
}

/// Start a blob upload session
pub(crate) async fn start_upload(
    registry: &RegistryState,
    request: &Request<'_>,
) -> RegistryResult<Response> {
    let target = request.target("blobs")?;

    let id = registry.storage.uploads.start(registry.upload_ttl).await;
    tracing::info!(namespace = %target.namespace, %id, "blob upload started");

    Ok((
        StatusCode::ACCEPTED,
        [
            (header::LOCATION, upload_location(&target.namespace, &id)),
            (header::RANGE, "0-0".to_owned()),
            (DOCKER_UPLOAD_UUID, id.to_string()),
        ],
    )
        .into_response())
}

/// Append a chunk to an upload
pub(crate) async fn patch_upload(
    registry: &RegistryState,
    request: &Request<'_>,
    body: Body,
) -> RegistryResult<Response> {
    let target = request.target("blobs")?;
    let id: UploadId = target.reference.parse()?;

    let appended = registry
        .storage
        .uploads
        .append(&id, &mut body_reader(body))
        .await?;
    tracing::debug!(%id, written = appended.written, offset = appended.offset, "chunk received");

    Ok((
        StatusCode::NO_CONTENT,
        [
            (header::LOCATION, upload_location(&target.namespace, &id)),
            (header::RANGE, format!("0-{}", appended.offset)),
            (DOCKER_UPLOAD_UUID, id.to_string()),
        ],
    )
        .into_response())
}

/// Append the final chunk, then move the upload into blob storage under the
/// digest given in the query string.
pub(crate) async fn complete_upload(
    registry: &RegistryState,
    request: &Request<'_>,
    body: Body,
) -> RegistryResult<Response> {
    let target = request.target("blobs")?;
    let id: UploadId = target.reference.parse()?;

    let digest: Digest = request
        .query("digest")
        .ok_or_else(|| RegistryError::DigestInvalid("missing digest query parameter".to_owned()))?
        .parse()?;

    let uploads = &registry.storage.uploads;
    uploads.append(&id, &mut body_reader(body)).await?;

    let mut upload = uploads.commit(&id).await?;
    let size = registry
        .storage
        .blobs
        .put(&target.namespace, &digest, &mut upload)
        .await?;
    drop(upload);

    tracing::info!(namespace = %target.namespace, %digest, size, "blob stored");

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, blob_location(&target.namespace, &digest)),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
        ],
    )
        .into_response())
}

/// Cancel a blob upload
pub(crate) async fn cancel_upload(
    registry: &RegistryState,
    request: &Request<'_>,
) -> RegistryResult<Response> {
    let target = request.target("blobs")?;
    let id: UploadId = target.reference.parse()?;

    if !registry.storage.uploads.cancel(&id).await {
        tracing::debug!(%id, "cancelled an upload that was not active");
    }

    Ok(StatusCode::OK.into_response())
}
