//! Registry builder, request dispatch and server lifecycle

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use registry_storage::{Storage, StorageConfig};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::auth::{Authorizer, EventSink};
use crate::error::{RegistryError, RegistryResult};
use crate::request::{AUTH_PATH, Operation, Request};
use crate::{blob, manifest};

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");
pub(crate) const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
const DOCKER_API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

/// How long an upload session stays valid after it is started.
pub const DEFAULT_UPLOAD_TTL: Duration = Duration::from_secs(20 * 60);

/// How often expired and orphaned upload files are reclaimed.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for in-flight requests.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry builder for configuring and creating the registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: StorageConfig,
    authorizer: Arc<dyn Authorizer>,
    events: Option<Arc<dyn EventSink>>,
    upload_ttl: Duration,
    sweep_interval: Duration,
    shutdown_timeout: Duration,
    realm: Option<String>,
}

impl RegistryBuilder {
    /// Create a new registry builder, checking credentials with `authorizer`.
    pub fn new(authorizer: impl Authorizer + 'static) -> Self {
        Self {
            storage: StorageConfig::default(),
            authorizer: Arc::new(authorizer),
            events: None,
            upload_ttl: DEFAULT_UPLOAD_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            realm: None,
        }
    }

    /// Set the storage directories
    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Notify `events` of every new tag
    pub fn events(mut self, events: impl EventSink + 'static) -> Self {
        self.events = Some(Arc::new(events));
        self
    }

    /// Set the time-to-live of new upload sessions
    pub fn upload_ttl(mut self, ttl: Duration) -> Self {
        self.upload_ttl = ttl;
        self
    }

    /// Set the period of the upload sweeper
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set how long shutdown waits for in-flight requests
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the base URL advertised in `www-authenticate` challenges, e.g.
    /// `https://registry.example.com`. Defaults to `https://{host}`.
    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// Build the registry service
    pub fn build(self) -> Registry {
        Registry {
            state: Arc::new(RegistryState {
                storage: self.storage.build(),
                authorizer: self.authorizer,
                events: self.events,
                upload_ttl: self.upload_ttl,
                sweep_interval: self.sweep_interval,
                shutdown_timeout: self.shutdown_timeout,
                realm: self.realm,
            }),
        }
    }
}

#[derive(Debug)]
pub(crate) struct RegistryState {
    pub(crate) storage: Storage,
    pub(crate) authorizer: Arc<dyn Authorizer>,
    pub(crate) events: Option<Arc<dyn EventSink>>,
    pub(crate) upload_ttl: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) realm: Option<String>,
}

/// A configured registry.
#[derive(Debug, Clone)]
pub struct Registry {
    state: Arc<RegistryState>,
}

impl Registry {
    /// The stores this registry serves from.
    pub fn storage(&self) -> &Storage {
        &self.state.storage
    }

    /// Build the HTTP service.
    ///
    /// Every request goes through one dispatcher; see [`Operation::classify`].
    /// The upload sweeper is not started; [`Registry::serve`] does that.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.state.clone())
            .layer(SetResponseHeaderLayer::overriding(
                DOCKER_API_VERSION,
                HeaderValue::from_static("registry/2.0"),
            ))
    }

    /// Serve on `listener` until `shutdown` resolves.
    ///
    /// Removes staging files left by an earlier process, then runs the upload
    /// sweeper alongside the server. On shutdown, stops
    /// accepting connections, waits up to the shutdown timeout for in-flight
    /// requests, then stops the sweeper and waits for it to exit.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Err(err) = self.state.storage.blobs.remove_staging_files().await {
            tracing::warn!("unable to clean up staging files: {err}");
        }

        let token = CancellationToken::new();
        let sweeper = self
            .state
            .storage
            .uploads
            .spawn_sweeper(self.state.sweep_interval, token.child_token());

        let stopping = token.clone();
        let router = self.router();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stopping.cancelled().await })
                .await
        });

        let result = tokio::select! {
            joined = &mut server => Some(joined),
            _ = shutdown => None,
        };

        token.cancel();
        let result = match result {
            Some(joined) => joined.map_err(io::Error::other).and_then(|served| served),
            None => {
                tracing::info!("shutting down, waiting for in-flight requests");
                match tokio::time::timeout(self.state.shutdown_timeout, &mut server).await {
                    Ok(joined) => joined.map_err(io::Error::other).and_then(|served| served),
                    Err(_) => {
                        tracing::warn!(
                            timeout = ?self.state.shutdown_timeout,
                            "in-flight requests did not finish in time"
                        );
                        server.abort();
                        Ok(())
                    }
                }
            }
        };

        if let Err(err) = sweeper.await {
            tracing::error!("upload sweeper failed: {err}");
        }

        result
    }
}

async fn dispatch(
    State(registry): State<Arc<RegistryState>>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let request = Request::new(&parts);
    let operation = Operation::classify(request.method(), request.path());
    tracing::debug!(method = %request.method(), path = request.path(), ?operation, "request");

    match registry.handle(operation, &request, body).await {
        Ok(response) => response,
        Err(err) => registry.error_response(&request, operation, err),
    }
}

#[derive(Debug, serde::Serialize)]
struct TokenResponse {
    token: String,
}

impl RegistryState {
    async fn handle(
        &self,
        operation: Operation,
        request: &Request<'_>,
        body: Body,
    ) -> RegistryResult<Response> {
        if operation.requires_authorization() {
            self.authorizer.authorize(request).await?;
            return self.authorized(operation, request, body).await;
        }

        if matches!(operation, Operation::Authenticate) {
            let token = self.authorizer.authenticate(request).await?;
            return Ok(Json(TokenResponse { token }).into_response());
        }

        self.authorizer.authorize(request).await?;
        Ok((StatusCode::OK, Json(json!({}))).into_response())
    }

    async fn authorized(
        &self,
        operation: Operation,
        request: &Request<'_>,
        body: Body,
    ) -> RegistryResult<Response> {
        match operation {
            Operation::GetManifest => manifest::get(self, request, false).await,
            Operation::HeadManifest => manifest::get(self, request, true).await,
            Operation::PutManifest => manifest::put(self, request, body).await,
            Operation::CancelUpload => blob::cancel_upload(self, request).await,
            Operation::PatchUpload => blob::patch_upload(self, request, body).await,
            Operation::CompleteUpload => blob::complete_upload(self, request, body).await,
            Operation::StartUpload => blob::start_upload(self, request).await,
            Operation::StatBlob => blob::stat(self, request).await,
            Operation::GetBlob => blob::get(self, request).await,
            Operation::Ping | Operation::Authenticate | Operation::Unsupported => {
                Err(RegistryError::Unsupported)
            }
        }
    }

    fn error_response(
        &self,
        request: &Request<'_>,
        operation: Operation,
        err: RegistryError,
    ) -> Response {
        let status = err.status_code();
        if status.is_server_error() {
            tracing::error!(?operation, path = request.path(), "request failed: {err}");
        } else if !matches!(operation, Operation::Ping) {
            tracing::debug!(?operation, path = request.path(), "request rejected: {err}");
        }

        let unauthorized = matches!(err, RegistryError::Unauthorized);
        let mut response = err.into_response();
        if unauthorized {
            if let Some(challenge) = self.challenge(request) {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, challenge);
            }
        }
        response
    }

    /// The bearer challenge pointing clients at the token endpoint.
    fn challenge(&self, request: &Request<'_>) -> Option<HeaderValue> {
        let host = request.host().unwrap_or("localhost");
        let base = match &self.realm {
            Some(realm) => realm.trim_end_matches('/').to_owned(),
            None => format!("https://{host}"),
        };
        HeaderValue::from_str(&format!(
            "Bearer realm=\"{base}{AUTH_PATH}\",service=\"{host}\""
        ))
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;

    #[test]
    fn test_builder() {
        let registry = RegistryBuilder::new(AllowAll)
            .upload_ttl(Duration::from_secs(5))
            .realm("https://registry.example.com/")
            .build();
        assert_eq!(registry.state.upload_ttl, Duration::from_secs(5));
        let _router = registry.router();
    }

    #[test]
    fn challenge_uses_realm() {
        let registry = RegistryBuilder::new(AllowAll)
            .realm("https://registry.example.com/")
            .build();
        let (parts, _) = axum::http::Request::builder()
            .uri("/v2/")
            .header(header::HOST, "localhost:8080")
            .body(())
            .unwrap()
            .into_parts();

        let challenge = registry.state.challenge(&Request::new(&parts)).unwrap();
        assert_eq!(
            challenge,
            "Bearer realm=\"https://registry.example.com/v2/auth\",service=\"localhost:8080\""
        );
    }

    #[tokio::test]
    async fn serve_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap();
        let registry = RegistryBuilder::new(AllowAll)
            .storage(StorageConfig {
                root: root.join("storage"),
                uploads: root.join("uploads"),
            })
            .shutdown_timeout(Duration::from_secs(1))
            .build();

        let image_dir = root.join("storage").join("acme").join("app");
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::write(image_dir.join(".upload.stale"), b"partial").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(registry.serve(listener, async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
        assert!(!image_dir.join(".upload.stale").exists());
    }
}
