//! Request inspection and classification.
//!
//! The distribution URL grammar overlaps in awkward ways (`/blobs/uploads`,
//! `/blobs/upload/id/{id}`, `/blobs/{digest}`), so instead of a route table every
//! request is classified here in a fixed order, first match wins.

use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, header};
use base64::Engine as _;
use registry_storage::Namespace;

use crate::error::{RegistryError, RegistryResult};

/// Path of the registry API root.
pub const API_ROOT: &str = "/v2";

/// Path of the token endpoint.
pub const AUTH_PATH: &str = "/v2/auth";

/// The operation a request maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `GET /v2/`: reachability and credential check.
    Ping,
    /// `GET /v2/auth`: exchange credentials for a token.
    Authenticate,
    /// `GET .../manifests/{reference}`
    GetManifest,
    /// `HEAD .../manifests/{reference}`
    HeadManifest,
    /// `PUT .../manifests/{reference}`
    PutManifest,
    /// `DELETE .../blobs/upload/id/{id}`
    CancelUpload,
    /// `PATCH .../blobs/upload/id/{id}`
    PatchUpload,
    /// `PUT .../blobs/upload/id/{id}?digest=...`
    CompleteUpload,
    /// `POST .../blobs/uploads`
    StartUpload,
    /// `HEAD .../blobs/{digest}`
    StatBlob,
    /// `GET .../blobs/{digest}`
    GetBlob,
    /// Nothing matched.
    Unsupported,
}

impl Operation {
    /// Classify a request by method and path.
    pub fn classify(method: &Method, path: &str) -> Self {
        let trimmed = path.strip_suffix('/').unwrap_or(path);

        if trimmed == API_ROOT {
            return Operation::Ping;
        }

        if trimmed == AUTH_PATH {
            return Operation::Authenticate;
        }

        if path.contains("/manifests/") {
            return match *method {
                Method::GET => Operation::GetManifest,
                Method::HEAD => Operation::HeadManifest,
                Method::PUT => Operation::PutManifest,
                _ => Operation::Unsupported,
            };
        }

        if path.contains("/blobs/upload/id/") {
            return match *method {
                Method::DELETE => Operation::CancelUpload,
                Method::PATCH => Operation::PatchUpload,
                Method::PUT => Operation::CompleteUpload,
                _ => Operation::Unsupported,
            };
        }

        if trimmed.ends_with("/blobs/uploads") && method == Method::POST {
            return Operation::StartUpload;
        }

        if path.contains("/blobs/") {
            match *method {
                Method::HEAD => return Operation::StatBlob,
                Method::GET => return Operation::GetBlob,
                _ => {}
            }
        }

        Operation::Unsupported
    }

    /// Ping and authenticate handle credentials themselves; everything else
    /// must be authorized before it runs.
    pub fn requires_authorization(&self) -> bool {
        !matches!(self, Operation::Ping | Operation::Authenticate)
    }
}

/// Scope of access requested from the token endpoint, sent by container
/// runtimes as `?scope=repository:<repo>/<image>:pull,push&service=...&account=...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessScope {
    /// Account name, if the client sent one.
    pub account: Option<String>,
    /// Service name, if the client sent one.
    pub service: Option<String>,
    /// Repository part of the scope.
    pub repository: String,
    /// Image part of the scope.
    pub image: String,
    /// Requested actions, e.g. `pull`, `push`.
    pub actions: Vec<String>,
}

/// The scope query parameter could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid access scope: {0:?}")]
pub struct InvalidScope(String);

/// Namespace and trailing identifier of a blob or manifest path.
#[derive(Debug, Clone)]
pub struct Target<'a> {
    /// Repository and image.
    pub namespace: Namespace,
    /// Last path segment: a tag, digest or upload id.
    pub reference: &'a str,
}

/// Read-only view of an incoming request, with helpers for the parts of the
/// distribution protocol that live in headers, query string and path.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    parts: &'a Parts,
}

impl<'a> Request<'a> {
    /// Wrap the head of a request.
    pub fn new(parts: &'a Parts) -> Self {
        Self { parts }
    }

    /// The request method.
    pub fn method(&self) -> &'a Method {
        &self.parts.method
    }

    /// The request path, without query.
    pub fn path(&self) -> &'a str {
        self.parts.uri.path()
    }

    /// The request headers.
    pub fn headers(&self) -> &'a HeaderMap {
        &self.parts.headers
    }

    /// The host the client addressed, from the `host` header or the URI.
    pub fn host(&self) -> Option<&'a str> {
        self.parts
            .headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.parts.uri.authority().map(|authority| authority.as_str()))
    }

    /// First value of a query parameter, percent-decoded.
    pub fn query(&self, name: &str) -> Option<String> {
        let query = self.parts.uri.query()?;
        serde_urlencoded::from_str::<Vec<(String, String)>>(query)
            .ok()?
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    fn authorization(&self) -> Option<&'a str> {
        self.parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }

    /// Username and password from a `Basic` authorization header.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        let encoded = self.authorization()?.strip_prefix("Basic ")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, password) = decoded.split_once(':')?;
        Some((user.to_owned(), password.to_owned()))
    }

    /// Token from a `Bearer` authorization header.
    pub fn bearer_token(&self) -> Option<&'a str> {
        self.authorization()?.strip_prefix("Bearer ").map(str::trim)
    }

    /// Parse the access scope sent to the token endpoint.
    pub fn access_scope(&self) -> Result<AccessScope, InvalidScope> {
        let scope = self.query("scope").unwrap_or_default();

        let fields: Vec<&str> = scope.split(':').collect();
        let [_, name, actions] = fields.as_slice() else {
            return Err(InvalidScope(scope));
        };
        let Some((repository, image)) = name.split_once('/') else {
            return Err(InvalidScope(scope));
        };
        if image.contains('/') {
            return Err(InvalidScope(scope));
        }

        Ok(AccessScope {
            account: self.query("account"),
            service: self.query("service"),
            repository: repository.to_owned(),
            image: image.to_owned(),
            actions: actions.split(',').map(str::to_owned).collect(),
        })
    }

    /// Extract namespace and last segment from `/v2/{repo}/{image}/{section}/...`.
    pub fn target(&self, section: &str) -> RegistryResult<Target<'a>> {
        let path = self.path();
        let segments: Vec<&'a str> = path.split('/').collect();

        let (repository, image) = match segments.as_slice() {
            ["", "v2", repository, image, found, ..] if *found == section => (*repository, *image),
            _ => {
                return Err(RegistryError::MalformedPath(format!(
                    "unable to extract repository and image from {path:?}"
                )));
            }
        };

        let namespace = Namespace::new(repository, image)
            .map_err(|err| RegistryError::MalformedPath(err.to_string()))?;

        Ok(Target {
            namespace,
            reference: segments.last().copied().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request as HttpRequest;

    use super::*;

    fn parts(method: Method, uri: &str) -> Parts {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn classify(method: Method, path: &str) -> Operation {
        Operation::classify(&method, path)
    }

    #[test]
    fn classify_root_and_auth() {
        assert_eq!(classify(Method::GET, "/v2"), Operation::Ping);
        assert_eq!(classify(Method::GET, "/v2/"), Operation::Ping);
        assert_eq!(classify(Method::GET, "/v2/auth"), Operation::Authenticate);
        assert_eq!(classify(Method::GET, "/v2/auth/"), Operation::Authenticate);
    }

    #[test]
    fn classify_manifests() {
        let path = "/v2/acme/app/manifests/latest";
        assert_eq!(classify(Method::GET, path), Operation::GetManifest);
        assert_eq!(classify(Method::HEAD, path), Operation::HeadManifest);
        assert_eq!(classify(Method::PUT, path), Operation::PutManifest);
        assert_eq!(classify(Method::DELETE, path), Operation::Unsupported);
    }

    #[test]
    fn classify_uploads() {
        let id = "/v2/acme/app/blobs/upload/id/4b7f0e1c-0f5e-4a53-9d7a-5a0f3f5b6c1d";
        assert_eq!(classify(Method::PATCH, id), Operation::PatchUpload);
        assert_eq!(classify(Method::PUT, id), Operation::CompleteUpload);
        assert_eq!(classify(Method::DELETE, id), Operation::CancelUpload);
        assert_eq!(classify(Method::GET, id), Operation::Unsupported);

        assert_eq!(
            classify(Method::POST, "/v2/acme/app/blobs/uploads"),
            Operation::StartUpload
        );
        assert_eq!(
            classify(Method::POST, "/v2/acme/app/blobs/uploads/"),
            Operation::StartUpload
        );
    }

    #[test]
    fn classify_blobs() {
        let path = "/v2/acme/app/blobs/sha256:abc";
        assert_eq!(classify(Method::HEAD, path), Operation::StatBlob);
        assert_eq!(classify(Method::GET, path), Operation::GetBlob);
        assert_eq!(classify(Method::DELETE, path), Operation::Unsupported);
    }

    #[test]
    fn classify_everything_else() {
        assert_eq!(classify(Method::GET, "/"), Operation::Unsupported);
        assert_eq!(classify(Method::GET, "/v2/acme/app/tags/list"), Operation::Unsupported);
        assert!(!Operation::Ping.requires_authorization());
        assert!(Operation::GetBlob.requires_authorization());
    }

    #[test]
    fn target_extracts_namespace_and_reference() {
        let parts = parts(Method::GET, "/v2/acme/app/manifests/v1");
        let target = Request::new(&parts).target("manifests").unwrap();
        assert_eq!(target.namespace.repository(), "acme");
        assert_eq!(target.namespace.image(), "app");
        assert_eq!(target.reference, "v1");
    }

    #[test]
    fn target_rejects_malformed_paths() {
        for uri in [
            "/v2/acme/manifests/v1",
            "/v2/../app/manifests/v1",
            "/v3/acme/app/manifests/v1",
        ] {
            let parts = parts(Method::GET, uri);
            let err = Request::new(&parts).target("manifests").unwrap_err();
            assert!(matches!(err, RegistryError::MalformedPath(_)), "{uri}");
        }
    }

    #[test]
    fn query_is_decoded() {
        let parts = parts(
            Method::PUT,
            "/v2/acme/app/blobs/upload/id/x?digest=sha256%3Aabc&other=1",
        );
        let request = Request::new(&parts);
        assert_eq!(request.query("digest").as_deref(), Some("sha256:abc"));
        assert_eq!(request.query("missing"), None);
    }

    #[test]
    fn basic_and_bearer_credentials() {
        let mut parts = parts(Method::GET, "/v2/auth");
        parts.headers.insert(
            header::AUTHORIZATION,
            "Basic dXNlcjoxMjM=".parse().unwrap(),
        );
        assert_eq!(
            Request::new(&parts).basic_auth(),
            Some(("user".to_owned(), "123".to_owned()))
        );
        assert_eq!(Request::new(&parts).bearer_token(), None);

        parts
            .headers
            .insert(header::AUTHORIZATION, "Bearer token123".parse().unwrap());
        assert_eq!(Request::new(&parts).bearer_token(), Some("token123"));
        assert_eq!(Request::new(&parts).basic_auth(), None);
    }

    #[test]
    fn access_scope_parsing() {
        let parts = parts(
            Method::GET,
            "/v2/auth?account=user&scope=repository%3Aacme%2Fapp%3Apull%2Cpush&service=registry",
        );
        let scope = Request::new(&parts).access_scope().unwrap();
        assert_eq!(
            scope,
            AccessScope {
                account: Some("user".to_owned()),
                service: Some("registry".to_owned()),
                repository: "acme".to_owned(),
                image: "app".to_owned(),
                actions: vec!["pull".to_owned(), "push".to_owned()],
            }
        );

        let parts = self::parts(Method::GET, "/v2/auth?scope=repository%3Aacme%3Apull");
        assert!(Request::new(&parts).access_scope().is_err());
    }
}
