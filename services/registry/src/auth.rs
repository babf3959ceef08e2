//! Authentication and authorization hooks.
//!
//! The registry never decides on its own who may push or pull. Every request
//! except the ping and token endpoints is passed to an [`Authorizer`], and new
//! tags are reported to an optional [`EventSink`].

use std::borrow::Cow;
use std::fmt;
use std::ops::Deref;

use serde::Deserialize;
use zeroize::Zeroize;

use crate::error::{BoxError, RegistryError, RegistryResult};
use crate::request::Request;

/// Pluggable credential check.
#[async_trait::async_trait]
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// Exchange the credentials in `request` for a token, returned to the
    /// client as `{"token": "..."}`.
    async fn authenticate(&self, request: &Request<'_>) -> RegistryResult<String>;

    /// Check the credential carried by `request`.
    async fn authorize(&self, request: &Request<'_>) -> RegistryResult<()>;
}

/// Observer for registry events.
#[async_trait::async_trait]
pub trait EventSink: fmt::Debug + Send + Sync {
    /// Called after a manifest has been pushed under a tag. An error aborts
    /// the push with an internal error, although the tag is already written.
    async fn new_tag(&self, repository: &str, image: &str, tag: &str) -> Result<(), BoxError>;
}

/// Lets every request through. Useful for tests and private networks.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl Authorizer for AllowAll {
    async fn authenticate(&self, _request: &Request<'_>) -> RegistryResult<String> {
        Ok("anonymous".to_owned())
    }

    async fn authorize(&self, _request: &Request<'_>) -> RegistryResult<()> {
        Ok(())
    }
}

/// A single static account: HTTP Basic credentials are exchanged for one
/// fixed bearer token.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticAuthorizer {
    username: String,
    password: Secret,
    token: Secret,
}

impl StaticAuthorizer {
    /// Create an authorizer for one account.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<Secret>,
        token: impl Into<Secret>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            token: token.into(),
        }
    }
}

#[async_trait::async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authenticate(&self, request: &Request<'_>) -> RegistryResult<String> {
        match request.basic_auth() {
            Some((user, password))
                if user == self.username && password == self.password.revealed() =>
            {
                if let Ok(scope) = request.access_scope() {
                    tracing::debug!(
                        repository = %scope.repository,
                        image = %scope.image,
                        actions = ?scope.actions,
                        "issuing token"
                    );
                }
                Ok(self.token.revealed().to_owned())
            }
            _ => Err(RegistryError::Unauthorized),
        }
    }

    async fn authorize(&self, request: &Request<'_>) -> RegistryResult<()> {
        match request.bearer_token() {
            Some(token) if token == self.token.revealed() => Ok(()),
            _ => Err(RegistryError::Unauthorized),
        }
    }
}

/// Reports new tags to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEvents;

#[async_trait::async_trait]
impl EventSink for LogEvents {
    async fn new_tag(&self, repository: &str, image: &str, tag: &str) -> Result<(), BoxError> {
        tracing::info!("new tag {repository}/{image}:{tag}");
        Ok(())
    }
}

/// A password or token. Hidden from `Debug` output and zeroed on drop.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Secret {
    /// The underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}
