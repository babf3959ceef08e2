//! # OCI Container Registry
//!
//! A registry server implementing the push and pull halves of the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec),
//! storing everything on the local filesystem.
//!
//! ## Features
//!
//! - Chunked blob uploads, verified against their digest on completion
//! - Manifests by tag or by digest
//! - Pluggable authorization via [`Authorizer`]
//! - New-tag notifications via [`EventSink`]
//! - Expired and abandoned uploads are swept in the background
//!
//! ## Example
//!
//! ```no_run
//! use image_registry::{AllowAll, RegistryBuilder};
//! use registry_storage::StorageConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RegistryBuilder::new(AllowAll)
//!     .storage(StorageConfig::default())
//!     .build();
//!
//! let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! let server = tokio::spawn(registry.serve(listener, async move {
//!     let _ = stopped.await;
//! }));
//!
//! // ...
//! let _ = stop.send(());
//! server.await??;
//! # Ok(())
//! # }
//! ```

mod api;
mod auth;
mod blob;
pub mod config;
mod error;
mod manifest;
mod request;

pub use api::{
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SWEEP_INTERVAL, DEFAULT_UPLOAD_TTL, Registry,
    RegistryBuilder,
};
pub use auth::{AllowAll, Authorizer, EventSink, LogEvents, Secret, StaticAuthorizer};
pub use config::RegistryConfig;
pub use error::{BoxError, RegistryError, RegistryResult};
pub use request::{AccessScope, InvalidScope, Operation, Request, Target};
