//! Server configuration, usually read from a TOML file.
//!
//! ```toml
//! bind = "0.0.0.0:8080"
//! upload-ttl = 1200
//!
//! [storage]
//! root = "/var/lib/registry"
//! uploads = "/var/lib/registry/uploads"
//!
//! [auth]
//! username = "ci"
//! password = "hunter2"
//! token = "8e1b1e0c"
//! ```
//!
//! Durations are in seconds. Without an `[auth]` table every request is
//! allowed.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use registry_storage::StorageConfig;
use serde::Deserialize;

use crate::api::{
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SWEEP_INTERVAL, DEFAULT_UPLOAD_TTL, RegistryBuilder,
};
use crate::auth::{AllowAll, StaticAuthorizer};

/// Registry server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegistryConfig {
    /// Address to listen on.
    pub bind: SocketAddr,

    /// Storage directories.
    pub storage: StorageConfig,

    /// Seconds an upload session stays valid.
    pub upload_ttl: u64,

    /// Seconds between upload sweeps.
    pub sweep_interval: u64,

    /// Seconds to wait for in-flight requests on shutdown.
    pub shutdown_timeout: u64,

    /// Base URL advertised in authentication challenges.
    pub realm: Option<String>,

    /// Static credentials. When absent, every request is allowed.
    pub auth: Option<StaticAuthorizer>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            storage: StorageConfig::default(),
            upload_ttl: DEFAULT_UPLOAD_TTL.as_secs(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL.as_secs(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            realm: None,
            auth: None,
        }
    }
}

impl RegistryConfig {
    /// Time-to-live of new upload sessions.
    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl)
    }

    /// Period of the upload sweeper.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    /// Grace period for in-flight requests on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// A builder carrying every setting in this configuration.
    pub fn into_builder(self) -> RegistryBuilder {
        let (upload_ttl, sweep_interval, shutdown_timeout) =
            (self.upload_ttl(), self.sweep_interval(), self.shutdown_timeout());

        let builder = match self.auth {
            Some(authorizer) => RegistryBuilder::new(authorizer),
            None => {
                tracing::warn!("no [auth] configured, allowing all requests");
                RegistryBuilder::new(AllowAll)
            }
        };

        let builder = builder
            .storage(self.storage)
            .upload_ttl(upload_ttl)
            .sweep_interval(sweep_interval)
            .shutdown_timeout(shutdown_timeout);

        match self.realm {
            Some(realm) => builder.realm(realm),
            None => builder,
        }
    }
}

#[cfg(feature = "cli")]
pub use self::file::ConfigError;

#[cfg(feature = "cli")]
mod file {
    use camino::{Utf8Path, Utf8PathBuf};

    use super::RegistryConfig;

    /// Failure to load a configuration file.
    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        /// The file could not be read.
        #[error("reading {path}")]
        Read {
            /// Path of the configuration file.
            path: Utf8PathBuf,
            /// Underlying error.
            #[source]
            source: std::io::Error,
        },

        /// The file is not a valid configuration.
        #[error("parsing configuration")]
        Parse(#[from] toml_edit::de::Error),
    }

    impl RegistryConfig {
        /// Parse a configuration from TOML text.
        pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
            Ok(toml_edit::de::from_str(text)?)
        }

        /// Read and parse the configuration file at `path`.
        pub async fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })?;
            Self::from_toml(&text)
        }
    }
}
