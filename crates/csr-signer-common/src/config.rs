//! Signer configuration loaded from the `ejbca-config` config map
//!
//! The config map is mounted as YAML (default `./config/config.yaml`) and read
//! once at startup. Every field is optional; absent fields take the defaults
//! below. The resulting [`SignerConfig`] is immutable for the process lifetime.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::{Error, Result};

/// Default path of the mounted config map
pub const DEFAULT_CONFIG_PATH: &str = "./config/config.yaml";

/// Default port for the plain-text health endpoint
pub const DEFAULT_HEALTH_CHECK_PORT: u16 = 8080;

/// Default number of concurrent sync workers
pub const DEFAULT_WORKERS: usize = 3;

/// Default deadline for the initial watch cache sync
pub const DEFAULT_CACHE_SYNC_TIMEOUT_SECS: u64 = 60;

/// Process-wide signer configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignerConfig {
    /// Port the health endpoint listens on
    #[serde(rename = "healthcheckPort")]
    pub health_check_port: u16,
    /// Certificate profile used when a request carries no override
    pub default_certificate_profile_name: String,
    /// End entity profile used when a request carries no override
    pub default_end_entity_profile_name: String,
    /// Issuing CA used when a request carries no override
    pub default_certificate_authority_name: String,
    /// Enroll over EST instead of the REST API
    #[serde(rename = "useEST")]
    pub use_est: bool,
    /// EST alias used when a request carries no `estAlias` annotation
    #[serde(rename = "defaultESTAlias")]
    pub default_est_alias: String,
    /// Number of concurrent sync workers
    pub workers: usize,
    /// Deadline for the initial watch cache sync, in seconds
    pub cache_sync_timeout_seconds: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            health_check_port: DEFAULT_HEALTH_CHECK_PORT,
            default_certificate_profile_name: String::new(),
            default_end_entity_profile_name: String::new(),
            default_certificate_authority_name: String::new(),
            use_est: false,
            default_est_alias: String::new(),
            workers: DEFAULT_WORKERS,
            cache_sync_timeout_seconds: DEFAULT_CACHE_SYNC_TIMEOUT_SECS,
        }
    }
}

impl SignerConfig {
    /// Load configuration from a YAML file
    ///
    /// An empty file is rejected.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        info!(path = %shown, "Loading signer configuration");

        let buf = std::fs::read_to_string(path).map_err(|e| {
            Error::config(
                &shown,
                format!("{e}; ensure that a configmap was created called ejbca-config"),
            )
        })?;
        debug!(path = %shown, bytes = buf.len(), "Configuration file read");

        let config = Self::from_yaml(&buf).map_err(|e| match e {
            Error::Config { message, .. } => Error::config(&shown, message),
            other => other,
        })?;

        info!(
            use_est = config.use_est,
            workers = config.workers,
            health_check_port = config.health_check_port,
            "Loaded signer configuration"
        );
        Ok(config)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(Error::config(
                "<inline>",
                "configuration is empty; ensure that a configmap was created called ejbca-config",
            ));
        }
        let config: SignerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config("<inline>", format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("<inline>", "workers must be at least 1"));
        }
        if self.cache_sync_timeout_seconds == 0 {
            return Err(Error::config(
                "<inline>",
                "cacheSyncTimeoutSeconds must be at least 1",
            ));
        }
        Ok(())
    }

    /// Deadline for the initial watch cache sync
    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_seconds)
    }
}
