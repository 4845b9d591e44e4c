//! Certificate authority credentials
//!
//! Loaded from the `ejbca-credentials` secret, mounted as YAML (default
//! `./credentials/credentials.yaml`). When `CLIENT_CERT_DIR` is exported the
//! client certificate and key of a `kubernetes.io/tls` secret mounted there
//! (`tls.crt`/`tls.key`) are used for mutual TLS with the authority.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, Result};

/// Default path of the mounted credentials secret
pub const DEFAULT_CREDENTIALS_PATH: &str = "./credentials/credentials.yaml";

/// Environment variable naming the directory holding the client TLS secret
pub const CLIENT_CERT_DIR_ENV: &str = "CLIENT_CERT_DIR";

/// Credentials for reaching the certificate authority
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthorityCredentials {
    /// Hostname (optionally with port) of the authority
    pub hostname: String,
    /// Password protecting the client key; encrypted keys are not supported
    pub key_password: String,
    /// Username for EST HTTP basic authentication
    #[serde(rename = "ejbcaUsername")]
    pub username: String,
    /// Password for EST HTTP basic authentication
    #[serde(rename = "ejbcaPassword")]
    pub password: String,
    /// Client certificate used for mutual TLS
    #[serde(skip)]
    pub client_cert_path: Option<PathBuf>,
    /// Client key used for mutual TLS
    #[serde(skip)]
    pub client_key_path: Option<PathBuf>,
}

impl std::fmt::Debug for AuthorityCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityCredentials")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("client_cert_path", &self.client_cert_path)
            .field("client_key_path", &self.client_key_path)
            .finish_non_exhaustive()
    }
}

impl AuthorityCredentials {
    /// Load credentials from a YAML file, resolving client TLS paths from the
    /// `CLIENT_CERT_DIR` environment variable
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let client_dir = std::env::var(CLIENT_CERT_DIR_ENV)
            .ok()
            .filter(|d| !d.is_empty());
        Self::load_with_client_dir(path, client_dir.as_deref().map(Path::new))
    }

    /// Load credentials from a YAML file with an explicit client TLS directory
    pub fn load_with_client_dir(path: impl AsRef<Path>, client_dir: Option<&Path>) -> Result<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        info!(path = %shown, "Loading authority credentials");

        let buf = std::fs::read_to_string(path).map_err(|e| {
            Error::config(
                &shown,
                format!("{e}; ensure that a secret was created called ejbca-credentials"),
            )
        })?;
        if buf.trim().is_empty() {
            return Err(Error::config(
                &shown,
                "credentials are empty; ensure that a secret was created called ejbca-credentials",
            ));
        }

        let mut creds: AuthorityCredentials = serde_yaml::from_str(&buf)
            .map_err(|e| Error::config(&shown, format!("invalid YAML: {e}")))?;

        if let Some(dir) = client_dir {
            creds.client_cert_path = readable(dir.join("tls.crt"));
            creds.client_key_path = readable(dir.join("tls.key"));
        }

        creds.validate(&shown)?;
        info!(hostname = %creds.hostname, mtls = creds.has_client_identity(), "Loaded authority credentials");
        Ok(creds)
    }

    fn validate(&self, path: &str) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Error::config(path, "hostname is required"));
        }
        if !self.key_password.is_empty() {
            return Err(Error::config(
                path,
                "keyPassword is set but encrypted client keys are not supported; provide an unencrypted tls.key",
            ));
        }
        Ok(())
    }

    /// Whether both a client certificate and key are available
    pub fn has_client_identity(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// Base URL of the authority (`https://` is assumed when no scheme is given)
    pub fn base_url(&self) -> String {
        let host = self.hostname.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    }
}

fn readable(path: PathBuf) -> Option<PathBuf> {
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_file() => {
            info!(path = %path.display(), bytes = meta.len(), "Found client TLS material");
            Some(path)
        }
        Ok(_) => {
            warn!(path = %path.display(), "Client TLS path is not a file");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Client TLS material not readable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_creds(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn loads_credentials_without_client_dir() {
        let file = write_creds(
            "hostname: ejbca.example.com\nejbcaUsername: est-user\nejbcaPassword: hunter2\n",
        );
        let creds = AuthorityCredentials::load_with_client_dir(file.path(), None).unwrap();
        assert_eq!(creds.hostname, "ejbca.example.com");
        assert_eq!(creds.username, "est-user");
        assert_eq!(creds.password, "hunter2");
        assert!(!creds.has_client_identity());
    }

    #[test]
    fn resolves_client_tls_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tls.crt"), "cert").unwrap();
        std::fs::write(dir.path().join("tls.key"), "key").unwrap();

        let file = write_creds("hostname: ejbca.example.com\n");
        let creds =
            AuthorityCredentials::load_with_client_dir(file.path(), Some(dir.path())).unwrap();
        assert_eq!(creds.client_cert_path, Some(dir.path().join("tls.crt")));
        assert_eq!(creds.client_key_path, Some(dir.path().join("tls.key")));
        assert!(creds.has_client_identity());
    }

    #[test]
    fn missing_client_files_are_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tls.crt"), "cert").unwrap();

        let file = write_creds("hostname: ejbca.example.com\n");
        let creds =
            AuthorityCredentials::load_with_client_dir(file.path(), Some(dir.path())).unwrap();
        assert!(creds.client_cert_path.is_some());
        assert!(creds.client_key_path.is_none());
        assert!(!creds.has_client_identity());
    }

    #[test]
    fn encrypted_key_is_rejected() {
        let file = write_creds("hostname: ejbca.example.com\nkeyPassword: secret\n");
        let err = AuthorityCredentials::load_with_client_dir(file.path(), None).unwrap_err();
        assert!(err.to_string().contains("keyPassword"));
    }

    #[test]
    fn empty_file_is_rejected() {
        let file = write_creds("");
        let err = AuthorityCredentials::load_with_client_dir(file.path(), None).unwrap_err();
        assert!(err.to_string().contains("ejbca-credentials"));
    }

    #[test]
    fn base_url_adds_scheme() {
        let creds = AuthorityCredentials {
            hostname: "ejbca.example.com:8443/".to_string(),
            ..Default::default()
        };
        assert_eq!(creds.base_url(), "https://ejbca.example.com:8443");

        let creds = AuthorityCredentials {
            hostname: "http://localhost:8080".to_string(),
            ..Default::default()
        };
        assert_eq!(creds.base_url(), "http://localhost:8080");
    }

    #[test]
    fn debug_hides_secrets() {
        let creds = AuthorityCredentials {
            hostname: "h".to_string(),
            password: "topsecret".to_string(),
            ..Default::default()
        };
        assert!(!format!("{creds:?}").contains("topsecret"));
    }
}
