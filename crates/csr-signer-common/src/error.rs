//! Error types for the CSR signer
//!
//! Errors carry enough context (object name, authority status, file path) to be
//! useful in a structured log line. Any error can additionally be marked
//! *ignorable*: it is still retried by the work queue, but it is logged at
//! informational level instead of being reported as an operator-visible error.
//! Ignorable errors are meant for failures caused by user input.

use std::time::Duration;

use thiserror::Error;

/// Main error type for signer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Configuration or credential file could not be loaded
    #[error("configuration error [{path}]: {message}")]
    Config {
        /// File the error relates to
        path: String,
        /// Description of what's wrong
        message: String,
    },

    /// The PKCS#10 request embedded in a CertificateSigningRequest is unusable
    #[error("invalid certificate request {csr}: {message}")]
    InvalidRequest {
        /// Name of the CertificateSigningRequest
        csr: String,
        /// Description of what's invalid
        message: String,
    },

    /// The certificate authority could not be reached or rejected the request
    #[error("authority error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Authority {
        /// HTTP status returned by the authority, if a response was received
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// A certificate returned by the authority could not be decoded
    #[error("encoding error: {message}")]
    Encoding {
        /// Description of what failed
        message: String,
    },

    /// A work queue key could not be resolved to an object reference
    #[error("invalid object key {key:?}")]
    InvalidKey {
        /// The offending key
        key: String,
    },

    /// The watch cache did not synchronize before the deadline
    #[error("timed out after {timeout:?} waiting for {cache} cache to sync")]
    CacheSyncTimeout {
        /// Name of the cache being waited on
        cache: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "watcher", "worker")
        context: String,
    },

    /// An error flagged for reduced-severity logging; still retried
    #[error(transparent)]
    Ignorable(Box<Error>),
}

impl Error {
    /// Create a configuration error for the given file
    pub fn config(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid request error for the named CertificateSigningRequest
    pub fn invalid_request(csr: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidRequest {
            csr: csr.into(),
            message: msg.into(),
        }
    }

    /// Create an authority error for a transport failure (no response received)
    pub fn authority(msg: impl Into<String>) -> Self {
        Self::Authority {
            status: None,
            message: msg.into(),
        }
    }

    /// Create an authority error for a rejected request
    pub fn authority_rejected(status: u16, msg: impl Into<String>) -> Self {
        Self::Authority {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Create an encoding error
    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::Encoding {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Flag this error as ignorable
    ///
    /// Marking an already ignorable error is a no-op.
    pub fn ignorable(self) -> Self {
        match self {
            Error::Ignorable(_) => self,
            other => Error::Ignorable(Box::new(other)),
        }
    }

    /// Whether this error only warrants informational logging
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::Ignorable(_))
    }

    /// Whether this is an optimistic-concurrency rejection from the API server
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            Error::Ignorable(inner) => inner.is_conflict(),
            _ => false,
        }
    }
}
