//! Common types for the CSR signer: errors, configuration, and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod telemetry;

pub use config::SignerConfig;
pub use credentials::AuthorityCredentials;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Controller name used when `SERVICE_NAME` is not set
pub const DEFAULT_SERVICE_NAME: &str = "ejbca-csr-signer";

/// Annotation overriding the certificate profile for REST enrollment
pub const CERTIFICATE_PROFILE_ANNOTATION: &str = "certificateProfileName";

/// Annotation overriding the end entity profile for REST enrollment
pub const END_ENTITY_PROFILE_ANNOTATION: &str = "endEntityProfileName";

/// Annotation overriding the issuing certificate authority for REST enrollment
pub const CERTIFICATE_AUTHORITY_ANNOTATION: &str = "certificateAuthorityName";

/// Annotation selecting the EST alias (empty selects the authority's default CA)
pub const EST_ALIAS_ANNOTATION: &str = "estAlias";
