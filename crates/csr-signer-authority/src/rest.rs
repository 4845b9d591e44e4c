//! EJBCA REST enrollment
//!
//! The request is submitted as a PKCS#10 enrollment for a one-time end entity.
//! The end entity is never authenticated again, so its password is random and
//! discarded.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use csr_signer_common::{
    AuthorityCredentials, Error, Result, SignerConfig, CERTIFICATE_AUTHORITY_ANNOTATION,
    CERTIFICATE_PROFILE_ANNOTATION, END_ENTITY_PROFILE_ANNOTATION,
};

use crate::request::{pem_chain, ParsedRequest};

/// Path of the PKCS#10 enrollment endpoint
pub const PKCS10_ENROLL_PATH: &str = "/ejbca/ejbca-rest-api/v1/certificate/pkcs10enroll";

const PASSWORD_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const PASSWORD_LENGTH: usize = 10;

/// Body of a PKCS#10 enrollment request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pkcs10Enrollment {
    /// PEM-encoded PKCS#10 request
    pub certificate_request: String,
    /// Certificate profile to issue under
    pub certificate_profile_name: String,
    /// End entity profile to register under
    pub end_entity_profile_name: String,
    /// Issuing CA
    pub certificate_authority_name: String,
    /// One-time end entity username
    pub username: String,
    /// One-time end entity password
    pub password: String,
    /// Return the issuing chain with the certificate
    pub include_chain: bool,
}

/// Certificate and chain returned by a successful enrollment
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EnrollmentResponse {
    /// Base64 DER of the issued certificate
    pub certificate: String,
    /// Base64 DER of the issuing chain, nearest issuer first
    #[serde(default)]
    pub certificate_chain: Vec<String>,
}

/// Submits PKCS#10 enrollments to the authority
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Pkcs10Enroller: Send + Sync {
    /// Enroll a request and return the issued certificate
    async fn enroll_pkcs10(&self, enrollment: &Pkcs10Enrollment) -> Result<EnrollmentResponse>;
}

/// Profile and CA names used when a request carries no override annotation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollmentDefaults {
    /// Default certificate profile
    pub certificate_profile_name: String,
    /// Default end entity profile
    pub end_entity_profile_name: String,
    /// Default issuing CA
    pub certificate_authority_name: String,
}

impl From<&SignerConfig> for EnrollmentDefaults {
    fn from(config: &SignerConfig) -> Self {
        Self {
            certificate_profile_name: config.default_certificate_profile_name.clone(),
            end_entity_profile_name: config.default_end_entity_profile_name.clone(),
            certificate_authority_name: config.default_certificate_authority_name.clone(),
        }
    }
}

/// REST enrollment capability
#[derive(Clone)]
pub struct RestEnrollment {
    api: Arc<dyn Pkcs10Enroller>,
    defaults: EnrollmentDefaults,
}

impl RestEnrollment {
    /// Create the capability around an enrollment API
    pub fn new(api: Arc<dyn Pkcs10Enroller>, defaults: EnrollmentDefaults) -> Self {
        Self { api, defaults }
    }

    /// Build the enrollment body for a request, applying annotation overrides
    pub fn enrollment_for(
        &self,
        request: &ParsedRequest,
        annotations: &BTreeMap<String, String>,
    ) -> Pkcs10Enrollment {
        let pick = |annotation: &str, default: &str| match annotations.get(annotation) {
            Some(value) => {
                trace!(annotation, value = %value, "Using annotation override");
                value.clone()
            }
            None => default.to_string(),
        };

        let username = match &request.common_name {
            Some(cn) if !cn.is_empty() => cn.clone(),
            _ => format!("csr-{}", random_string(PASSWORD_LENGTH)),
        };

        Pkcs10Enrollment {
            certificate_request: request.pem.clone(),
            certificate_profile_name: pick(
                CERTIFICATE_PROFILE_ANNOTATION,
                &self.defaults.certificate_profile_name,
            ),
            end_entity_profile_name: pick(
                END_ENTITY_PROFILE_ANNOTATION,
                &self.defaults.end_entity_profile_name,
            ),
            certificate_authority_name: pick(
                CERTIFICATE_AUTHORITY_ANNOTATION,
                &self.defaults.certificate_authority_name,
            ),
            username,
            password: random_string(PASSWORD_LENGTH),
            include_chain: true,
        }
    }

    /// Enroll a request and return the PEM chain, leaf first
    pub async fn enroll(
        &self,
        request: &ParsedRequest,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>> {
        debug!("Enrolling CSR with REST client");
        let enrollment = self.enrollment_for(request, annotations);
        let response = self.api.enroll_pkcs10(&enrollment).await?;

        let mut certs = Vec::with_capacity(1 + response.certificate_chain.len());
        certs.push(decode_certificate(&response.certificate)?);
        for entry in &response.certificate_chain {
            certs.push(decode_certificate(entry)?);
        }
        Ok(pem_chain(certs.iter().map(Vec::as_slice)))
    }
}

fn decode_certificate(b64: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(b64.trim())
        .map_err(|e| Error::encoding(format!("invalid base64 certificate: {e}")))
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())]))
        .collect()
}

/// `Pkcs10Enroller` speaking the EJBCA REST API over mutual TLS
pub struct EjbcaRestClient {
    http: reqwest::Client,
    url: String,
}

impl EjbcaRestClient {
    /// Build a client for the authority described by `credentials`
    pub fn new(credentials: &AuthorityCredentials) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let (Some(cert), Some(key)) = (
            &credentials.client_cert_path,
            &credentials.client_key_path,
        ) {
            builder = builder.identity(load_identity(cert, key)?);
        }
        let http = builder
            .build()
            .map_err(|e| Error::authority(format!("failed to build REST client: {e}")))?;

        Ok(Self {
            http,
            url: format!("{}{PKCS10_ENROLL_PATH}", credentials.base_url()),
        })
    }
}

/// Load a client identity from a PEM certificate and unencrypted PEM key
pub(crate) fn load_identity(cert: &Path, key: &Path) -> Result<reqwest::Identity> {
    let read = |path: &Path| {
        std::fs::read(path)
            .map_err(|e| Error::config(path.display().to_string(), format!("unreadable: {e}")))
    };
    let mut pem = read(cert)?;
    pem.push(b'\n');
    pem.extend(read(key)?);
    reqwest::Identity::from_pem(&pem).map_err(|e| {
        Error::config(
            cert.display().to_string(),
            format!("invalid client certificate or key: {e}"),
        )
    })
}

#[async_trait]
impl Pkcs10Enroller for EjbcaRestClient {
    async fn enroll_pkcs10(&self, enrollment: &Pkcs10Enrollment) -> Result<EnrollmentResponse> {
        let response = self
            .http
            .post(&self.url)
            .json(enrollment)
            .send()
            .await
            .map_err(|e| Error::authority(format!("PKCS#10 enrollment request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::authority_rejected(status.as_u16(), body));
        }

        response
            .json::<EnrollmentResponse>()
            .await
            .map_err(|e| Error::authority(format!("invalid enrollment response: {e}")))
    }
}
