//! EST (RFC 7030) enrollment

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use csr_signer_common::{AuthorityCredentials, Error, Result, EST_ALIAS_ANNOTATION};

use crate::pkcs7;
use crate::request::{pem_chain, ParsedRequest};
use crate::rest::load_identity;

/// Well-known EST path prefix
pub const EST_PATH_PREFIX: &str = "/.well-known/est";

/// EST operations used for enrollment
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EstApi: Send + Sync {
    /// `simpleenroll`: submit a base64 DER PKCS#10 request, returning the
    /// issued certificate(s) as DER
    async fn simple_enroll(&self, alias: &str, csr_base64: &str) -> Result<Vec<Vec<u8>>>;

    /// `cacerts`: fetch the current CA certificates as DER
    async fn ca_certs(&self, alias: &str) -> Result<Vec<Vec<u8>>>;
}

/// EST enrollment capability
#[derive(Clone)]
pub struct EstEnrollment {
    api: Arc<dyn EstApi>,
    default_alias: String,
}

impl EstEnrollment {
    /// Create the capability; `default_alias` applies when a request has no
    /// `estAlias` annotation
    pub fn new(api: Arc<dyn EstApi>, default_alias: impl Into<String>) -> Self {
        Self {
            api,
            default_alias: default_alias.into(),
        }
    }

    /// Alias a request will be enrolled under
    pub fn alias_for<'a>(&'a self, annotations: &'a BTreeMap<String, String>) -> &'a str {
        annotations
            .get(EST_ALIAS_ANNOTATION)
            .map(String::as_str)
            .unwrap_or(&self.default_alias)
    }

    /// Enroll a request and return the PEM chain, leaf certificates first
    pub async fn enroll(
        &self,
        request: &ParsedRequest,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>> {
        let alias = self.alias_for(annotations);
        debug!(alias, "Enrolling CSR with EST client");

        let leaf = self
            .api
            .simple_enroll(alias, &STANDARD.encode(&request.der))
            .await?;
        let chain = self.api.ca_certs(alias).await?;

        Ok(pem_chain(leaf.iter().chain(chain.iter()).map(Vec::as_slice)))
    }
}

/// `EstApi` over HTTPS with basic authentication
pub struct EstHttpClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl EstHttpClient {
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
            .map_err(|e| Error::authority(format!("failed to build EST client: {e}")))?;

        Ok(Self {
            http,
            base_url: credentials.base_url(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        })
    }

    fn url(&self, alias: &str, operation: &str) -> String {
        if alias.is_empty() {
            format!("{}{EST_PATH_PREFIX}/{operation}", self.base_url)
        } else {
            format!("{}{EST_PATH_PREFIX}/{alias}/{operation}", self.base_url)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn certs_only(response: reqwest::Response, operation: &str) -> Result<Vec<Vec<u8>>> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::authority(format!("failed to read {operation} response: {e}")))?;
        if !status.is_success() {
            return Err(Error::authority_rejected(status.as_u16(), body));
        }

        let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let der = STANDARD
            .decode(compact)
            .map_err(|e| Error::encoding(format!("invalid base64 {operation} response: {e}")))?;
        pkcs7::certificates(&der)
    }
}

#[async_trait]
impl EstApi for EstHttpClient {
    async fn simple_enroll(&self, alias: &str, csr_base64: &str) -> Result<Vec<Vec<u8>>> {
        let request = self
            .http
            .post(self.url(alias, "simpleenroll"))
            .header(reqwest::header::CONTENT_TYPE, "application/pkcs10")
            .header("Content-Transfer-Encoding", "base64")
            .body(csr_base64.to_string());
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::authority(format!("simpleenroll request failed: {e}")))?;
        Self::certs_only(response, "simpleenroll").await
    }

    async fn ca_certs(&self, alias: &str) -> Result<Vec<Vec<u8>>> {
        let response = self
            .http
            .get(self.url(alias, "cacerts"))
            .send()
            .await
            .map_err(|e| Error::authority(format!("cacerts request failed: {e}")))?;
        Self::certs_only(response, "cacerts").await
    }
}
