//! The configured authority capability
//!
//! Exactly one enrollment protocol is chosen when the process starts. Requests
//! cannot switch protocol, whatever their annotations say.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use csr_signer_common::{AuthorityCredentials, Result, SignerConfig};

use crate::est::{EstEnrollment, EstHttpClient};
use crate::request::ParsedRequest;
use crate::rest::{EjbcaRestClient, EnrollmentDefaults, RestEnrollment};

/// Enrollment protocol selected at startup
#[derive(Clone)]
pub enum AuthorityClient {
    /// EJBCA REST PKCS#10 enrollment
    Rest(RestEnrollment),
    /// EST simpleenroll + cacerts
    Est(EstEnrollment),
}

impl AuthorityClient {
    /// Build the HTTP-backed capability selected by `config.use_est`
    pub fn from_config(config: &SignerConfig, credentials: &AuthorityCredentials) -> Result<Self> {
        let client = if config.use_est {
            Self::Est(EstEnrollment::new(
                Arc::new(EstHttpClient::new(credentials)?),
                config.default_est_alias.clone(),
            ))
        } else {
            Self::Rest(RestEnrollment::new(
                Arc::new(EjbcaRestClient::new(credentials)?),
                EnrollmentDefaults::from(config),
            ))
        };
        info!(
            protocol = client.protocol(),
            hostname = %credentials.hostname,
            "Created authority client"
        );
        Ok(client)
    }

    /// Protocol name for logging
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Rest(_) => "rest",
            Self::Est(_) => "est",
        }
    }

    /// Enroll a request, returning the PEM chain with the leaf first
    ///
    /// No retry happens here; a failure is returned to the caller as is.
    pub async fn enroll(
        &self,
        request: &ParsedRequest,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Vec<u8>> {
        match self {
            Self::Rest(rest) => rest.enroll(request, annotations).await,
            Self::Est(est) => est.enroll(request, annotations).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::est::MockEstApi;
    use crate::rest::{EnrollmentResponse, MockPkcs10Enroller};
    use csr_signer_common::{CERTIFICATE_PROFILE_ANNOTATION, EST_ALIAS_ANNOTATION};

    fn request() -> ParsedRequest {
        ParsedRequest {
            pem: "pem".to_string(),
            der: vec![0x30, 0x00],
            subject: "CN=web".to_string(),
            common_name: Some("web".to_string()),
        }
    }

    #[tokio::test]
    async fn est_client_never_calls_rest() {
        let mut est = MockEstApi::new();
        est.expect_simple_enroll()
            .times(1)
            .returning(|_, _| Ok(vec![vec![0x01]]));
        est.expect_ca_certs().times(1).returning(|_| Ok(vec![]));

        let client = AuthorityClient::Est(EstEnrollment::new(Arc::new(est), ""));
        // REST-only annotations change nothing
        let annotations =
            BTreeMap::from([(CERTIFICATE_PROFILE_ANNOTATION.to_string(), "foo".to_string())]);
        client
            .enroll(&request(), &annotations)
            .await
            .expect("enrollment should succeed");
        assert_eq!(client.protocol(), "est");
    }

    #[tokio::test]
    async fn rest_client_never_calls_est() {
        let mut rest = MockPkcs10Enroller::new();
        rest.expect_enroll_pkcs10().times(1).returning(|_| {
            Ok(EnrollmentResponse {
                certificate: "MAA=".to_string(),
                certificate_chain: vec![],
            })
        });

        let client = AuthorityClient::Rest(RestEnrollment::new(
            Arc::new(rest),
            EnrollmentDefaults::default(),
        ));
        let annotations = BTreeMap::from([(EST_ALIAS_ANNOTATION.to_string(), "iot".to_string())]);
        let chain = client
            .enroll(&request(), &annotations)
            .await
            .expect("enrollment should succeed");
        assert!(!chain.is_empty());
        assert_eq!(client.protocol(), "rest");
    }

    #[test]
    fn from_config_selects_protocol() {
        let credentials = AuthorityCredentials {
            hostname: "ejbca.example.com".to_string(),
            ..Default::default()
        };
        let rest = AuthorityClient::from_config(&SignerConfig::default(), &credentials)
            .expect("REST client should build");
        assert_eq!(rest.protocol(), "rest");

        let config = SignerConfig {
            use_est: true,
            ..Default::default()
        };
        let est =
            AuthorityClient::from_config(&config, &credentials).expect("EST client should build");
        assert_eq!(est.protocol(), "est");
    }
}
