//! Signing handler: approval gate, enrollment, status write

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::ByteString;
use tracing::{debug, info, trace, warn, Instrument, Span};

use csr_signer_authority::{parse_request, AuthorityClient};
use csr_signer_common::{Error, Result};

use crate::approval::{approval_state, ApprovalState};
use crate::status::CsrStatusWriter;

/// What the handler did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Not eligible for enrollment; nothing was done
    NotApproved,
    /// Enrolled and the certificate chain was written to status
    Signed,
}

/// Processes an owned snapshot of a request that has no certificate yet
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CsrHandler: Send + Sync {
    /// Handle one request
    async fn handle(&self, csr: CertificateSigningRequest) -> Result<HandleOutcome>;
}

/// Enrolls approved requests with the configured authority
pub struct SigningHandler {
    authority: AuthorityClient,
    status: Arc<dyn CsrStatusWriter>,
    span: Span,
}

impl SigningHandler {
    /// Create a handler; `span` scopes every log line it emits
    pub fn new(authority: AuthorityClient, status: Arc<dyn CsrStatusWriter>, span: Span) -> Self {
        Self {
            authority,
            status,
            span,
        }
    }

    async fn sign(&self, mut csr: CertificateSigningRequest) -> Result<HandleOutcome> {
        let name = csr.metadata.name.clone().unwrap_or_default();

        match approval_state(&csr) {
            ApprovalState::Approved => {}
            ApprovalState::Conflicting => {
                warn!(csr = %name, "Certificate request is both approved and denied; treating as denied");
                return Ok(HandleOutcome::NotApproved);
            }
            ApprovalState::Pending | ApprovalState::Denied => {
                warn!(csr = %name, "Certificate request is not approved");
                return Ok(HandleOutcome::NotApproved);
            }
        }

        let usages = csr.spec.usages.clone().unwrap_or_default();
        info!(csr = %name, signer_name = %csr.spec.signer_name, ?usages, "Request certificate");

        let request = parse_request(&name, &csr.spec.request.0)?;
        trace!(csr = %name, subject = %request.subject, "Request certificate subject");

        let no_annotations = BTreeMap::new();
        let annotations = csr.metadata.annotations.as_ref().unwrap_or(&no_annotations);
        debug!(csr = %name, protocol = self.authority.protocol(), "Enrolling certificate request");
        let chain = self.authority.enroll(&request, annotations).await?;
        if chain.is_empty() {
            return Err(Error::encoding(format!(
                "authority returned an empty certificate chain for {name}"
            )));
        }

        csr.status.get_or_insert_with(Default::default).certificate = Some(ByteString(chain));

        let status = self.status.update_status(&csr).await?;

        let conditions: Vec<&str> = status
            .conditions
            .iter()
            .flatten()
            .map(|c| c.type_.as_str())
            .collect();
        info!(
            csr = %name,
            ?conditions,
            certificate_bytes = status.certificate.as_ref().map_or(0, |c| c.0.len()),
            "Successfully enrolled CSR"
        );
        Ok(HandleOutcome::Signed)
    }
}

#[async_trait]
impl CsrHandler for SigningHandler {
    async fn handle(&self, csr: CertificateSigningRequest) -> Result<HandleOutcome> {
        self.sign(csr).instrument(self.span.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MockCsrStatusWriter;
    use csr_signer_authority::{
        EnrollmentDefaults, EnrollmentResponse, Pkcs10Enrollment, Pkcs10Enroller, RestEnrollment,
    };
    use csr_signer_common::CERTIFICATE_PROFILE_ANNOTATION;
    use k8s_openapi::api::certificates::v1::{
        CertificateSigningRequestCondition, CertificateSigningRequestSpec,
        CertificateSigningRequestStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
    use std::sync::Mutex;

    /// Enroller recording every enrollment it receives
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Pkcs10Enrollment>>,
        fail: bool,
    }

    #[async_trait]
    impl Pkcs10Enroller for Recorder {
        async fn enroll_pkcs10(&self, enrollment: &Pkcs10Enrollment) -> Result<EnrollmentResponse> {
            self.calls.lock().unwrap().push(enrollment.clone());
            if self.fail {
                return Err(Error::authority("connection refused"));
            }
            Ok(EnrollmentResponse {
                certificate: "MAMCAQE=".to_string(),
                certificate_chain: vec!["MAMCAQI=".to_string()],
            })
        }
    }

    fn csr_pem() -> Vec<u8> {
        let key_pair = KeyPair::generate().expect("key generation should succeed");
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String("web".to_string()));
        params.distinguished_name = dn;
        params
            .serialize_request(&key_pair)
            .expect("CSR generation should succeed")
            .pem()
            .expect("CSR serialization should succeed")
            .into_bytes()
    }

    fn csr(conditions: &[&str], annotations: &[(&str, &str)]) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                resource_version: Some("7".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(csr_pem()),
                signer_name: "example.com/ejbca".to_string(),
                usages: Some(vec!["server auth".to_string()]),
                ..Default::default()
            },
            status: Some(CertificateSigningRequestStatus {
                conditions: Some(
                    conditions
                        .iter()
                        .map(|t| CertificateSigningRequestCondition {
                            type_: t.to_string(),
                            status: "True".to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    fn handler(enroller: Arc<Recorder>, status: MockCsrStatusWriter) -> SigningHandler {
        let authority = AuthorityClient::Rest(RestEnrollment::new(
            enroller,
            EnrollmentDefaults {
                certificate_profile_name: "default".to_string(),
                ..Default::default()
            },
        ));
        SigningHandler::new(authority, Arc::new(status), Span::none())
    }

    // =========================================================================
    // Approval gating
    // =========================================================================

    #[tokio::test]
    async fn unapproved_requests_make_no_calls() {
        for conditions in [&[][..], &["Denied"][..], &["Approved", "Denied"][..]] {
            let enroller = Arc::new(Recorder::default());
            let mut status = MockCsrStatusWriter::new();
            status.expect_update_status().never();

            let outcome = handler(enroller.clone(), status)
                .handle(csr(conditions, &[]))
                .await
                .expect("not approved is not an error");
            assert_eq!(outcome, HandleOutcome::NotApproved);
            assert!(enroller.calls.lock().unwrap().is_empty());
        }
    }

    // =========================================================================
    // Enrollment
    // =========================================================================

    #[tokio::test]
    async fn approved_request_is_enrolled_with_annotation_profile() {
        let enroller = Arc::new(Recorder::default());
        let mut status = MockCsrStatusWriter::new();
        status
            .expect_update_status()
            .withf(|csr| {
                let cert = csr.status.as_ref().and_then(|s| s.certificate.as_ref());
                cert.is_some_and(|c| {
                    pem::parse_many(&c.0).map(|blocks| blocks.len()).unwrap_or(0) == 2
                })
            })
            .times(1)
            .returning(|csr| Ok(csr.status.clone().unwrap_or_default()));

        let outcome = handler(enroller.clone(), status)
            .handle(csr(&["Approved"], &[(CERTIFICATE_PROFILE_ANNOTATION, "foo")]))
            .await
            .expect("signing should succeed");

        assert_eq!(outcome, HandleOutcome::Signed);
        let calls = enroller.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].certificate_profile_name, "foo");
        assert_eq!(calls[0].username, "web");
    }

    #[tokio::test]
    async fn authority_failure_skips_status_write() {
        let enroller = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let mut status = MockCsrStatusWriter::new();
        status.expect_update_status().never();

        let err = handler(enroller, status)
            .handle(csr(&["Approved"], &[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
        assert!(!err.is_ignorable());
    }

    #[tokio::test]
    async fn malformed_request_is_ignorable() {
        let enroller = Arc::new(Recorder::default());
        let mut status = MockCsrStatusWriter::new();
        status.expect_update_status().never();

        let mut request = csr(&["Approved"], &[]);
        request.spec.request = ByteString(b"garbage".to_vec());
        let err = handler(enroller.clone(), status)
            .handle(request)
            .await
            .unwrap_err();
        assert!(err.is_ignorable());
        assert!(enroller.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_conflict_propagates() {
        use kube::core::ErrorResponse;

        let enroller = Arc::new(Recorder::default());
        let mut status = MockCsrStatusWriter::new();
        status.expect_update_status().times(1).returning(|_| {
            Err(Error::from(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            })))
        });

        let err = handler(enroller, status)
            .handle(csr(&["Approved"], &[]))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
