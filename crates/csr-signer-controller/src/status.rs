//! Status subresource writes

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestStatus,
};
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;

use csr_signer_common::{Error, Result};

/// Writes a request's status back to the API server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CsrStatusWriter: Send + Sync {
    /// Submit `csr.status`, rejected if the object changed since `csr` was read
    async fn update_status(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequestStatus>;
}

/// Status writer backed by the certificates API
pub struct KubeStatusWriter {
    api: Api<CertificateSigningRequest>,
}

impl KubeStatusWriter {
    /// Create a writer for cluster-scoped CertificateSigningRequests
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

/// Merge patch carrying the snapshot's resource version for optimistic concurrency
pub fn status_patch(csr: &CertificateSigningRequest) -> serde_json::Value {
    json!({
        "metadata": { "resourceVersion": csr.metadata.resource_version },
        "status": csr.status,
    })
}

#[async_trait]
impl CsrStatusWriter for KubeStatusWriter {
    async fn update_status(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequestStatus> {
        let name = csr
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("status", "object has no name"))?;

        let updated = self
            .api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(status_patch(csr)))
            .await?;
        Ok(updated.status.unwrap_or_default())
    }
}
