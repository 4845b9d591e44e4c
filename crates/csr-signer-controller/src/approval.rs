//! Approval gate

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

const APPROVED: &str = "Approved";
const DENIED: &str = "Denied";

/// Approval decision recorded in a request's conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalState {
    /// Neither approved nor denied
    Pending,
    /// Approved and not denied
    Approved,
    /// Denied
    Denied,
    /// Both approved and denied; treated as denied
    Conflicting,
}

impl ApprovalState {
    /// Whether the request may be enrolled
    pub fn is_approved(self) -> bool {
        self == ApprovalState::Approved
    }
}

/// Read the approval decision from the request's conditions
///
/// Only the condition types are consulted.
pub fn approval_state(csr: &CertificateSigningRequest) -> ApprovalState {
    let conditions = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    let approved = conditions.iter().any(|c| c.type_ == APPROVED);
    let denied = conditions.iter().any(|c| c.type_ == DENIED);

    match (approved, denied) {
        (false, false) => ApprovalState::Pending,
        (true, false) => ApprovalState::Approved,
        (false, true) => ApprovalState::Denied,
        (true, true) => ApprovalState::Conflicting,
    }
}

/// True iff the request has an `Approved` condition and no `Denied` condition
pub fn is_certificate_request_approved(csr: &CertificateSigningRequest) -> bool {
    approval_state(csr).is_approved()
}
