//! PKCS#10 request parsing and PEM chain assembly

use pem::{EncodeConfig, LineEnding, Pem};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

use csr_signer_common::{Error, Result};

const CERTIFICATE_REQUEST_TAGS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// A decoded certificate signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    /// The request exactly as submitted (PEM text)
    pub pem: String,
    /// DER bytes of the PKCS#10 structure
    pub der: Vec<u8>,
    /// Subject distinguished name in RFC 4514 form
    pub subject: String,
    /// First common name of the subject, if any
    pub common_name: Option<String>,
}

/// Decode the PEM-encoded PKCS#10 request of the named CertificateSigningRequest
///
/// Failures are caused by what the requester submitted, so they are returned
/// as ignorable errors.
pub fn parse_request(csr_name: &str, request: &[u8]) -> Result<ParsedRequest> {
    let block = pem::parse(request).map_err(|e| {
        Error::invalid_request(csr_name, format!("failed to decode PEM: {e}")).ignorable()
    })?;

    if !CERTIFICATE_REQUEST_TAGS.contains(&block.tag()) {
        return Err(Error::invalid_request(
            csr_name,
            format!("unexpected PEM block type {:?}", block.tag()),
        )
        .ignorable());
    }

    let der = block.contents().to_vec();
    let (_, parsed) = X509CertificationRequest::from_der(&der).map_err(|e| {
        Error::invalid_request(csr_name, format!("failed to parse PKCS#10: {e}")).ignorable()
    })?;

    let subject = &parsed.certification_request_info.subject;
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    Ok(ParsedRequest {
        pem: String::from_utf8_lossy(request).into_owned(),
        subject: subject.to_string(),
        common_name,
        der,
    })
}

/// Concatenate DER certificates as `CERTIFICATE` PEM blocks, preserving order
pub fn pem_chain<'a>(certificates: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    certificates
        .into_iter()
        .flat_map(|der| {
            let block = Pem::new("CERTIFICATE", der.to_vec());
            pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
                .into_bytes()
        })
        .collect()
}
