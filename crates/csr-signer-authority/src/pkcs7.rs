//! Certificate extraction from PKCS#7 certs-only responses
//!
//! EST returns `application/pkcs7-mime; smime-type=certs-only`: a ContentInfo
//! wrapping SignedData whose `certificates` field carries the certificates and
//! whose signer infos are empty. SignedData may be BER encoded, so elements are
//! read with the BER parser and indefinite lengths are accepted.

use x509_parser::der_parser::asn1_rs::{Any, Class, FromBer, Tag};

use csr_signer_common::{Error, Result};

const SIGNED_DATA_OID: &str = "1.2.840.113549.1.7.2";

fn next_element<'a>(input: &'a [u8], what: &str) -> Result<(Any<'a>, &'a [u8])> {
    let (rest, any) = Any::from_ber(input)
        .map_err(|e| Error::encoding(format!("malformed PKCS#7 {what}: {e}")))?;
    Ok((any, rest))
}

fn expect_element<'a>(
    input: &'a [u8],
    class: Class,
    tag: Tag,
    what: &str,
) -> Result<(Any<'a>, &'a [u8])> {
    let (any, rest) = next_element(input, what)?;
    any.header
        .assert_class(class)
        .and_then(|_| any.header.assert_tag(tag))
        .map_err(|e| Error::encoding(format!("unexpected PKCS#7 {what}: {e}")))?;
    Ok((any, rest))
}

/// Extract the certificates of a certs-only SignedData, in order
///
/// Each certificate is returned exactly as encoded in the structure.
pub fn certificates(ber: &[u8]) -> Result<Vec<Vec<u8>>> {
    let (content_info, _) = expect_element(ber, Class::Universal, Tag::Sequence, "ContentInfo")?;
    let (content_type, rest) =
        expect_element(content_info.data, Class::Universal, Tag::Oid, "content type")?;
    let oid = content_type
        .as_oid()
        .map_err(|e| Error::encoding(format!("malformed PKCS#7 content type: {e}")))?;
    if oid.to_id_string() != SIGNED_DATA_OID {
        return Err(Error::encoding(format!(
            "PKCS#7 content {oid} is not SignedData"
        )));
    }

    let (explicit, _) = expect_element(rest, Class::ContextSpecific, Tag(0), "content")?;
    let (signed_data, _) =
        expect_element(explicit.data, Class::Universal, Tag::Sequence, "SignedData")?;
    let (_, rest) = expect_element(signed_data.data, Class::Universal, Tag::Integer, "version")?;
    let (_, rest) = expect_element(rest, Class::Universal, Tag::Set, "digest algorithms")?;
    let (_, rest) = expect_element(rest, Class::Universal, Tag::Sequence, "encapsulated content")?;

    if rest.is_empty() {
        return Ok(Vec::new());
    }
    // certificates [0] IMPLICIT is optional; anything else means none were sent
    let (field, _) = next_element(rest, "certificates")?;
    if field.class() != Class::ContextSpecific || field.tag() != Tag(0) {
        return Ok(Vec::new());
    }

    let mut certs = Vec::new();
    let mut remaining = field.data;
    while !remaining.is_empty() {
        let (_, rest) = expect_element(remaining, Class::Universal, Tag::Sequence, "certificate")?;
        certs.push(remaining[..remaining.len() - rest.len()].to_vec());
        remaining = rest;
    }
    Ok(certs)
}
