//! Rewriting of the `crlExtensions` block.
//!
//! The CRL number is incremented and the authority key identifier is
//! re-derived from the signing key. Every other extension is carried over
//! byte for byte.

use num_bigint::BigInt;
use tracing::debug;

use super::der::{self, encode_constructed, encode_sequence, encode_tlv, expect_tlv, parse_tlv, tag};
use super::errors::{CrlError, CrlResult};

/// id-ce-cRLNumber (2.5.29.20)
pub const OID_CRL_NUMBER: &[u8] = &[0x55, 0x1D, 0x14];
/// id-ce-authorityKeyIdentifier (2.5.29.35)
pub const OID_AUTHORITY_KEY_IDENTIFIER: &[u8] = &[0x55, 0x1D, 0x23];

/// `[0]` IMPLICIT `keyIdentifier` inside `AuthorityKeyIdentifier`
const KEY_IDENTIFIER_TAG: u8 = 0x80;

/// Result of rewriting the extensions of a CRL
#[derive(Debug, Clone)]
pub struct UpdatedExtensions {
    /// Complete `[0] EXPLICIT Extensions` element
    pub encoded: Vec<u8>,
    /// CRL number after the increment, when the CRL carries one
    pub crl_number: Option<BigInt>,
}

/// Encode one `Extension`, leaving out `critical` when it is the default
pub fn encode_extension(oid: &[u8], critical: bool, value: &[u8]) -> Vec<u8> {
    let oid = encode_tlv(tag::OID, oid);
    let value = encode_tlv(tag::OCTET_STRING, value);
    if critical {
        encode_sequence(&[&oid, &encode_tlv(tag::BOOLEAN, &[0xFF]), &value])
    } else {
        encode_sequence(&[&oid, &value])
    }
}

/// extnValue of a CRL number extension
pub fn crl_number_value(number: &BigInt) -> Vec<u8> {
    der::encode_integer(number)
}

/// extnValue of an authority key identifier carrying only `keyIdentifier`
pub fn authority_key_identifier_value(key_id: &[u8]) -> Vec<u8> {
    encode_sequence(&[&encode_tlv(KEY_IDENTIFIER_TAG, key_id)])
}

/// Wrap extensions in `[0] EXPLICIT SEQUENCE OF`
pub fn encode_extensions(extensions: &[Vec<u8>]) -> Vec<u8> {
    let parts: Vec<&[u8]> = extensions.iter().map(Vec::as_slice).collect();
    encode_constructed(tag::CONTEXT_0, &[&encode_sequence(&parts)])
}

struct Extension<'a> {
    raw: &'a [u8],
    oid: &'a [u8],
    critical: bool,
    value: &'a [u8],
}

fn parse_extension(data: &[u8]) -> CrlResult<(Extension<'_>, &[u8])> {
    let (body, rest) = expect_tlv(data, tag::SEQUENCE, "Extension")?;
    let raw = &data[..data.len() - rest.len()];

    let (oid, body) = expect_tlv(body, tag::OID, "extnID")?;
    let (header, content, after) = parse_tlv(body)?;
    let (critical, body) = if header.tag == tag::BOOLEAN {
        (content.first().is_some_and(|b| *b != 0), after)
    } else {
        (false, body)
    };
    let (value, trailing) = expect_tlv(body, tag::OCTET_STRING, "extnValue")?;
    if !trailing.is_empty() {
        return Err(CrlError::format("Trailing data in Extension"));
    }

    Ok((
        Extension {
            raw,
            oid,
            critical,
            value,
        },
        rest,
    ))
}

/// Rewrite the `[0]` extensions element of a CRL.
///
/// `key_id` is the identifier of the key that will sign the new CRL.
pub fn update_extensions(original: &[u8], key_id: &[u8]) -> CrlResult<UpdatedExtensions> {
    let (explicit, rest) = expect_tlv(original, tag::CONTEXT_0, "crlExtensions")?;
    if !rest.is_empty() {
        return Err(CrlError::format("Trailing data after crlExtensions"));
    }
    let (mut list, rest) = expect_tlv(explicit, tag::SEQUENCE, "Extensions")?;
    if !rest.is_empty() {
        return Err(CrlError::format("Trailing data inside crlExtensions"));
    }

    let mut extensions = Vec::new();
    let mut crl_number = None;

    while !list.is_empty() {
        let (extension, rest) = parse_extension(list)?;
        list = rest;

        if extension.oid == OID_CRL_NUMBER {
            let (current, _) = expect_tlv(extension.value, tag::INTEGER, "CRLNumber")?;
            let current = der::decode_integer(current)?;
            let next = &current + BigInt::from(1);
            debug!("CRL number {} -> {}", current, next);
            extensions.push(encode_extension(
                OID_CRL_NUMBER,
                extension.critical,
                &crl_number_value(&next),
            ));
            crl_number = Some(next);
        } else if extension.oid == OID_AUTHORITY_KEY_IDENTIFIER {
            extensions.push(encode_extension(
                OID_AUTHORITY_KEY_IDENTIFIER,
                extension.critical,
                &authority_key_identifier_value(key_id),
            ));
        } else {
            extensions.push(extension.raw.to_vec());
        }
    }

    Ok(UpdatedExtensions {
        encoded: encode_extensions(&extensions),
        crl_number,
    })
}
