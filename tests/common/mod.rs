#![allow(dead_code)]

use chrono::{DateTime, TimeDelta, Utc};
use crl_rewriter::{
    crl::{CrlBuilder, CrlReason, CrlStreamWriter, CrlSummary, RevokedEntry, verify_signature},
    crypto::{RsaKeySize, RsaPrivateKey},
    telemetry,
};
use num_bigint::BigInt;

pub const ISSUER: &str = "Test Issuer";

pub fn generate_key(size: RsaKeySize) -> RsaPrivateKey {
    telemetry::init_tracing();
    RsaPrivateKey::generate(size).expect("failed to generate key")
}

/// A key of any modulus size, loaded the way a CA key file would be
pub fn key_with_bits(bits: u32) -> RsaPrivateKey {
    telemetry::init_tracing();
    let rsa = openssl::rsa::Rsa::generate(bits).expect("failed to generate key");
    let pem = openssl::pkey::PKey::from_rsa(rsa)
        .and_then(|key| key.private_key_to_pem_pkcs8())
        .expect("failed to encode key");
    RsaPrivateKey::from_pem(pem).expect("failed to load key")
}

/// thisUpdate of the fixtures, far enough back that a rewrite moves it
pub fn an_hour_ago() -> DateTime<Utc> {
    Utc::now() - TimeDelta::hours(1)
}

/// The usual fixture: a v2 CRL with CRL number 127, an AKI and serial 100
/// revoked
pub fn fixture_builder() -> CrlBuilder {
    let this_update = an_hour_ago();
    CrlBuilder::with_common_name(ISSUER)
        .this_update(this_update)
        .next_update(this_update + TimeDelta::days(1))
        .crl_number(127)
        .authority_key_identifier()
        .entry(RevokedEntry::new(
            100,
            this_update,
            Some(CrlReason::PrivilegeWithdrawn),
        ))
}

pub fn fixture_crl(key: &RsaPrivateKey) -> Vec<u8> {
    fixture_builder().build(key).expect("failed to build CRL")
}

/// Pre-scan, lock and write in one go
pub fn finish(writer: &mut CrlStreamWriter<&[u8]>) -> Vec<u8> {
    writer.pre_scan().unwrap().lock().unwrap();
    let mut out = Vec::new();
    writer.write(&mut out).expect("failed to write CRL");
    out
}

/// Decode a CRL after checking that `key` signed it
pub fn verified(der: &[u8], key: &RsaPrivateKey) -> CrlSummary {
    assert!(
        verify_signature(der, &key.public_key().unwrap()).unwrap(),
        "signature does not verify"
    );
    CrlSummary::from_der(der).expect("output is not a valid CRL")
}

pub fn sorted_serials(summary: &CrlSummary) -> Vec<BigInt> {
    let mut serials = summary.serials();
    serials.sort();
    serials
}

pub fn big(values: &[i64]) -> Vec<BigInt> {
    let mut serials: Vec<BigInt> = values.iter().map(|v| BigInt::from(*v)).collect();
    serials.sort();
    serials
}
