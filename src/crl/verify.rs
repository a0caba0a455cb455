//! Checks on finished CRLs, done with libraries independent of the rewriter.

use chrono::{DateTime, Utc};
use num_bigint::{BigInt, Sign};
use openssl::x509::X509Crl;
use x509_parser::prelude::*;

use super::entry::{CrlReason, RevokedEntry};
use super::errors::{CrlError, CrlResult};
use crate::crypto::{self, RsaPublicKey, SignatureAlgorithm};

/// Verify the signature of a DER encoded CRL against `key`
pub fn verify_signature(der: &[u8], key: &RsaPublicKey) -> CrlResult<bool> {
    let crl = X509Crl::from_der(der).map_err(crypto::Error::from)?;
    Ok(crl.verify(key.pkey()).map_err(crypto::Error::from)?)
}

/// Decoded view of a CRL for display and assertions
#[derive(Debug, Clone)]
pub struct CrlSummary {
    /// 1 or 2
    pub version: u32,
    pub issuer: String,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub crl_number: Option<BigInt>,
    pub signature_algorithm: Option<SignatureAlgorithm>,
    pub entries: Vec<RevokedEntry>,
}

fn to_datetime(time: ASN1Time) -> CrlResult<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| CrlError::format(format!("Time {time} is out of range")))
}

impl CrlSummary {
    pub fn from_der(der: &[u8]) -> CrlResult<Self> {
        let (_, crl) = parse_x509_crl(der)
            .map_err(|e| CrlError::format(format!("Failed to parse CRL: {e}")))?;

        let entries = crl
            .iter_revoked_certificates()
            .map(|revoked| {
                let reason = revoked
                    .reason_code()
                    .map(|(_, code)| CrlReason::from(u32::from(code.0)));
                Ok(RevokedEntry::new(
                    BigInt::from_signed_bytes_be(revoked.raw_serial()),
                    to_datetime(revoked.revocation_date)?,
                    reason,
                ))
            })
            .collect::<CrlResult<Vec<_>>>()?;

        Ok(Self {
            version: crl.version().map_or(1, |v| v.0 + 1),
            issuer: crl.issuer().to_string(),
            this_update: to_datetime(crl.last_update())?,
            next_update: crl.next_update().map(to_datetime).transpose()?,
            crl_number: crl
                .crl_number()
                .map(|n| BigInt::from_bytes_be(Sign::Plus, &n.to_bytes_be())),
            signature_algorithm: SignatureAlgorithm::from_oid(
                crl.signature_algorithm.algorithm.as_bytes(),
            ),
            entries,
        })
    }

    /// Serial numbers in CRL order
    pub fn serials(&self) -> Vec<BigInt> {
        self.entries.iter().map(|e| e.serial().clone()).collect()
    }
}
