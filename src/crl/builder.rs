use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use tracing::debug;

use super::der::{encode_constructed, encode_sequence, encode_tlv, tag};
use super::entry::RevokedEntry;
use super::errors::CrlResult;
use super::extensions::{
    OID_AUTHORITY_KEY_IDENTIFIER, OID_CRL_NUMBER, authority_key_identifier_value,
    crl_number_value, encode_extension, encode_extensions,
};
use super::time::encode_time;
use crate::crypto::{CrlSigner, RsaPrivateKey, SignatureAlgorithm};

/// id-at-commonName (2.5.4.3)
const OID_COMMON_NAME: &[u8] = &[0x55, 0x04, 0x03];

/// Builds and signs a CRL from scratch
#[derive(Debug, Clone)]
pub struct CrlBuilder {
    issuer: Vec<u8>,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    entries: Vec<RevokedEntry>,
    crl_number: Option<BigInt>,
    authority_key_identifier: bool,
    algorithm: SignatureAlgorithm,
}

impl CrlBuilder {
    /// Start a CRL for the issuer given as a DER encoded `Name`
    pub fn new(issuer: impl Into<Vec<u8>>) -> Self {
        Self {
            issuer: issuer.into(),
            this_update: Utc::now(),
            next_update: None,
            entries: Vec::new(),
            crl_number: None,
            authority_key_identifier: false,
            algorithm: SignatureAlgorithm::Sha256WithRsa,
        }
    }

    /// Issuer named only by a common name
    pub fn with_common_name(common_name: &str) -> Self {
        Self::new(Self::common_name_der(common_name))
    }

    /// DER `Name` holding a single common name
    pub fn common_name_der(common_name: &str) -> Vec<u8> {
        let attribute = encode_sequence(&[
            &encode_tlv(tag::OID, OID_COMMON_NAME),
            &encode_tlv(tag::UTF8_STRING, common_name.as_bytes()),
        ]);
        let rdn = encode_constructed(tag::SET, &[&attribute]);
        encode_sequence(&[&rdn])
    }

    pub fn this_update(mut self, time: DateTime<Utc>) -> Self {
        self.this_update = time;
        self
    }

    pub fn next_update(mut self, time: DateTime<Utc>) -> Self {
        self.next_update = Some(time);
        self
    }

    pub fn entry(mut self, entry: RevokedEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn entries(mut self, entries: impl IntoIterator<Item = RevokedEntry>) -> Self {
        self.entries.extend(entries);
        self
    }

    pub fn crl_number(mut self, number: impl Into<BigInt>) -> Self {
        self.crl_number = Some(number.into());
        self
    }

    /// Include an authority key identifier derived from the signing key
    pub fn authority_key_identifier(mut self) -> Self {
        self.authority_key_identifier = true;
        self
    }

    pub fn signing_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Encode the CRL and sign it with `key`.
    ///
    /// Without extensions of any kind the CRL is emitted as v1.
    pub fn build(&self, key: &RsaPrivateKey) -> CrlResult<Vec<u8>> {
        let mut extensions = Vec::new();
        if self.authority_key_identifier {
            let key_id = key.public_key()?.key_identifier()?;
            extensions.push(encode_extension(
                OID_AUTHORITY_KEY_IDENTIFIER,
                false,
                &authority_key_identifier_value(&key_id),
            ));
        }
        if let Some(number) = &self.crl_number {
            extensions.push(encode_extension(
                OID_CRL_NUMBER,
                false,
                &crl_number_value(number),
            ));
        }

        let v2 = !extensions.is_empty() || self.entries.iter().any(|e| e.reason().is_some());
        let algorithm_identifier = self.algorithm.algorithm_identifier();

        let mut tbs_parts: Vec<Vec<u8>> = Vec::new();
        if v2 {
            tbs_parts.push(vec![0x02, 0x01, 0x01]);
        }
        tbs_parts.push(algorithm_identifier.clone());
        tbs_parts.push(self.issuer.clone());
        tbs_parts.push(encode_time(&self.this_update));
        if let Some(next_update) = &self.next_update {
            tbs_parts.push(encode_time(next_update));
        }
        if !self.entries.is_empty() {
            let entries: Vec<Vec<u8>> = self.entries.iter().map(RevokedEntry::to_der).collect();
            let entries: Vec<&[u8]> = entries.iter().map(Vec::as_slice).collect();
            tbs_parts.push(encode_sequence(&entries));
        }
        if !extensions.is_empty() {
            tbs_parts.push(encode_extensions(&extensions));
        }

        let tbs_parts: Vec<&[u8]> = tbs_parts.iter().map(Vec::as_slice).collect();
        let tbs = encode_sequence(&tbs_parts);

        let signer = CrlSigner::new(key.clone(), self.algorithm);
        let mut signature_value = vec![0x00];
        signature_value.extend_from_slice(&signer.sign(&tbs)?);

        debug!(
            "Built CRL with {} entries signed with {}",
            self.entries.len(),
            self.algorithm
        );

        Ok(encode_sequence(&[
            &tbs,
            &algorithm_identifier,
            &encode_tlv(tag::BIT_STRING, &signature_value),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crl::CrlReason;
    use crate::crl::verify::{CrlSummary, verify_signature};
    use crate::crypto::RsaKeySize;
    use chrono::TimeDelta;

    #[test]
    fn test_build_v2_crl() {
        let key = RsaPrivateKey::generate(RsaKeySize::Rsa2048).unwrap();
        let now = Utc::now();
        let der = CrlBuilder::with_common_name("Test Issuer")
            .this_update(now)
            .next_update(now + TimeDelta::days(1))
            .crl_number(127)
            .authority_key_identifier()
            .entry(RevokedEntry::new(
                100,
                now,
                Some(CrlReason::PrivilegeWithdrawn),
            ))
            .build(&key)
            .unwrap();

        assert!(verify_signature(&der, &key.public_key().unwrap()).unwrap());

        let summary = CrlSummary::from_der(&der).unwrap();
        assert_eq!(summary.version, 2);
        assert!(summary.issuer.contains("Test Issuer"));
        assert_eq!(summary.crl_number, Some(BigInt::from(127)));
        assert_eq!(summary.serials(), vec![BigInt::from(100)]);
        assert!(summary.next_update.is_some());
    }

    #[test]
    fn test_build_v1_crl_without_entries() {
        let key = RsaPrivateKey::generate(RsaKeySize::Rsa1024).unwrap();
        let der = CrlBuilder::with_common_name("Plain")
            .signing_algorithm(SignatureAlgorithm::Sha1WithRsa)
            .build(&key)
            .unwrap();

        assert!(verify_signature(&der, &key.public_key().unwrap()).unwrap());

        let summary = CrlSummary::from_der(&der).unwrap();
        assert_eq!(summary.version, 1);
        assert!(summary.entries.is_empty());
        assert_eq!(summary.next_update, None);
        assert_eq!(summary.crl_number, None);
    }
}
