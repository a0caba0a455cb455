//! Forward-only structural walk over a DER `CertificateList`.
//!
//! ```text
//! CertificateList  ::=  SEQUENCE  {
//!      tbsCertList          TBSCertList,
//!      signatureAlgorithm   AlgorithmIdentifier,
//!      signatureValue       BIT STRING  }
//!
//! TBSCertList  ::=  SEQUENCE  {
//!      version                 Version OPTIONAL,
//!      signature               AlgorithmIdentifier,
//!      issuer                  Name,
//!      thisUpdate              Time,
//!      nextUpdate              Time OPTIONAL,
//!      revokedCertificates     SEQUENCE OF SEQUENCE { ... } OPTIONAL,
//!      crlExtensions           [0] EXPLICIT Extensions OPTIONAL }
//! ```
//!
//! Everything before `revokedCertificates` and everything after it is small
//! and read whole. Revoked entries are handed out one at a time.

use std::io::Read;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::der::{self, RawTlv, TlvRegion, TrackingReader, tag};
use super::errors::{CrlError, CrlResult};
use super::time::{decode_time, is_time_tag};

/// The elements of `tbsCertList` that precede the revoked certificates
#[derive(Debug, Clone)]
pub struct TbsPrefix {
    pub certificate_list: TlvRegion,
    pub tbs_cert_list: TlvRegion,
    pub version: Option<RawTlv>,
    pub signature: RawTlv,
    pub issuer: RawTlv,
    pub this_update: RawTlv,
    pub this_update_time: DateTime<Utc>,
    pub next_update: Option<RawTlv>,
    pub next_update_time: Option<DateTime<Utc>>,
}

impl TbsPrefix {
    /// True when the CRL carries an explicit `version v2`
    pub fn is_v2(&self) -> bool {
        self.version.as_ref().is_some_and(|v| v.content() == [0x01])
    }
}

/// The elements following the revoked certificates
#[derive(Debug, Clone)]
pub struct Trailer {
    pub revoked_certificates: Option<TlvRegion>,
    pub extensions: Option<RawTlv>,
    pub signature_algorithm: RawTlv,
    pub signature_value: TlvRegion,
}

pub struct CrlScanner<R> {
    reader: TrackingReader<R>,
    prefix: TbsPrefix,
    revoked: Option<TlvRegion>,
    /// A header read past the revoked list position that was not a list
    pending: Option<TlvRegion>,
}

impl<R: Read> CrlScanner<R> {
    /// Read the CRL up to its first revoked entry
    pub fn new(reader: R) -> CrlResult<Self> {
        let mut reader = TrackingReader::new(reader);

        let certificate_list = reader.expect_region(tag::SEQUENCE, "CertificateList")?;
        let tbs_cert_list = reader.expect_region(tag::SEQUENCE, "tbsCertList")?;
        tbs_cert_list.ensure_within(&certificate_list, "tbsCertList")?;

        let mut next = reader.read_tlv_within(&tbs_cert_list, "tbsCertList element")?;
        let version = if next.region.tag() == tag::INTEGER {
            match next.content() {
                [0x01] => {}
                [0x00] => debug!("CRL has an explicit v1 version field"),
                other => {
                    return Err(CrlError::format(format!(
                        "Unsupported CRL version {}",
                        hex::encode(other)
                    )));
                }
            }
            let version = next;
            next = reader.read_tlv_within(&tbs_cert_list, "CRL signature")?;
            Some(version)
        } else {
            None
        };

        if next.region.tag() != tag::SEQUENCE {
            return Err(CrlError::format(
                "Not a CRL: tbsCertList does not start with an AlgorithmIdentifier",
            ));
        }
        let signature = next;

        let issuer = reader.read_tlv_within(&tbs_cert_list, "issuer")?;
        if issuer.region.tag() != tag::SEQUENCE {
            return Err(CrlError::format("Not a CRL: issuer is not a Name"));
        }

        let this_update = reader.read_tlv_within(&tbs_cert_list, "thisUpdate")?;
        if !is_time_tag(this_update.region.tag()) {
            return Err(CrlError::format("Not a CRL: thisUpdate is missing"));
        }
        let this_update_time = decode_time(this_update.region.tag(), this_update.content())?;

        let mut next_update = None;
        let mut next_update_time = None;
        let mut pending = None;
        let mut revoked = None;

        if reader.position() < tbs_cert_list.end() {
            let region = reader.read_region()?;
            if is_time_tag(region.tag()) {
                region.ensure_within(&tbs_cert_list, "nextUpdate")?;
                let raw = reader.read_raw(region)?;
                next_update_time = Some(decode_time(region.tag(), raw.content())?);
                next_update = Some(raw);
                if reader.position() < tbs_cert_list.end() {
                    pending = Some(reader.read_region()?);
                }
            } else {
                pending = Some(region);
            }
        }

        if let Some(region) = pending
            && region.tag() == tag::SEQUENCE
        {
            region.ensure_within(&tbs_cert_list, "revokedCertificates")?;
            revoked = Some(region);
            pending = None;
        }

        let prefix = TbsPrefix {
            certificate_list,
            tbs_cert_list,
            version,
            signature,
            issuer,
            this_update,
            this_update_time,
            next_update,
            next_update_time,
        };

        Ok(Self {
            reader,
            prefix,
            revoked,
            pending,
        })
    }

    pub fn prefix(&self) -> &TbsPrefix {
        &self.prefix
    }

    /// Region of the `revokedCertificates` list, absent for CRLs without entries
    pub fn revoked_certificates(&self) -> Option<TlvRegion> {
        self.revoked
    }

    /// Next encoded entry of the revoked list, if any remain
    pub fn next_entry(&mut self) -> CrlResult<Option<RawTlv>> {
        let Some(list) = self.revoked else {
            return Ok(None);
        };
        if self.reader.position() >= list.end() {
            return Ok(None);
        }

        let entry = self.reader.read_tlv_within(&list, "revoked certificate")?;
        if entry.region.tag() != tag::SEQUENCE {
            return Err(CrlError::format(format!(
                "Revoked certificate at offset {} is not a SEQUENCE",
                entry.region.offset
            )));
        }
        Ok(Some(entry))
    }

    /// Consume whatever remains, returning the extensions and signature parts
    pub fn finish(mut self) -> CrlResult<(TbsPrefix, Trailer)> {
        if let Some(list) = self.revoked {
            let remaining = list.end().saturating_sub(self.reader.position());
            self.reader.skip(remaining as usize)?;
        }

        let tbs_end = self.prefix.tbs_cert_list.end();
        let pending = match self.pending.take() {
            Some(region) => Some(region),
            None if self.reader.position() < tbs_end => Some(self.reader.read_region()?),
            None => None,
        };

        let extensions = match pending {
            Some(region) if region.tag() == tag::CONTEXT_0 => {
                region.ensure_within(&self.prefix.tbs_cert_list, "crlExtensions")?;
                Some(self.reader.read_raw(region)?)
            }
            Some(region) => {
                return Err(CrlError::format(format!(
                    "Unexpected element with tag 0x{:02X} in tbsCertList",
                    region.tag()
                )));
            }
            None => None,
        };

        if self.reader.position() != tbs_end {
            return Err(CrlError::format("Trailing data inside tbsCertList"));
        }

        let certificate_list = self.prefix.certificate_list;
        let signature_algorithm = self
            .reader
            .read_tlv_within(&certificate_list, "signatureAlgorithm")?;
        if signature_algorithm.region.tag() != tag::SEQUENCE {
            return Err(CrlError::format("signatureAlgorithm is not a SEQUENCE"));
        }
        let signature_value = self
            .reader
            .expect_region(der::tag::BIT_STRING, "signatureValue")?;
        signature_value.ensure_within(&certificate_list, "signatureValue")?;
        self.reader.skip(signature_value.content_len())?;

        if self.reader.position() != certificate_list.end() {
            return Err(CrlError::format(
                "CertificateList length does not match its contents",
            ));
        }

        Ok((
            self.prefix,
            Trailer {
                revoked_certificates: self.revoked,
                extensions,
                signature_algorithm,
                signature_value,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crl::{CrlBuilder, RevokedEntry};
    use crate::crypto::{RsaKeySize, RsaPrivateKey};
    use chrono::{TimeDelta, TimeZone};

    fn key() -> RsaPrivateKey {
        RsaPrivateKey::generate(RsaKeySize::Rsa1024).unwrap()
    }

    #[test]
    fn test_walks_a_complete_crl() {
        let this_update = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let crl = CrlBuilder::with_common_name("Scanner")
            .this_update(this_update)
            .next_update(this_update + TimeDelta::days(1))
            .crl_number(3)
            .entries((1..=3).map(|serial| RevokedEntry::new(serial, this_update, None)))
            .build(&key())
            .unwrap();

        let mut scanner = CrlScanner::new(crl.as_slice()).unwrap();
        let prefix = scanner.prefix().clone();
        assert!(prefix.is_v2());
        assert_eq!(prefix.this_update_time, this_update);
        assert_eq!(
            prefix.next_update_time,
            Some(this_update + TimeDelta::days(1))
        );
        assert!(scanner.revoked_certificates().is_some());

        let mut count = 0;
        while let Some(entry) = scanner.next_entry().unwrap() {
            assert_eq!(entry.region.tag(), tag::SEQUENCE);
            count += 1;
        }
        assert_eq!(count, 3);

        let (_, trailer) = scanner.finish().unwrap();
        assert!(trailer.extensions.is_some());
        assert_eq!(trailer.signature_value.content_len(), 128 + 1);
    }

    #[test]
    fn test_finish_skips_unread_entries() {
        let now = Utc::now();
        let crl = CrlBuilder::with_common_name("Scanner")
            .entries((1..=5).map(|serial| RevokedEntry::new(serial, now, None)))
            .build(&key())
            .unwrap();

        let mut scanner = CrlScanner::new(crl.as_slice()).unwrap();
        assert!(scanner.next_entry().unwrap().is_some());
        let (prefix, trailer) = scanner.finish().unwrap();
        assert!(!prefix.is_v2());
        assert!(prefix.next_update.is_none());
        assert!(trailer.extensions.is_none());
    }

    #[test]
    fn test_crl_without_entries_or_next_update() {
        let crl = CrlBuilder::with_common_name("Empty")
            .crl_number(1)
            .build(&key())
            .unwrap();

        let mut scanner = CrlScanner::new(crl.as_slice()).unwrap();
        assert!(scanner.revoked_certificates().is_none());
        assert!(scanner.next_entry().unwrap().is_none());
        let (_, trailer) = scanner.finish().unwrap();
        assert!(trailer.extensions.is_some());
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let crl = CrlBuilder::with_common_name("Versioned")
            .crl_number(1)
            .build(&key())
            .unwrap();
        // version INTEGER 1 follows the two outer headers
        let position = crl
            .windows(3)
            .position(|w| w == [0x02, 0x01, 0x01])
            .unwrap();
        let mut tampered = crl.clone();
        tampered[position + 2] = 0x05;

        let err = CrlScanner::new(tampered.as_slice()).err().unwrap();
        assert!(err.to_string().contains("Unsupported CRL version"));
    }

    #[test]
    fn test_rejects_overrunning_tbs() {
        let crl = CrlBuilder::with_common_name("Broken").build(&key()).unwrap();
        let mut tampered = crl.clone();
        // Shrink the outer length so tbsCertList no longer fits
        assert_eq!(tampered[1], 0x81);
        tampered[2] = 0x28;

        assert!(matches!(
            CrlScanner::new(tampered.as_slice()),
            Err(CrlError::Format(_))
        ));
    }
    #[test]
    fn test_rejects_issuer_longer_than_tbs() {
        let crl = CrlBuilder::with_common_name("Broken").build(&key()).unwrap();
        let issuer = CrlBuilder::common_name_der("Broken");
        let at = crl
            .windows(issuer.len())
            .position(|window| window == issuer.as_slice())
            .unwrap();
        let mut tampered = crl.clone();
        tampered[at + 1] = 0x7F;

        let result = CrlScanner::new(tampered.as_slice());
        assert!(matches!(result, Err(CrlError::Format(message)) if message.contains("issuer")));
    }
}
