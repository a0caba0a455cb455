use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;

use super::der::{self, encode_sequence, encode_tlv, expect_tlv, parse_tlv, tag};
use super::errors::{CrlError, CrlResult};
use super::scanner::{CrlScanner, TbsPrefix};
use super::time::{decode_time, encode_time};

/// id-ce-cRLReasons (2.5.29.21)
pub const OID_REASON_CODE: &[u8] = &[0x55, 0x1D, 0x15];

/// CRLReason per RFC 5280 §5.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrlReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
    /// Any value outside the named codes, kept as-is
    Other(u32),
}

impl CrlReason {
    pub fn code(&self) -> u32 {
        match self {
            CrlReason::Unspecified => 0,
            CrlReason::KeyCompromise => 1,
            CrlReason::CaCompromise => 2,
            CrlReason::AffiliationChanged => 3,
            CrlReason::Superseded => 4,
            CrlReason::CessationOfOperation => 5,
            CrlReason::CertificateHold => 6,
            CrlReason::RemoveFromCrl => 8,
            CrlReason::PrivilegeWithdrawn => 9,
            CrlReason::AaCompromise => 10,
            CrlReason::Other(code) => *code,
        }
    }
}

impl From<u32> for CrlReason {
    fn from(code: u32) -> Self {
        match code {
            0 => CrlReason::Unspecified,
            1 => CrlReason::KeyCompromise,
            2 => CrlReason::CaCompromise,
            3 => CrlReason::AffiliationChanged,
            4 => CrlReason::Superseded,
            5 => CrlReason::CessationOfOperation,
            6 => CrlReason::CertificateHold,
            8 => CrlReason::RemoveFromCrl,
            9 => CrlReason::PrivilegeWithdrawn,
            10 => CrlReason::AaCompromise,
            other => CrlReason::Other(other),
        }
    }
}

/// One element of `revokedCertificates`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedEntry {
    serial: BigInt,
    revocation_date: DateTime<Utc>,
    reason: Option<CrlReason>,
    encoded_len: usize,
}

impl RevokedEntry {
    pub fn new(
        serial: impl Into<BigInt>,
        revocation_date: DateTime<Utc>,
        reason: Option<CrlReason>,
    ) -> Self {
        let mut entry = Self {
            serial: serial.into(),
            revocation_date,
            reason,
            encoded_len: 0,
        };
        entry.encoded_len = entry.to_der().len();
        entry
    }

    pub fn serial(&self) -> &BigInt {
        &self.serial
    }

    pub fn revocation_date(&self) -> DateTime<Utc> {
        self.revocation_date
    }

    pub fn reason(&self) -> Option<CrlReason> {
        self.reason
    }

    /// Size of the entry as it appears in the CRL
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// `SEQUENCE { userCertificate, revocationDate, crlEntryExtensions OPTIONAL }`
    pub fn to_der(&self) -> Vec<u8> {
        let serial = der::encode_integer(&self.serial);
        let date = encode_time(&self.revocation_date);

        match self.reason {
            Some(reason) => {
                let code = encode_tlv(
                    tag::ENUMERATED,
                    &BigInt::from(reason.code()).to_signed_bytes_be(),
                );
                let extension = encode_sequence(&[
                    &encode_tlv(tag::OID, OID_REASON_CODE),
                    &encode_tlv(tag::OCTET_STRING, &code),
                ]);
                let extensions = encode_sequence(&[&extension]);
                encode_sequence(&[&serial, &date, &extensions])
            }
            None => encode_sequence(&[&serial, &date]),
        }
    }

    /// Decode a complete entry TLV
    pub fn from_der(data: &[u8]) -> CrlResult<Self> {
        let (body, rest) = expect_tlv(data, tag::SEQUENCE, "revoked certificate")?;
        if !rest.is_empty() {
            return Err(CrlError::format("Trailing data after revoked certificate"));
        }

        let (serial, body) = expect_tlv(body, tag::INTEGER, "userCertificate")?;
        let serial = der::decode_integer(serial)?;

        let (date_header, date, body) = parse_tlv(body)?;
        let revocation_date = decode_time(date_header.tag, date)?;

        let reason = if body.is_empty() {
            None
        } else {
            let (extensions, rest) = expect_tlv(body, tag::SEQUENCE, "crlEntryExtensions")?;
            if !rest.is_empty() {
                return Err(CrlError::format("Trailing data in revoked certificate"));
            }
            find_reason(extensions)?
        };

        Ok(Self {
            serial,
            revocation_date,
            reason,
            encoded_len: data.len(),
        })
    }

    /// Pull only the serial out of an encoded entry
    pub fn serial_from_der(data: &[u8]) -> CrlResult<BigInt> {
        let (body, _) = expect_tlv(data, tag::SEQUENCE, "revoked certificate")?;
        let (serial, _) = expect_tlv(body, tag::INTEGER, "userCertificate")?;
        der::decode_integer(serial)
    }
}

impl fmt::Display for RevokedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "serial {} revoked {}", self.serial, self.revocation_date)?;
        if let Some(reason) = self.reason {
            write!(f, " ({reason:?})")?;
        }
        Ok(())
    }
}

fn find_reason(mut extensions: &[u8]) -> CrlResult<Option<CrlReason>> {
    while !extensions.is_empty() {
        let (extension, rest) = expect_tlv(extensions, tag::SEQUENCE, "Extension")?;
        extensions = rest;

        let (oid, mut body) = expect_tlv(extension, tag::OID, "extnID")?;
        if oid != OID_REASON_CODE {
            continue;
        }

        let (header, _, after) = parse_tlv(body)?;
        if header.tag == tag::BOOLEAN {
            body = after;
        }
        let (value, _) = expect_tlv(body, tag::OCTET_STRING, "extnValue")?;
        let (code, _) = expect_tlv(value, tag::ENUMERATED, "CRLReason")?;
        let code = u32::try_from(der::decode_integer(code)?)
            .map_err(|_| CrlError::format("CRLReason out of range"))?;
        return Ok(Some(CrlReason::from(code)));
    }
    Ok(None)
}

/// Decides which existing entries a rewrite drops.
///
/// Evaluated once per entry during the pre-scan; it must give the same answer
/// for the same entry every time.
pub trait CrlEntryValidator {
    fn should_delete(&self, entry: &RevokedEntry) -> bool;
}

impl<F> CrlEntryValidator for F
where
    F: Fn(&RevokedEntry) -> bool,
{
    fn should_delete(&self, entry: &RevokedEntry) -> bool {
        self(entry)
    }
}

/// Lazily decodes revoked entries straight from a CRL, one per step.
///
/// The stream only moves forward; to look at the entries again build a new
/// one from the start of the CRL. The underlying reader (usually an open file)
/// is released when the stream is dropped, including after an error.
pub struct CrlEntryStream<R> {
    scanner: CrlScanner<R>,
    failed: bool,
}

impl CrlEntryStream<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> CrlResult<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> CrlEntryStream<R> {
    pub fn new(reader: R) -> CrlResult<Self> {
        Ok(Self {
            scanner: CrlScanner::new(reader)?,
            failed: false,
        })
    }

    /// Header fields read while positioning the stream
    pub fn prefix(&self) -> &TbsPrefix {
        self.scanner.prefix()
    }

    /// Hand back the scanner to continue past the entries
    pub fn into_scanner(self) -> CrlScanner<R> {
        self.scanner
    }
}

impl<R: Read> Iterator for CrlEntryStream<R> {
    type Item = CrlResult<RevokedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self
            .scanner
            .next_entry()
            .and_then(|raw| raw.map(|raw| RevokedEntry::from_der(&raw.bytes)).transpose());
        match result {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_entry_encoding_with_reason() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let entry = RevokedEntry::new(9000, date, Some(CrlReason::PrivilegeWithdrawn));
        let encoded = entry.to_der();

        assert_eq!(encoded.len(), entry.encoded_len());
        let decoded = RevokedEntry::from_der(&encoded).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.reason(), Some(CrlReason::PrivilegeWithdrawn));
        assert_eq!(
            RevokedEntry::serial_from_der(&encoded).unwrap(),
            BigInt::from(9000)
        );
    }

    #[test]
    fn test_entry_without_extensions() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let entry = RevokedEntry::new(100, date, None);
        let encoded = entry.to_der();
        // SEQUENCE { INTEGER 100, UTCTime }
        assert_eq!(encoded[..5], [0x30, 0x12, 0x02, 0x01, 0x64]);
        assert_eq!(RevokedEntry::from_der(&encoded).unwrap().reason(), None);
    }

    #[test]
    fn test_entry_with_critical_flag_and_other_extensions() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let invalidity_date = encode_sequence(&[
            &encode_tlv(tag::OID, &[0x55, 0x1D, 0x18]),
            &encode_tlv(tag::OCTET_STRING, &encode_tlv(tag::GENERALIZED_TIME, b"20240101000000Z")),
        ]);
        let reason = encode_sequence(&[
            &encode_tlv(tag::OID, OID_REASON_CODE),
            &encode_tlv(tag::BOOLEAN, &[0xFF]),
            &encode_tlv(tag::OCTET_STRING, &[0x0A, 0x01, 0x01]),
        ]);
        let extensions = encode_sequence(&[&invalidity_date, &reason]);
        let encoded = encode_sequence(&[
            &der::encode_integer(&BigInt::from(7)),
            &encode_time(&date),
            &extensions,
        ]);

        let entry = RevokedEntry::from_der(&encoded).unwrap();
        assert_eq!(entry.reason(), Some(CrlReason::KeyCompromise));
        assert_eq!(entry.encoded_len(), encoded.len());
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(CrlReason::from(9), CrlReason::PrivilegeWithdrawn);
        assert_eq!(CrlReason::from(7), CrlReason::Other(7));
        assert_eq!(CrlReason::RemoveFromCrl.code(), 8);
    }

    #[test]
    fn test_large_serial() {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let serial: BigInt = "123456789012345678901234567890123456789".parse().unwrap();
        let entry = RevokedEntry::new(serial.clone(), date, Some(CrlReason::Unspecified));
        assert_eq!(
            RevokedEntry::from_der(&entry.to_der()).unwrap().serial(),
            &serial
        );
    }

    #[test]
    fn test_malformed_entry() {
        assert!(matches!(
            RevokedEntry::from_der(&[0x30, 0x03, 0x02, 0x01, 0x01]),
            Err(CrlError::Format(_))
        ));
        assert!(matches!(
            RevokedEntry::from_der(&[0x31, 0x00]),
            Err(CrlError::Format(_))
        ));
    }
}
