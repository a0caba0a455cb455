//! Maintenance of a CRL kept on disk, DER or PEM.
//!
//! Updates go to a temporary file next to the CRL which then replaces it,
//! so readers never see a half written CRL.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use base64::write::EncoderWriter;
use chrono::{TimeDelta, Utc};
use num_bigint::BigInt;
use openssl::x509::X509;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};
use x509_parser::pem::Pem;

use super::builder::CrlBuilder;
use super::entry::{CrlReason, RevokedEntry};
use super::errors::{CrlError, CrlResult};
use super::writer::{CrlSource, CrlStreamWriter};
use crate::crypto::{self, RsaPrivateKey, SignatureAlgorithm};

const PEM_LABEL: &str = "X509 CRL";
const PEM_LINE_WIDTH: usize = 64;

/// DER encoded subject of a PEM encoded CA certificate, for use as CRL issuer
pub fn issuer_from_certificate(pem: &[u8]) -> CrlResult<Vec<u8>> {
    let certificate = X509::from_pem(pem).map_err(crypto::Error::from)?;
    Ok(certificate
        .subject_name()
        .to_der()
        .map_err(crypto::Error::from)?)
}

/// A CRL file and the key that signs it
#[derive(Debug)]
pub struct CrlFile {
    path: PathBuf,
    key: RsaPrivateKey,
    issuer: Vec<u8>,
    signing_algorithm: SignatureAlgorithm,
    reason: CrlReason,
    validity: TimeDelta,
    pem: bool,
}

impl CrlFile {
    pub fn new(path: impl Into<PathBuf>, key: RsaPrivateKey, issuer: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            key,
            issuer,
            signing_algorithm: SignatureAlgorithm::Sha256WithRsa,
            reason: CrlReason::PrivilegeWithdrawn,
            validity: TimeDelta::hours(24),
            pem: true,
        }
    }

    pub fn signing_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.signing_algorithm = algorithm;
        self
    }

    /// Reason recorded for newly revoked serials
    pub fn revocation_reason(mut self, reason: CrlReason) -> Self {
        self.reason = reason;
        self
    }

    /// Distance between thisUpdate and nextUpdate of a newly created CRL
    pub fn validity(mut self, validity: TimeDelta) -> Self {
        self.validity = validity;
        self
    }

    /// Write PEM instead of raw DER
    pub fn pem(mut self, pem: bool) -> Self {
        self.pem = pem;
        self
    }

    /// Replace the file with a fresh CRL revoking `revoke`
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn initialize(&self, revoke: &[BigInt]) -> CrlResult<()> {
        let now = Utc::now();
        let entries = revoke
            .iter()
            .map(|serial| RevokedEntry::new(serial.clone(), now, Some(self.reason)));

        let der = CrlBuilder::new(self.issuer.clone())
            .this_update(now)
            .next_update(now + self.validity)
            .crl_number(1)
            .authority_key_identifier()
            .signing_algorithm(self.signing_algorithm)
            .entries(entries)
            .build(&self.key)?;

        self.replace_with(|out| Ok(out.write_all(&der)?))?;
        info!(
            "Initialized CRL {} with {} entries",
            self.path.display(),
            revoke.len()
        );
        Ok(())
    }

    /// Revoke and unrevoke serials in place.
    ///
    /// Returns `false` when there was nothing to change and the file was left
    /// alone. A missing or empty file is initialized instead.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn update(&self, revoke: &[BigInt], unrevoke: &[BigInt]) -> CrlResult<bool> {
        let is_empty = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if is_empty {
            debug!("CRL {} is missing or empty", self.path.display());
            self.initialize(revoke)?;
            return Ok(true);
        }

        if self.is_pem()? {
            let der = self.read_der()?;
            self.rewrite(CrlStreamWriter::new(der.as_slice(), self.key.clone()), revoke, unrevoke)
        } else {
            self.rewrite(CrlStreamWriter::open(&self.path, self.key.clone()), revoke, unrevoke)
        }
    }

    fn rewrite<S: CrlSource>(
        &self,
        mut writer: CrlStreamWriter<S>,
        revoke: &[BigInt],
        unrevoke: &[BigInt],
    ) -> CrlResult<bool> {
        let now = Utc::now();
        for serial in revoke {
            writer.add(serial.clone(), now, Some(self.reason))?;
        }

        let unrevoke: HashSet<&BigInt> = unrevoke.iter().collect();
        writer.pre_scan_with(|entry: &RevokedEntry| unrevoke.contains(entry.serial()))?;
        writer.set_signing_algorithm(self.signing_algorithm)?;

        if !writer.has_changes_queued() {
            info!("No changes for CRL {}", self.path.display());
            return Ok(false);
        }

        writer.lock()?;
        self.replace_with(|out| writer.write(out))?;

        info!(
            "Updated CRL {}: {} revoked, {} unrevoked, CRL number {}",
            self.path.display(),
            revoke.len(),
            unrevoke.len(),
            writer
                .crl_number()
                .map_or_else(|| "none".to_string(), BigInt::to_string)
        );
        Ok(true)
    }

    fn is_pem(&self) -> CrlResult<bool> {
        let mut head = Vec::with_capacity(64);
        File::open(&self.path)?.take(64).read_to_end(&mut head)?;
        let text = String::from_utf8_lossy(&head);
        Ok(text.trim_start().starts_with("-----BEGIN"))
    }

    /// The CRL as DER, with any PEM armour removed
    pub fn read_der(&self) -> CrlResult<Vec<u8>> {
        if !self.is_pem()? {
            return Ok(fs::read(&self.path)?);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let (pem, _) = Pem::read(reader)
            .map_err(|e| CrlError::format(format!("Invalid PEM in {}: {e}", self.path.display())))?;
        if pem.label != PEM_LABEL {
            debug!("Unexpected PEM label {:?}", pem.label);
        }
        Ok(pem.contents)
    }

    /// Write through a temporary file in the same directory, then rename
    fn replace_with<F>(&self, write: F) -> CrlResult<()>
    where
        F: FnOnce(&mut dyn Write) -> CrlResult<()>,
    {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(dir)?;

        {
            let mut out = BufWriter::new(temp.as_file_mut());
            if self.pem {
                writeln!(out, "-----BEGIN {PEM_LABEL}-----")?;
                {
                    let mut encoder = EncoderWriter::new(LineWrapper::new(&mut out), &STANDARD);
                    write(&mut encoder)?;
                    encoder.finish()?.finish()?;
                }
                writeln!(out, "-----END {PEM_LABEL}-----")?;
            } else {
                write(&mut out)?;
            }
            out.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(io::Error::from)?;
        Ok(())
    }
}

/// Breaks base64 output into fixed width lines
struct LineWrapper<W> {
    inner: W,
    column: usize,
}

impl<W: Write> LineWrapper<W> {
    fn new(inner: W) -> Self {
        Self { inner, column: 0 }
    }

    /// Terminate the last line
    fn finish(mut self) -> io::Result<()> {
        if self.column > 0 {
            self.inner.write_all(b"\n")?;
            self.column = 0;
        }
        self.inner.flush()
    }
}

impl<W: Write> Write for LineWrapper<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let take = (PEM_LINE_WIDTH - self.column).min(rest.len());
            self.inner.write_all(&rest[..take])?;
            self.column += take;
            rest = &rest[take..];
            if self.column == PEM_LINE_WIDTH {
                self.inner.write_all(b"\n")?;
                self.column = 0;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// PEM encode a DER CRL in memory
pub fn to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {PEM_LABEL}-----\n");
    for line in encoded.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {PEM_LABEL}-----\n"));
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_wrapper() {
        let mut out = Vec::new();
        let mut wrapper = LineWrapper::new(&mut out);
        wrapper.write_all(&[b'A'; 100]).unwrap();
        wrapper.write_all(&[b'B'; 28]).unwrap();
        wrapper.finish().unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), 64);
        assert_eq!(lines[1].len(), 64);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_streamed_pem_matches_in_memory_encoding() {
        let der: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        let mut streamed = Vec::new();
        {
            let mut wrapper = LineWrapper::new(&mut streamed);
            let mut encoder = EncoderWriter::new(&mut wrapper, &STANDARD);
            encoder.write_all(&der[..300]).unwrap();
            encoder.write_all(&der[300..]).unwrap();
            encoder.finish().unwrap();
            drop(encoder);
            wrapper.finish().unwrap();
        }

        let pem = to_pem(&der);
        let body: String = pem.lines().filter(|l| !l.starts_with("-----")).collect::<Vec<_>>().join("\n");
        assert_eq!(String::from_utf8(streamed).unwrap(), format!("{body}\n"));
    }
}
