//! Signature algorithms and the streaming signer used to re-sign a `tbsCertList`.

use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use openssl::sign::Signer;
use tracing::debug;

use crate::crypto::HashAlg;
use crate::crypto::errors::{CryptoResult, Error};
use crate::crypto::rsa::RsaPrivateKey;

// OID content octets of the PKCS#1 signature algorithms (1.2.840.113549.1.1.x)
const PKCS1_PREFIX: [u8; 8] = [0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01];

/// RSA PKCS#1 v1.5 signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Sha1WithRsa,
    Sha224WithRsa,
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
}

impl SignatureAlgorithm {
    /// Hash algorithm fed into the RSA signature
    pub fn hash_alg(&self) -> HashAlg {
        match self {
            SignatureAlgorithm::Sha1WithRsa => HashAlg::Sha1,
            SignatureAlgorithm::Sha224WithRsa => HashAlg::Sha224,
            SignatureAlgorithm::Sha256WithRsa => HashAlg::Sha256,
            SignatureAlgorithm::Sha384WithRsa => HashAlg::Sha384,
            SignatureAlgorithm::Sha512WithRsa => HashAlg::Sha512,
        }
    }

    fn oid_arc(&self) -> u8 {
        match self {
            SignatureAlgorithm::Sha1WithRsa => 0x05,
            SignatureAlgorithm::Sha256WithRsa => 0x0B,
            SignatureAlgorithm::Sha384WithRsa => 0x0C,
            SignatureAlgorithm::Sha512WithRsa => 0x0D,
            SignatureAlgorithm::Sha224WithRsa => 0x0E,
        }
    }

    /// Content octets of the algorithm OID
    pub fn oid(&self) -> Vec<u8> {
        let mut oid = PKCS1_PREFIX.to_vec();
        oid.push(self.oid_arc());
        oid
    }

    /// Look up an algorithm from the content octets of its OID
    pub fn from_oid(oid: &[u8]) -> Option<Self> {
        let (prefix, arc) = oid.split_at_checked(PKCS1_PREFIX.len())?;
        if prefix != PKCS1_PREFIX || arc.len() != 1 {
            return None;
        }
        match arc[0] {
            0x05 => Some(SignatureAlgorithm::Sha1WithRsa),
            0x0B => Some(SignatureAlgorithm::Sha256WithRsa),
            0x0C => Some(SignatureAlgorithm::Sha384WithRsa),
            0x0D => Some(SignatureAlgorithm::Sha512WithRsa),
            0x0E => Some(SignatureAlgorithm::Sha224WithRsa),
            _ => None,
        }
    }

    /// DER `AlgorithmIdentifier` with the NULL parameters RSA algorithms carry
    pub fn algorithm_identifier(&self) -> Vec<u8> {
        let oid = self.oid();
        let mut der = vec![0x30, (oid.len() + 4) as u8, 0x06, oid.len() as u8];
        der.extend_from_slice(&oid);
        der.extend_from_slice(&[0x05, 0x00]);
        der
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = Error;

    /// Accepts JCA style names such as `SHA256withRSA` and OpenSSL long names
    /// such as `sha256WithRSAEncryption`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let name = name.strip_suffix("encryption").unwrap_or(&name);

        match name {
            "sha1withrsa" => Ok(SignatureAlgorithm::Sha1WithRsa),
            "sha224withrsa" => Ok(SignatureAlgorithm::Sha224WithRsa),
            "sha256withrsa" => Ok(SignatureAlgorithm::Sha256WithRsa),
            "sha384withrsa" => Ok(SignatureAlgorithm::Sha384WithRsa),
            "sha512withrsa" => Ok(SignatureAlgorithm::Sha512WithRsa),
            _ if !name.contains("rsa") => Err(Error::UnsupportedAlgorithm(format!(
                "{s}: only RSA is supported"
            ))),
            _ => Err(Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}withRSA", self.hash_alg())
    }
}

/// Signs `tbsCertList` bytes with an RSA key
#[derive(Debug, Clone)]
pub struct CrlSigner {
    key: RsaPrivateKey,
    algorithm: SignatureAlgorithm,
}

impl CrlSigner {
    pub fn new(key: RsaPrivateKey, algorithm: SignatureAlgorithm) -> Self {
        Self { key, algorithm }
    }

    /// Exact length of the signature this signer produces
    pub fn signature_len(&self) -> usize {
        self.key.signature_len()
    }

    /// Open a sink that digests everything written to it
    pub fn start(&self) -> CryptoResult<SigningSink<'_>> {
        let digest = (&self.algorithm.hash_alg()).into();
        let signer = Signer::new(digest, self.key.pkey())?;
        debug!("Signing with {} (RSA-{})", self.algorithm, self.key.bits());

        Ok(SigningSink {
            signer,
            expected_len: self.signature_len(),
        })
    }

    /// One-shot signature over an in-memory buffer
    pub fn sign(&self, data: impl AsRef<[u8]>) -> CryptoResult<Vec<u8>> {
        let mut sink = self.start()?;
        sink.update(data.as_ref())?;
        sink.finish()
    }
}

/// Incremental signature computation, fed as bytes are written out
pub struct SigningSink<'a> {
    signer: Signer<'a>,
    expected_len: usize,
}

impl SigningSink<'_> {
    pub fn update(&mut self, data: &[u8]) -> CryptoResult<()> {
        Ok(self.signer.update(data)?)
    }

    /// Produce the signature over everything seen so far
    pub fn finish(self) -> CryptoResult<Vec<u8>> {
        let signature = self.signer.sign_to_vec()?;
        if signature.len() != self.expected_len {
            return Err(Error::SignatureLength {
                expected: self.expected_len,
                actual: signature.len(),
            });
        }
        Ok(signature)
    }
}

impl Write for SigningSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.signer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rsa::RsaKeySize;
    use openssl::hash::MessageDigest;
    use openssl::sign::Verifier;

    #[test]
    fn test_algorithm_identifier_encoding() {
        assert_eq!(
            SignatureAlgorithm::Sha256WithRsa.algorithm_identifier(),
            vec![
                0x30, 0x0D, 0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B,
                0x05, 0x00
            ]
        );
    }

    #[test]
    fn test_oid_lookup() {
        let alg = SignatureAlgorithm::Sha1WithRsa;
        assert_eq!(SignatureAlgorithm::from_oid(&alg.oid()), Some(alg));
        // rsaEncryption is a key algorithm, not a signature algorithm
        assert_eq!(
            SignatureAlgorithm::from_oid(&[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01]),
            None
        );
        // ecdsa-with-SHA256
        assert_eq!(
            SignatureAlgorithm::from_oid(&[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02]),
            None
        );
    }

    #[test]
    fn test_parse_algorithm_names() {
        assert_eq!(
            "SHA256withRSA".parse::<SignatureAlgorithm>().unwrap(),
            SignatureAlgorithm::Sha256WithRsa
        );
        assert_eq!(
            "sha1WithRSAEncryption".parse::<SignatureAlgorithm>().unwrap(),
            SignatureAlgorithm::Sha1WithRsa
        );
        assert_eq!(
            "SHA-512-with-RSA".parse::<SignatureAlgorithm>().unwrap(),
            SignatureAlgorithm::Sha512WithRsa
        );
        assert!(matches!(
            "SHA256withECDSA".parse::<SignatureAlgorithm>(),
            Err(Error::UnsupportedAlgorithm(_))
        ));
        assert_eq!(SignatureAlgorithm::Sha384WithRsa.to_string(), "SHA384withRSA");
    }

    #[test]
    fn test_streamed_signature_verifies() {
        let key = RsaPrivateKey::generate(RsaKeySize::Rsa2048).unwrap();
        let signer = CrlSigner::new(key.clone(), SignatureAlgorithm::Sha256WithRsa);

        let mut sink = signer.start().unwrap();
        sink.write_all(b"tbs").unwrap();
        sink.write_all(b"CertList").unwrap();
        let signature = sink.finish().unwrap();
        assert_eq!(signature.len(), 256);

        let public = key.public_key().unwrap();
        let mut verifier = Verifier::new(MessageDigest::sha256(), public.pkey()).unwrap();
        verifier.update(b"tbsCertList").unwrap();
        assert!(verifier.verify(&signature).unwrap());

        assert_eq!(signer.sign(b"tbsCertList").unwrap(), signature);
    }
}
