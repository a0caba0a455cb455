mod common;

use chrono::TimeDelta;
use common::*;
use crl_rewriter::{
    crl::{CrlBuilder, CrlFile, CrlReason, CrlSummary, issuer_from_certificate, to_pem},
    crypto::{RsaKeySize, RsaPrivateKey, SignatureAlgorithm},
};
use num_bigint::BigInt;
use openssl::{
    asn1::Asn1Time,
    hash::MessageDigest,
    pkey::PKey,
    x509::{X509, X509NameBuilder},
};

fn crl_file(path: &std::path::Path, key: &RsaPrivateKey) -> CrlFile {
    CrlFile::new(path, key.clone(), CrlBuilder::common_name_der("Test CA"))
}

fn read_summary(file: &CrlFile, key: &RsaPrivateKey) -> CrlSummary {
    verified(&file.read_der().unwrap(), key)
}

#[test]
fn test_initialize_writes_pem() {
    let key = generate_key(RsaKeySize::Rsa2048);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ca.crl");
    let file = crl_file(&path, &key).validity(TimeDelta::hours(48));

    file.initialize(&big(&[1, 2])).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("-----BEGIN X509 CRL-----\n"));
    assert!(text.ends_with("-----END X509 CRL-----\n"));
    assert!(text.lines().all(|line| line.len() <= 64));

    let summary = read_summary(&file, &key);
    assert_eq!(sorted_serials(&summary), big(&[1, 2]));
    assert_eq!(summary.crl_number, Some(BigInt::from(1)));
    assert_eq!(
        summary.next_update.unwrap() - summary.this_update,
        TimeDelta::hours(48)
    );
    assert!(
        summary
            .entries
            .iter()
            .all(|e| e.reason() == Some(CrlReason::PrivilegeWithdrawn))
    );
}

#[test]
fn test_update_missing_file_initializes() {
    let key = generate_key(RsaKeySize::Rsa1024);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ca.crl");
    let file = crl_file(&path, &key);

    assert!(file.update(&big(&[5]), &big(&[6])).unwrap());
    assert_eq!(sorted_serials(&read_summary(&file, &key)), big(&[5]));

    // An empty file is treated the same way
    std::fs::write(&path, b"").unwrap();
    assert!(file.update(&big(&[7]), &[]).unwrap());
    assert_eq!(sorted_serials(&read_summary(&file, &key)), big(&[7]));
}

#[test]
fn test_update_pem_file() {
    let key = generate_key(RsaKeySize::Rsa2048);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ca.crl");
    let file = crl_file(&path, &key);
    file.initialize(&big(&[1, 2, 3])).unwrap();

    assert!(file.update(&big(&[4]), &big(&[1, 3])).unwrap());

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("-----BEGIN X509 CRL-----"));

    let summary = read_summary(&file, &key);
    assert_eq!(sorted_serials(&summary), big(&[2, 4]));
    assert_eq!(summary.crl_number, Some(BigInt::from(2)));
    assert_eq!(
        summary.signature_algorithm,
        Some(SignatureAlgorithm::Sha256WithRsa)
    );

    // Only the temporary file's rename touched the directory
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_update_without_changes_leaves_file_alone() {
    let key = generate_key(RsaKeySize::Rsa1024);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ca.crl");
    let file = crl_file(&path, &key);
    file.initialize(&big(&[1])).unwrap();
    let before = std::fs::read(&path).unwrap();

    assert!(!file.update(&[], &[]).unwrap());
    // Unrevoking a serial that is not listed is not a change either
    assert!(!file.update(&[], &big(&[99])).unwrap());

    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn test_der_file() {
    let key = generate_key(RsaKeySize::Rsa1024);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ca.der");
    let file = crl_file(&path, &key).pem(false);
    file.initialize(&big(&[10])).unwrap();
    assert_eq!(std::fs::read(&path).unwrap()[0], 0x30);

    assert!(file.update(&big(&[11]), &[]).unwrap());

    let der = std::fs::read(&path).unwrap();
    assert_eq!(der[0], 0x30);
    assert_eq!(sorted_serials(&verified(&der, &key)), big(&[10, 11]));
}

#[test]
fn test_pem_input_from_elsewhere() {
    let key = generate_key(RsaKeySize::Rsa2048);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ca.crl");
    std::fs::write(&path, to_pem(&fixture_crl(&key))).unwrap();

    let file = crl_file(&path, &key).revocation_reason(CrlReason::KeyCompromise);
    assert!(file.update(&big(&[9000]), &[]).unwrap());

    let summary = read_summary(&file, &key);
    assert_eq!(sorted_serials(&summary), big(&[100, 9000]));
    assert_eq!(summary.crl_number, Some(BigInt::from(128)));
    let added = summary
        .entries
        .iter()
        .find(|e| e.serial() == &BigInt::from(9000))
        .unwrap();
    assert_eq!(added.reason(), Some(CrlReason::KeyCompromise));
}

#[test]
fn test_issuer_from_certificate() {
    let key = generate_key(RsaKeySize::Rsa2048);
    let pkey = PKey::private_key_from_pem(key.to_pem().unwrap().as_bytes()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "Candlepin Test CA").unwrap();
    name.append_entry_by_text("O", "Example").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(1).unwrap())
        .unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert_pem = builder.build().to_pem().unwrap();

    let issuer = issuer_from_certificate(&cert_pem).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let file = CrlFile::new(dir.path().join("ca.crl"), key.clone(), issuer);
    file.initialize(&[]).unwrap();

    let summary = read_summary(&file, &key);
    assert!(summary.issuer.contains("Candlepin Test CA"));
    assert!(summary.issuer.contains("Example"));
    assert!(summary.entries.is_empty());
}
