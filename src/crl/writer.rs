//! Streaming rewrite of an existing CRL.
//!
//! A rewrite runs in three steps against the same source:
//!
//! 1. [`CrlStreamWriter::pre_scan`] walks the revoked entries once and decides
//!    which of them are dropped.
//! 2. [`CrlStreamWriter::lock`] freezes the edits, fixes the new timestamps,
//!    extensions and signing algorithm, and settles every enclosing length.
//! 3. [`CrlStreamWriter::write`] walks the source a second time, copying
//!    kept entries, appending new ones and signing the `tbsCertList` bytes as
//!    they go out.
//!
//! Only one revoked entry is held in memory at a time.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::mem;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use num_bigint::BigInt;
use tracing::{debug, info, warn};

use super::der::{self, RawTlv, encode_tlv, expect_tlv, tag};
use super::entry::{CrlEntryStream, CrlEntryValidator, CrlReason, RevokedEntry};
use super::errors::{CrlError, CrlResult, StateError};
use super::extensions::update_extensions;
use super::layout::{LengthCascade, NodeId};
use super::scanner::{CrlScanner, TbsPrefix, Trailer};
use super::time::encode_time;
use crate::crypto::{CrlSigner, RsaPrivateKey, SignatureAlgorithm};

const VERSION_V2: [u8; 3] = [0x02, 0x01, 0x01];

/// Something the rewriter can read the CRL from, once per pass
pub trait CrlSource {
    type Reader: Read;

    /// Open a fresh reader positioned at the start of the CRL
    fn open(&self) -> io::Result<Self::Reader>;

    /// Human readable name for log messages
    fn describe(&self) -> String;
}

impl CrlSource for PathBuf {
    type Reader = BufReader<File>;

    fn open(&self) -> io::Result<Self::Reader> {
        Ok(BufReader::new(File::open(self)?))
    }

    fn describe(&self) -> String {
        self.display().to_string()
    }
}

impl<'a> CrlSource for &'a [u8] {
    type Reader = &'a [u8];

    fn open(&self) -> io::Result<Self::Reader> {
        Ok(self)
    }

    fn describe(&self) -> String {
        format!("<{} bytes in memory>", self.len())
    }
}

/// How `nextUpdate` moves when the CRL is rewritten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextUpdatePolicy {
    /// Keep the distance between `thisUpdate` and `nextUpdate`. A CRL without
    /// `nextUpdate` keeps going without one.
    #[default]
    PreserveInterval,
    /// Set `nextUpdate` to the new `thisUpdate` plus a fixed validity
    Fixed(TimeDelta),
}

/// Outcome of the pre-scan pass
struct ScanResult {
    prefix: TbsPrefix,
    trailer: Trailer,
    entry_count: usize,
    entries_len: usize,
    /// Indices of source entries left out of the output
    dropped: HashSet<usize>,
    dropped_len: usize,
    /// Additions registered after the scan that may shadow existing entries
    rescan_needed: bool,
}

/// Everything `write` needs, fixed at lock time
struct Plan {
    algorithm: SignatureAlgorithm,
    crl_number: Option<BigInt>,
    dropped: HashSet<usize>,
    kept_len: usize,
    version: Option<Vec<u8>>,
    signature_algorithm: Vec<u8>,
    issuer: Vec<u8>,
    this_update: Vec<u8>,
    next_update: Option<Vec<u8>>,
    new_entries: Vec<Vec<u8>>,
    extensions: Option<Vec<u8>>,
    cascade: LengthCascade,
    certificate_list: NodeId,
    tbs_cert_list: NodeId,
    revoked: NodeId,
}

enum State {
    Created,
    PreScanned(Box<ScanResult>),
    Locked(Box<Plan>),
    Written,
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Created => "Created",
            State::PreScanned(_) => "PreScanned",
            State::Locked(_) => "Locked",
            State::Written => "Written",
        };
        f.write_str(name)
    }
}

/// Rewrites a CRL: adds and removes revoked entries, refreshes the update
/// times and extensions, and re-signs the result.
///
/// ```no_run
/// use chrono::Utc;
/// use crl_rewriter::crl::{CrlReason, CrlStreamWriter};
/// use crl_rewriter::crypto::RsaPrivateKey;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let key = RsaPrivateKey::from_pem(std::fs::read("ca.key")?)?;
/// let mut writer = CrlStreamWriter::open("ca.crl", key);
/// writer.add(9000, Utc::now(), Some(CrlReason::PrivilegeWithdrawn))?;
/// writer.pre_scan()?.lock()?;
///
/// let mut out = std::fs::File::create("ca.crl.new")?;
/// writer.write(&mut out)?;
/// # Ok(())
/// # }
/// ```
pub struct CrlStreamWriter<S> {
    source: S,
    key: RsaPrivateKey,
    signing_algorithm: Option<SignatureAlgorithm>,
    next_update_policy: NextUpdatePolicy,
    additions: Vec<RevokedEntry>,
    addition_index: HashMap<BigInt, usize>,
    deletions: usize,
    crl_number: Option<BigInt>,
    state: State,
}

impl CrlStreamWriter<PathBuf> {
    /// Rewrite the CRL stored in a file
    pub fn open(path: impl AsRef<Path>, key: RsaPrivateKey) -> Self {
        Self::new(path.as_ref().to_path_buf(), key)
    }
}

impl<S: CrlSource> CrlStreamWriter<S> {
    pub fn new(source: S, key: RsaPrivateKey) -> Self {
        Self {
            source,
            key,
            signing_algorithm: None,
            next_update_policy: NextUpdatePolicy::default(),
            additions: Vec::new(),
            addition_index: HashMap::new(),
            deletions: 0,
            crl_number: None,
            state: State::Created,
        }
    }

    fn ensure_unlocked(&self) -> CrlResult<()> {
        match self.state {
            State::Created | State::PreScanned(_) => Ok(()),
            State::Locked(_) => Err(StateError::AlreadyLocked.into()),
            State::Written => Err(StateError::AlreadyWritten.into()),
        }
    }

    /// Queue a certificate for revocation.
    ///
    /// Adding a serial that is already queued replaces the earlier addition.
    /// An existing entry with the same serial is dropped from the output.
    pub fn add(
        &mut self,
        serial: impl Into<BigInt>,
        revocation_date: DateTime<Utc>,
        reason: Option<CrlReason>,
    ) -> CrlResult<()> {
        self.add_entry(RevokedEntry::new(serial, revocation_date, reason))
    }

    pub fn add_entry(&mut self, entry: RevokedEntry) -> CrlResult<()> {
        self.ensure_unlocked()?;

        if let State::PreScanned(scan) = &mut self.state {
            scan.rescan_needed = true;
        }

        match self.addition_index.get(entry.serial()) {
            Some(&index) => {
                debug!("Serial {} queued twice, keeping the latest", entry.serial());
                self.additions[index] = entry;
            }
            None => {
                self.addition_index
                    .insert(entry.serial().clone(), self.additions.len());
                self.additions.push(entry);
            }
        }
        Ok(())
    }

    /// Sign with `algorithm` instead of the algorithm of the source CRL
    pub fn set_signing_algorithm(&mut self, algorithm: SignatureAlgorithm) -> CrlResult<()> {
        self.ensure_unlocked()?;
        self.signing_algorithm = Some(algorithm);
        Ok(())
    }

    pub fn set_next_update_policy(&mut self, policy: NextUpdatePolicy) -> CrlResult<()> {
        self.ensure_unlocked()?;
        self.next_update_policy = policy;
        Ok(())
    }

    /// True when entries are queued for addition or were marked for deletion
    pub fn has_changes_queued(&self) -> bool {
        !self.additions.is_empty() || self.deletions > 0
    }

    /// CRL number the rewritten CRL carries, known once locked
    pub fn crl_number(&self) -> Option<&BigInt> {
        self.crl_number.as_ref()
    }

    /// Scan the source without deleting any existing entries
    pub fn pre_scan(&mut self) -> CrlResult<&mut Self> {
        self.pre_scan_with(|_: &RevokedEntry| false)
    }

    /// Scan the source, dropping every entry `validator` asks to delete
    pub fn pre_scan_with<V: CrlEntryValidator>(&mut self, validator: V) -> CrlResult<&mut Self> {
        match self.state {
            State::Created => {}
            State::PreScanned(_) => return Err(StateError::AlreadyPreScanned.into()),
            State::Locked(_) => return Err(StateError::AlreadyLocked.into()),
            State::Written => return Err(StateError::AlreadyWritten.into()),
        }

        let mut entries = CrlEntryStream::new(self.source.open()?)?;
        let mut entry_count = 0;
        let mut entries_len = 0;
        let mut dropped = HashSet::new();
        let mut dropped_len = 0;
        let mut deletions = 0;

        for (index, entry) in entries.by_ref().enumerate() {
            let entry = entry?;
            entry_count += 1;
            entries_len += entry.encoded_len();

            let replaced = self.addition_index.contains_key(entry.serial());
            if validator.should_delete(&entry) {
                deletions += 1;
                dropped.insert(index);
                dropped_len += entry.encoded_len();
            } else if replaced {
                debug!("Existing entry for serial {} is replaced", entry.serial());
                dropped.insert(index);
                dropped_len += entry.encoded_len();
            }
        }

        let (prefix, trailer) = entries.into_scanner().finish()?;

        if trailer.extensions.is_none() {
            warn!(
                "The CRL you are modifying is a version 1 CRL. Please investigate moving to a \
                 version 2 CRL by adding the CRL Number and Authority Key Identifier extensions."
            );
        }

        debug!(
            "Pre-scanned {}: {} entries, {} marked for deletion",
            self.source.describe(),
            entry_count,
            deletions
        );

        self.deletions = deletions;
        self.state = State::PreScanned(Box::new(ScanResult {
            prefix,
            trailer,
            entry_count,
            entries_len,
            dropped,
            dropped_len,
            rescan_needed: false,
        }));
        Ok(self)
    }

    /// Freeze the edits and compute the layout of the new CRL
    pub fn lock(&mut self) -> CrlResult<&mut Self> {
        let scan = match &self.state {
            State::Created => return Err(StateError::NotPreScanned.into()),
            State::PreScanned(scan) => scan,
            State::Locked(_) => return Err(StateError::AlreadyLocked.into()),
            State::Written => return Err(StateError::AlreadyWritten.into()),
        };

        let plan = self.plan(scan, Utc::now())?;
        self.crl_number = plan.crl_number.clone();
        self.state = State::Locked(Box::new(plan));
        Ok(self)
    }

    fn source_algorithm(&self, prefix: &TbsPrefix) -> SignatureAlgorithm {
        let oid = expect_tlv(prefix.signature.content(), tag::OID, "algorithm")
            .ok()
            .map(|(oid, _)| oid);

        match oid.and_then(SignatureAlgorithm::from_oid) {
            Some(algorithm) => algorithm,
            None => {
                warn!(
                    "Source CRL is signed with an unsupported algorithm ({}), re-signing with {}",
                    oid.map(hex::encode).unwrap_or_default(),
                    SignatureAlgorithm::Sha256WithRsa
                );
                SignatureAlgorithm::Sha256WithRsa
            }
        }
    }

    /// Drop existing entries shadowed by additions made after the pre-scan
    fn rescan_serials(&self, dropped: &mut HashSet<usize>) -> CrlResult<usize> {
        let mut scanner = CrlScanner::new(self.source.open()?)?;
        let mut extra_len = 0;
        let mut index = 0;

        while let Some(raw) = scanner.next_entry()? {
            if !dropped.contains(&index) {
                let serial = RevokedEntry::serial_from_der(&raw.bytes)?;
                if self.addition_index.contains_key(&serial) {
                    debug!("Existing entry for serial {serial} is replaced");
                    dropped.insert(index);
                    extra_len += raw.bytes.len();
                }
            }
            index += 1;
        }
        Ok(extra_len)
    }

    fn plan(&self, scan: &ScanResult, now: DateTime<Utc>) -> CrlResult<Plan> {
        let prefix = &scan.prefix;

        let mut dropped = scan.dropped.clone();
        let mut dropped_len = scan.dropped_len;
        if scan.rescan_needed && !self.additions.is_empty() {
            dropped_len += self.rescan_serials(&mut dropped)?;
        }
        let kept_len = scan.entries_len - dropped_len;

        let algorithm = match self.signing_algorithm {
            Some(algorithm) => algorithm,
            None => self.source_algorithm(prefix),
        };
        let signature_algorithm = algorithm.algorithm_identifier();

        let this_update = encode_time(&now);
        let next_update = match (self.next_update_policy, prefix.next_update_time) {
            (NextUpdatePolicy::Fixed(validity), _) => Some(now + validity),
            (NextUpdatePolicy::PreserveInterval, Some(old_next)) => {
                Some(now + (old_next - prefix.this_update_time))
            }
            (NextUpdatePolicy::PreserveInterval, None) => None,
        }
        .map(|time| encode_time(&time));

        let (extensions, crl_number) = match &scan.trailer.extensions {
            Some(original) => {
                let key_id = self.key.public_key()?.key_identifier()?;
                let updated = update_extensions(&original.bytes, &key_id)?;
                (Some(updated.encoded), updated.crl_number)
            }
            None => (None, None),
        };

        let new_entries: Vec<Vec<u8>> = self.additions.iter().map(RevokedEntry::to_der).collect();
        let added_len: usize = new_entries.iter().map(Vec::len).sum();

        let needs_v2 = extensions.is_some() || self.additions.iter().any(|e| e.reason().is_some());
        let version = match &prefix.version {
            Some(version) if prefix.is_v2() => Some(version.bytes.clone()),
            _ if needs_v2 => {
                info!("Marking CRL as version 2 for entry extensions");
                Some(VERSION_V2.to_vec())
            }
            other => other.as_ref().map(|v| v.bytes.clone()),
        };

        let tbs_own_len = version.as_ref().map_or(0, Vec::len)
            + signature_algorithm.len()
            + prefix.issuer.bytes.len()
            + this_update.len()
            + next_update.as_ref().map_or(0, Vec::len)
            + extensions.as_ref().map_or(0, Vec::len);
        let signature_value_len = der::encoded_len(self.key.signature_len() + 1);

        let mut cascade = LengthCascade::new();
        let certificate_list = cascade.add_root(
            tag::SEQUENCE,
            signature_algorithm.len() + signature_value_len,
        );
        cascade.set_original(certificate_list, prefix.certificate_list);
        let tbs_cert_list = cascade.add_child(certificate_list, tag::SEQUENCE, tbs_own_len);
        cascade.set_original(tbs_cert_list, prefix.tbs_cert_list);
        let revoked = cascade.add_child(tbs_cert_list, tag::SEQUENCE, kept_len + added_len);
        cascade.omit_if_empty(revoked);
        if let Some(region) = scan.trailer.revoked_certificates {
            cascade.set_original(revoked, region);
        }
        cascade.resolve()?;

        info!(
            "Locked rewrite of {}: {} existing entries, {} dropped, {} added, signing with {}",
            self.source.describe(),
            scan.entry_count,
            dropped.len(),
            self.additions.len(),
            algorithm
        );

        Ok(Plan {
            algorithm,
            crl_number,
            dropped,
            kept_len,
            version,
            signature_algorithm,
            issuer: prefix.issuer.bytes.clone(),
            this_update,
            next_update,
            new_entries,
            extensions,
            cascade,
            certificate_list,
            tbs_cert_list,
            revoked,
        })
    }

    /// Write the rewritten CRL to `out`.
    ///
    /// The source is read a second time; it must not change after the
    /// pre-scan. On error the bytes already written to `out` are not a valid
    /// CRL and must be discarded.
    pub fn write<W: Write + ?Sized>(&mut self, out: &mut W) -> CrlResult<()> {
        match self.state {
            State::Locked(_) => {}
            State::Written => return Err(StateError::AlreadyWritten.into()),
            State::Created | State::PreScanned(_) => return Err(StateError::NotLocked.into()),
        }
        let State::Locked(plan) = mem::replace(&mut self.state, State::Written) else {
            return Err(StateError::NotLocked.into());
        };

        let signer = CrlSigner::new(self.key.clone(), plan.algorithm);
        let mut sink = signer.start()?;

        // The outer header is not covered by the signature
        out.write_all(&plan.cascade.header(plan.certificate_list)?)?;

        {
            let mut tbs = TeeWriter {
                out: &mut *out,
                signer: &mut sink,
            };
            tbs.write_all(&plan.cascade.header(plan.tbs_cert_list)?)?;
            if let Some(version) = &plan.version {
                tbs.write_all(version)?;
            }
            tbs.write_all(&plan.signature_algorithm)?;
            tbs.write_all(&plan.issuer)?;
            tbs.write_all(&plan.this_update)?;
            if let Some(next_update) = &plan.next_update {
                tbs.write_all(next_update)?;
            }

            if plan.cascade.is_present_node(plan.revoked) {
                tbs.write_all(&plan.cascade.header(plan.revoked)?)?;
                self.copy_kept_entries(&plan, &mut tbs)?;
                for entry in &plan.new_entries {
                    tbs.write_all(entry)?;
                }
            }

            if let Some(extensions) = &plan.extensions {
                tbs.write_all(extensions)?;
            }
        }

        let signature = sink.finish()?;
        out.write_all(&plan.signature_algorithm)?;
        let mut bit_string = vec![0x00];
        bit_string.extend_from_slice(&signature);
        out.write_all(&encode_tlv(tag::BIT_STRING, &bit_string))?;
        out.flush()?;

        info!("Wrote re-signed CRL from {}", self.source.describe());
        Ok(())
    }

    fn copy_kept_entries<W: Write>(&self, plan: &Plan, out: &mut W) -> CrlResult<()> {
        if plan.kept_len == 0 {
            return Ok(());
        }

        let mut scanner = CrlScanner::new(self.source.open()?)?;
        let mut copied = 0;
        let mut index = 0;
        while let Some(RawTlv { bytes, .. }) = scanner.next_entry()? {
            if !plan.dropped.contains(&index) {
                copied += bytes.len();
                if copied > plan.kept_len {
                    break;
                }
                out.write_all(&bytes)?;
            }
            index += 1;
        }

        if copied != plan.kept_len {
            return Err(CrlError::format(
                "The CRL changed between pre-scan and write",
            ));
        }
        Ok(())
    }
}

impl<S> fmt::Debug for CrlStreamWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrlStreamWriter")
            .field("state", &self.state)
            .field("additions", &self.additions.len())
            .field("deletions", &self.deletions)
            .field("signing_algorithm", &self.signing_algorithm)
            .finish_non_exhaustive()
    }
}

/// Sends `tbsCertList` bytes to the output and the signature at once
struct TeeWriter<'a, W: ?Sized, S> {
    out: &'a mut W,
    signer: &'a mut S,
}

impl<W: Write + ?Sized, S: Write> Write for TeeWriter<'_, W, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.out.write(buf)?;
        self.signer.write_all(&buf[..n])?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
