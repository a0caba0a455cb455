//! Minimal DER support for walking a CRL without materialising it.
//!
//! Only single-octet tags and definite lengths are accepted, which covers
//! every element of RFC 5280 `CertificateList`.

use std::io::{self, Read, Write};

use num_bigint::BigInt;

use super::errors::{CrlError, CrlResult};

/// ASN.1 tags used in CRLs
pub mod tag {
    pub const BOOLEAN: u8 = 0x01;
    pub const INTEGER: u8 = 0x02;
    pub const BIT_STRING: u8 = 0x03;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OID: u8 = 0x06;
    pub const ENUMERATED: u8 = 0x0A;
    pub const UTF8_STRING: u8 = 0x0C;
    pub const UTC_TIME: u8 = 0x17;
    pub const GENERALIZED_TIME: u8 = 0x18;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;
    /// `[0]` constructed, context specific
    pub const CONTEXT_0: u8 = 0xA0;
}

const MAX_LENGTH_OCTETS: usize = 4;

/// Tag and length of a TLV as found on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u8,
    /// Content length
    pub length: usize,
    /// Bytes used by tag and length octets, which may exceed the minimal form
    pub header_len: usize,
}

impl Header {
    pub fn total_len(&self) -> usize {
        self.header_len + self.length
    }
}

/// Byte range of a structural element in the source CRL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvRegion {
    pub offset: u64,
    pub header: Header,
}

impl TlvRegion {
    pub fn tag(&self) -> u8 {
        self.header.tag
    }

    pub fn content_len(&self) -> usize {
        self.header.length
    }

    pub fn total_len(&self) -> usize {
        self.header.total_len()
    }

    /// Offset one past the last content byte
    pub fn end(&self) -> u64 {
        self.offset + self.total_len() as u64
    }

    /// Fail unless this element ends inside `parent`
    pub fn ensure_within(&self, parent: &TlvRegion, what: &str) -> CrlResult<()> {
        if self.end() > parent.end() {
            return Err(CrlError::format(format!(
                "{what} at offset {} overruns its enclosing element",
                self.offset
            )));
        }
        Ok(())
    }
}

/// A small element read whole, together with where it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTlv {
    pub region: TlvRegion,
    /// Complete encoding, header included
    pub bytes: Vec<u8>,
}

impl RawTlv {
    pub fn content(&self) -> &[u8] {
        &self.bytes[self.region.header.header_len..]
    }
}

/// Number of octets needed to encode a content length
pub fn length_octets(len: usize) -> usize {
    if len < 0x80 {
        1
    } else {
        let significant = (usize::BITS - len.leading_zeros()).div_ceil(8) as usize;
        1 + significant
    }
}

/// Tag plus minimal length octets
pub fn header_len(len: usize) -> usize {
    1 + length_octets(len)
}

/// Full size of a TLV holding `len` content bytes
pub fn encoded_len(len: usize) -> usize {
    header_len(len) + len
}

pub fn encode_header(tag: u8, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(len));
    out.push(tag);
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let octets = length_octets(len) - 1;
        out.push(0x80 | octets as u8);
        for i in (0..octets).rev() {
            out.push((len >> (i * 8)) as u8);
        }
    }
    out
}

pub fn encode_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = encode_header(tag, content.len());
    out.extend_from_slice(content);
    out
}

/// Wrap already encoded elements in a constructed TLV
pub fn encode_constructed(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut out = encode_header(tag, len);
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

pub fn encode_sequence(parts: &[&[u8]]) -> Vec<u8> {
    encode_constructed(tag::SEQUENCE, parts)
}

pub fn encode_integer(value: &BigInt) -> Vec<u8> {
    encode_tlv(tag::INTEGER, &value.to_signed_bytes_be())
}

pub fn decode_integer(content: &[u8]) -> CrlResult<BigInt> {
    if content.is_empty() {
        return Err(CrlError::format("Empty INTEGER"));
    }
    Ok(BigInt::from_signed_bytes_be(content))
}

fn read_byte<R: Read>(reader: &mut R) -> CrlResult<u8> {
    let mut byte = [0u8; 1];
    read_exact(reader, &mut byte)?;
    Ok(byte[0])
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> CrlResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CrlError::format("Truncated DER data"),
        _ => CrlError::Io(e),
    })
}

/// Decode tag and length octets from a byte source
pub fn read_header<R: Read>(reader: &mut R) -> CrlResult<Header> {
    let tag = read_byte(reader)?;
    if tag & 0x1F == 0x1F {
        return Err(CrlError::format(format!(
            "High tag number form is not supported (tag 0x{tag:02X})"
        )));
    }

    let first = read_byte(reader)?;
    if first & 0x80 == 0 {
        return Ok(Header {
            tag,
            length: first as usize,
            header_len: 2,
        });
    }

    let octets = (first & 0x7F) as usize;
    if octets == 0 {
        return Err(CrlError::format("Indefinite length is not allowed in DER"));
    }
    if octets > MAX_LENGTH_OCTETS {
        return Err(CrlError::format(format!(
            "Length with {octets} octets is too large"
        )));
    }

    let mut length = 0usize;
    for _ in 0..octets {
        length = (length << 8) | read_byte(reader)? as usize;
    }
    Ok(Header {
        tag,
        length,
        header_len: 2 + octets,
    })
}

/// Split one TLV off the front of `data`, returning its header, content and the remainder
pub fn parse_tlv(data: &[u8]) -> CrlResult<(Header, &[u8], &[u8])> {
    let mut cursor = data;
    let header = read_header(&mut cursor)?;
    if header.length > cursor.len() {
        return Err(CrlError::format(format!(
            "TLV length {} exceeds available data",
            header.length
        )));
    }
    let (content, rest) = cursor.split_at(header.length);
    Ok((header, content, rest))
}

/// Like [`parse_tlv`] but insists on a particular tag
pub fn expect_tlv<'a>(data: &'a [u8], tag: u8, what: &str) -> CrlResult<(&'a [u8], &'a [u8])> {
    let (header, content, rest) = parse_tlv(data)?;
    if header.tag != tag {
        return Err(CrlError::format(format!(
            "Expected {what} (tag 0x{tag:02X}), found tag 0x{:02X}",
            header.tag
        )));
    }
    Ok((content, rest))
}

/// Reader that knows how many bytes it has handed out
#[derive(Debug)]
pub struct TrackingReader<R> {
    inner: R,
    position: u64,
}

impl<R: Read> TrackingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read the next header and remember where it started
    pub fn read_region(&mut self) -> CrlResult<TlvRegion> {
        let offset = self.position;
        let header = read_header(self)?;
        Ok(TlvRegion { offset, header })
    }

    /// Read a header expected to carry `tag`
    pub fn expect_region(&mut self, tag: u8, what: &str) -> CrlResult<TlvRegion> {
        let region = self.read_region()?;
        if region.tag() != tag {
            return Err(CrlError::format(format!(
                "Expected {what} (tag 0x{tag:02X}) at offset {}, found tag 0x{:02X}",
                region.offset,
                region.tag()
            )));
        }
        Ok(region)
    }

    /// Read the content belonging to `region`, whose header was just consumed
    fn read_content(&mut self, region: &TlvRegion) -> CrlResult<Vec<u8>> {
        let mut content = vec![0u8; region.content_len()];
        read_exact(self, &mut content)?;
        Ok(content)
    }

    /// Read the content of `region` and return the element whole
    pub fn read_raw(&mut self, region: TlvRegion) -> CrlResult<RawTlv> {
        let mut bytes = encode_header_as_found(&region);
        bytes.extend_from_slice(&self.read_content(&region)?);
        Ok(RawTlv { region, bytes })
    }

    /// Read a complete TLV that must end inside `parent`. The bound is
    /// checked before any content is buffered.
    pub fn read_tlv_within(&mut self, parent: &TlvRegion, what: &str) -> CrlResult<RawTlv> {
        let region = self.read_region()?;
        region.ensure_within(parent, what)?;
        self.read_raw(region)
    }

    /// Discard `len` bytes without buffering them
    pub fn skip(&mut self, len: usize) -> CrlResult<()> {
        let copied = io::copy(&mut self.by_ref().take(len as u64), &mut io::sink())?;
        if copied != len as u64 {
            return Err(CrlError::format("Truncated DER data"));
        }
        Ok(())
    }

    /// Stream `len` bytes to `out` without buffering them
    pub fn copy_to<W: Write>(&mut self, len: usize, out: &mut W) -> CrlResult<()> {
        let copied = io::copy(&mut self.by_ref().take(len as u64), out)?;
        if copied != len as u64 {
            return Err(CrlError::format("Truncated DER data"));
        }
        Ok(())
    }
}

impl<R: Read> Read for TrackingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Re-create the header bytes exactly as they appeared, including a
/// non-minimal length width.
fn encode_header_as_found(region: &TlvRegion) -> Vec<u8> {
    let header = &region.header;
    let mut out = Vec::with_capacity(header.header_len);
    out.push(header.tag);
    if header.header_len == 2 && header.length < 0x80 {
        out.push(header.length as u8);
    } else {
        let octets = header.header_len - 2;
        out.push(0x80 | octets as u8);
        for i in (0..octets).rev() {
            out.push((header.length >> (i * 8)) as u8);
        }
    }
    out
}
