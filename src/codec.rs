//! Binary framing and field-tagged encoding of journal frames
//!
//! # Frame format
//! ```text
//! [marker: u8][length][inner payload]
//!   0xc4  length is u8            (payload ≤ 255 bytes, header 2 bytes)
//!   0xc5  length is u16 big-endian (header 3 bytes)
//!   0xc6  length is u32 big-endian (header 5 bytes)
//! ```
//! The encoder picks the smallest marker that fits. Any other first
//! byte is corruption, never "wait for more".
//!
//! # Inner payload
//! A flat sequence of tagged fields, each `[tag: u8][wire: u8][value]`:
//! ```text
//!   wire 0x01  u8      1 byte
//!   wire 0x02  i64     8 bytes little-endian
//!   wire 0x03  u64     8 bytes little-endian
//!   wire 0x04  str     u32 LE byte length + UTF-8 bytes
//!   wire 0x05  bytes   u32 LE byte length + raw bytes
//! ```
//! Readers skip fields with unrecognized tags (the wire code says how
//! far), so fields can be added later without breaking old readers.
//! Fields absent from a frame decode to zero/empty.
//!
//! # Read protocol
//! Decoding peeks: first the 2–5 header bytes, then the full declared
//! frame, and consumes nothing until the whole frame is present. A
//! torn trailing frame therefore surfaces as [`CodecError::NeedMoreBytes`]
//! (resumable, or end-of-stream at EOF), while a bad marker or an
//! inconsistent inner payload is [`CodecError::CorruptFrame`], fatal.

use crate::record::{EventRecord, RecordKind, SessionHeader};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    /// The buffer ends before the frame does. Not a failure: read more,
    /// or stop cleanly at end of file.
    #[error("need more bytes: have {have}, need {need}")]
    NeedMoreBytes { have: usize, need: usize },

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
}

impl CodecError {
    /// True for the resumable "incomplete" case.
    pub fn is_need_more(&self) -> bool {
        matches!(self, CodecError::NeedMoreBytes { .. })
    }
}

// ── Frame header ────────────────────────────────────────────────────

const BIN8: u8 = 0xc4;
const BIN16: u8 = 0xc5;
const BIN32: u8 = 0xc6;

/// Reject declared payload lengths beyond this as corruption rather
/// than attempting the allocation.
const MAX_INNER_LEN: usize = 100_000_000;

/// Decoded frame header: where the payload starts and ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Marker + length field size (2, 3, or 5 bytes).
    pub header_len: usize,
    /// Declared inner payload size.
    pub payload_len: usize,
}

impl FrameInfo {
    /// Total frame size: header plus payload.
    pub fn total_len(&self) -> usize {
        self.header_len + self.payload_len
    }
}

/// Wrap an inner payload in the smallest frame header that fits.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let n = payload.len();
    let mut buf = Vec::with_capacity(5 + n);
    if n <= u8::MAX as usize {
        buf.push(BIN8);
        buf.push(n as u8);
    } else if n <= u16::MAX as usize {
        buf.push(BIN16);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else {
        buf.push(BIN32);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    }
    buf.extend_from_slice(payload);
    buf
}

/// Decode a frame header from the front of `buf` without consuming it.
pub fn peek_frame(buf: &[u8]) -> Result<FrameInfo, CodecError> {
    if buf.len() < 2 {
        return Err(CodecError::NeedMoreBytes {
            have: buf.len(),
            need: 2,
        });
    }
    let (header_len, payload_len) = match buf[0] {
        BIN8 => (2, buf[1] as usize),
        BIN16 => {
            if buf.len() < 3 {
                return Err(CodecError::NeedMoreBytes {
                    have: buf.len(),
                    need: 3,
                });
            }
            (3, u16::from_be_bytes([buf[1], buf[2]]) as usize)
        }
        BIN32 => {
            if buf.len() < 5 {
                return Err(CodecError::NeedMoreBytes {
                    have: buf.len(),
                    need: 5,
                });
            }
            (5, u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize)
        }
        other => {
            return Err(CodecError::CorruptFrame(format!(
                "unrecognized frame marker 0x{:02x}",
                other
            )))
        }
    };
    if payload_len > MAX_INNER_LEN {
        return Err(CodecError::CorruptFrame(format!(
            "implausible payload length {} (likely corruption)",
            payload_len
        )));
    }
    Ok(FrameInfo {
        header_len,
        payload_len,
    })
}

/// Borrow the inner payload of the frame at the front of `buf`.
///
/// Returns `(payload, total bytes consumed)`; consumes nothing until
/// the whole frame is present.
fn take_frame(buf: &[u8]) -> Result<(&[u8], usize), CodecError> {
    let info = peek_frame(buf)?;
    let total = info.total_len();
    if buf.len() < total {
        return Err(CodecError::NeedMoreBytes {
            have: buf.len(),
            need: total,
        });
    }
    Ok((&buf[info.header_len..total], total))
}

// ── Tagged fields ───────────────────────────────────────────────────

const WIRE_U8: u8 = 0x01;
const WIRE_I64: u8 = 0x02;
const WIRE_U64: u8 = 0x03;
const WIRE_STR: u8 = 0x04;
const WIRE_BYTES: u8 = 0x05;

/// Field tags for [`EventRecord`] frames. Stable on disk; append-only.
mod record_tag {
    pub const KIND: u8 = 0;
    pub const TIMESTAMP: u8 = 1;
    pub const SEQUENCE: u8 = 2;
    pub const RENDERED: u8 = 3;
    pub const IMAGE_HOST: u8 = 4;
    pub const IMAGE_PATH: u8 = 5;
    pub const IMAGE_BYTES: u8 = 6;
    pub const IMAGE_PATH_HASH: u8 = 7;
}

/// Field tags for [`SessionHeader`] frames.
mod header_tag {
    pub const CREATED: u8 = 0;
    pub const SESSION_ID: u8 = 1;
    pub const USER: u8 = 2;
    pub const HOST: u8 = 3;
    pub const PATH: u8 = 4;
}

struct FieldEncoder {
    buf: Vec<u8>,
}

impl FieldEncoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u8(&mut self, tag: u8, v: u8) {
        self.buf.push(tag);
        self.buf.push(WIRE_U8);
        self.buf.push(v);
    }

    fn put_i64(&mut self, tag: u8, v: i64) {
        self.buf.push(tag);
        self.buf.push(WIRE_I64);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, tag: u8, v: u64) {
        self.buf.push(tag);
        self.buf.push(WIRE_U64);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, tag: u8, v: &str) {
        self.buf.push(tag);
        self.buf.push(WIRE_STR);
        self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(v.as_bytes());
    }

    fn put_bytes(&mut self, tag: u8, v: &[u8]) {
        self.buf.push(tag);
        self.buf.push(WIRE_BYTES);
        self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(v);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// One decoded field value, borrowing str/bytes from the frame.
enum FieldValue<'a> {
    U8(u8),
    I64(i64),
    U64(u64),
    Str(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    fn wire_name(&self) -> &'static str {
        match self {
            FieldValue::U8(_) => "u8",
            FieldValue::I64(_) => "i64",
            FieldValue::U64(_) => "u64",
            FieldValue::Str(_) => "str",
            FieldValue::Bytes(_) => "bytes",
        }
    }

    fn expect_u8(self, tag: u8) -> Result<u8, CodecError> {
        match self {
            FieldValue::U8(v) => Ok(v),
            other => Err(type_mismatch(tag, "u8", other.wire_name())),
        }
    }

    fn expect_i64(self, tag: u8) -> Result<i64, CodecError> {
        match self {
            FieldValue::I64(v) => Ok(v),
            other => Err(type_mismatch(tag, "i64", other.wire_name())),
        }
    }

    fn expect_u64(self, tag: u8) -> Result<u64, CodecError> {
        match self {
            FieldValue::U64(v) => Ok(v),
            other => Err(type_mismatch(tag, "u64", other.wire_name())),
        }
    }

    fn expect_str(self, tag: u8) -> Result<&'a str, CodecError> {
        match self {
            FieldValue::Str(v) => Ok(v),
            other => Err(type_mismatch(tag, "str", other.wire_name())),
        }
    }

    fn expect_bytes(self, tag: u8) -> Result<&'a [u8], CodecError> {
        match self {
            FieldValue::Bytes(v) => Ok(v),
            other => Err(type_mismatch(tag, "bytes", other.wire_name())),
        }
    }
}

fn type_mismatch(tag: u8, want: &str, found: &str) -> CodecError {
    CodecError::CorruptFrame(format!(
        "field {}: expected {}, found {}",
        tag, want, found
    ))
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next `(tag, value)` pair, or `None` at the end of the payload.
    ///
    /// A payload that ends mid-field is corruption: the outer frame
    /// was complete, so the inner truncation cannot be a torn write.
    fn next_field(&mut self) -> Result<Option<(u8, FieldValue<'a>)>, CodecError> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        if self.buf.len() - self.pos < 2 {
            return Err(CodecError::CorruptFrame(
                "dangling field tag at end of payload".into(),
            ));
        }
        let tag = self.buf[self.pos];
        let wire = self.buf[self.pos + 1];
        self.pos += 2;

        let value = match wire {
            WIRE_U8 => FieldValue::U8(self.fixed::<1>(tag)?[0]),
            WIRE_I64 => FieldValue::I64(i64::from_le_bytes(self.fixed::<8>(tag)?)),
            WIRE_U64 => FieldValue::U64(u64::from_le_bytes(self.fixed::<8>(tag)?)),
            WIRE_STR => {
                let raw = self.length_prefixed(tag)?;
                let s = std::str::from_utf8(raw).map_err(|e| {
                    CodecError::CorruptFrame(format!("field {}: invalid utf-8: {}", tag, e))
                })?;
                FieldValue::Str(s)
            }
            WIRE_BYTES => FieldValue::Bytes(self.length_prefixed(tag)?),
            other => {
                return Err(CodecError::CorruptFrame(format!(
                    "field {}: unknown wire type 0x{:02x}",
                    tag, other
                )))
            }
        };
        Ok(Some((tag, value)))
    }

    fn fixed<const N: usize>(&mut self, tag: u8) -> Result<[u8; N], CodecError> {
        if self.buf.len() - self.pos < N {
            return Err(CodecError::CorruptFrame(format!(
                "field {}: truncated value",
                tag
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn length_prefixed(&mut self, tag: u8) -> Result<&'a [u8], CodecError> {
        let len = u32::from_le_bytes(self.fixed::<4>(tag)?) as usize;
        if self.buf.len() - self.pos < len {
            return Err(CodecError::CorruptFrame(format!(
                "field {}: declared length {} exceeds remaining payload {}",
                tag,
                len,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }
}

// ── Record frames ───────────────────────────────────────────────────

/// Encode one record as a complete frame.
pub fn encode_record(record: &EventRecord) -> Vec<u8> {
    let mut enc = FieldEncoder::new();
    enc.put_u8(record_tag::KIND, record.kind as u8);
    enc.put_i64(record_tag::TIMESTAMP, record.timestamp);
    enc.put_u64(record_tag::SEQUENCE, record.sequence);
    enc.put_str(record_tag::RENDERED, &record.rendered);
    // Image fields travel only when populated.
    if !record.image_host.is_empty() {
        enc.put_str(record_tag::IMAGE_HOST, &record.image_host);
    }
    if !record.image_path.is_empty() {
        enc.put_str(record_tag::IMAGE_PATH, &record.image_path);
    }
    if !record.image_bytes.is_empty() {
        enc.put_bytes(record_tag::IMAGE_BYTES, &record.image_bytes);
    }
    if !record.image_path_hash.is_empty() {
        enc.put_str(record_tag::IMAGE_PATH_HASH, &record.image_path_hash);
    }
    frame(&enc.finish())
}

/// Decode one record frame from the front of `buf`.
///
/// Returns `(record, bytes consumed)`. `NeedMoreBytes` means the frame
/// is not fully present yet (torn tail at EOF).
pub fn decode_record(buf: &[u8]) -> Result<(EventRecord, usize), CodecError> {
    let (inner, consumed) = take_frame(buf)?;

    let mut kind: Option<RecordKind> = None;
    let mut timestamp = 0i64;
    let mut sequence = 0u64;
    let mut rendered = String::new();
    let mut image_host = String::new();
    let mut image_path = String::new();
    let mut image_bytes = Vec::new();
    let mut image_path_hash = String::new();

    let mut reader = FieldReader::new(inner);
    while let Some((tag, value)) = reader.next_field()? {
        match tag {
            record_tag::KIND => {
                let v = value.expect_u8(tag)?;
                kind = Some(RecordKind::from_u8(v).ok_or_else(|| {
                    CodecError::CorruptFrame(format!("unknown record kind {}", v))
                })?);
            }
            record_tag::TIMESTAMP => timestamp = value.expect_i64(tag)?,
            record_tag::SEQUENCE => sequence = value.expect_u64(tag)?,
            record_tag::RENDERED => rendered = value.expect_str(tag)?.to_string(),
            record_tag::IMAGE_HOST => image_host = value.expect_str(tag)?.to_string(),
            record_tag::IMAGE_PATH => image_path = value.expect_str(tag)?.to_string(),
            record_tag::IMAGE_BYTES => image_bytes = value.expect_bytes(tag)?.to_vec(),
            record_tag::IMAGE_PATH_HASH => {
                image_path_hash = value.expect_str(tag)?.to_string()
            }
            _ => {} // field from a newer writer; ignore
        }
    }

    let kind = kind
        .ok_or_else(|| CodecError::CorruptFrame("record frame missing kind field".into()))?;

    Ok((
        EventRecord {
            kind,
            sequence,
            timestamp,
            rendered,
            image_host,
            image_path,
            image_bytes,
            image_path_hash,
        },
        consumed,
    ))
}

// ── Header frames ───────────────────────────────────────────────────

/// Encode the session header as a complete frame.
pub fn encode_header(header: &SessionHeader) -> Vec<u8> {
    let mut enc = FieldEncoder::new();
    enc.put_i64(header_tag::CREATED, header.created);
    enc.put_str(header_tag::SESSION_ID, &header.session_id);
    enc.put_str(header_tag::USER, &header.user);
    enc.put_str(header_tag::HOST, &header.host);
    enc.put_str(header_tag::PATH, &header.path);
    frame(&enc.finish())
}

/// Decode the session header frame from the front of `buf`.
pub fn decode_header(buf: &[u8]) -> Result<(SessionHeader, usize), CodecError> {
    let (inner, consumed) = take_frame(buf)?;

    let mut header = SessionHeader {
        created: 0,
        session_id: String::new(),
        user: String::new(),
        host: String::new(),
        path: String::new(),
    };

    let mut reader = FieldReader::new(inner);
    while let Some((tag, value)) = reader.next_field()? {
        match tag {
            header_tag::CREATED => header.created = value.expect_i64(tag)?,
            header_tag::SESSION_ID => header.session_id = value.expect_str(tag)?.to_string(),
            header_tag::USER => header.user = value.expect_str(tag)?.to_string(),
            header_tag::HOST => header.host = value.expect_str(tag)?.to_string(),
            header_tag::PATH => header.path = value.expect_str(tag)?.to_string(),
            _ => {}
        }
    }

    Ok((header, consumed))
}

// ── Tests ───────────────────────────────────────────────────────────
