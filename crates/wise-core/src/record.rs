//! Record codec
//!
//! A pair is encoded as `field_id:u8`, `len+1:u8`, the UTF-8 bytes and a
//! trailing NUL. A partial record is one source's pairs with their count
//! kept alongside. A merged record puts the summed count in a leading byte
//! followed by every contributing payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Ran out of bytes mid-record
    #[error("truncated record: needed {needed} bytes at offset {offset}")]
    Truncated {
        /// Offset the read started at
        offset: usize,
        /// Bytes required
        needed: usize,
    },

    /// A pair's length byte disagrees with its terminator
    #[error("inconsistent pair length at offset {0}")]
    InconsistentLength(usize),

    /// Count would not fit the one-byte prefix
    #[error("too many pairs: {0} (max 255)")]
    TooManyPairs(usize),

    /// Value bytes are not UTF-8
    #[error("invalid UTF-8 in field {0}")]
    InvalidUtf8(u8),
}

/// Value truncation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueLimits {
    /// Values longer than this many bytes get cut
    pub max_len: usize,
    /// Length they get cut to
    pub truncate_to: usize,
}

impl ValueLimits {
    /// Largest value length whose `len+1` still fits in a byte
    pub const CEILING: usize = 254;

    /// Build a policy, clamped so both limits fit the one-byte length
    pub fn new(max_len: usize, truncate_to: usize) -> Self {
        let max_len = max_len.min(Self::CEILING);
        Self {
            max_len,
            truncate_to: truncate_to.min(max_len),
        }
    }

    fn apply<'a>(&self, value: &'a str) -> &'a str {
        if value.len() <= self.max_len {
            return value;
        }
        let mut end = self.truncate_to;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        &value[..end]
    }
}

impl Default for ValueLimits {
    fn default() -> Self {
        Self {
            max_len: 250,
            truncate_to: 240,
        }
    }
}

/// One source's answer for one indicator
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialRecord {
    count: u8,
    data: Bytes,
}

impl PartialRecord {
    /// Matched, with no attributes
    pub fn empty() -> Self {
        Self::default()
    }

    /// Encode pairs in argument order
    pub fn encode<S: AsRef<str>>(
        pairs: &[(u8, S)],
        limits: &ValueLimits,
    ) -> Result<Self, CodecError> {
        if pairs.len() > u8::MAX as usize {
            return Err(CodecError::TooManyPairs(pairs.len()));
        }

        let mut buf = BytesMut::new();
        for (id, value) in pairs {
            let value = limits.apply(value.as_ref());
            buf.put_u8(*id);
            buf.put_u8(value.len() as u8 + 1);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }

        Ok(Self {
            count: pairs.len() as u8,
            data: buf.freeze(),
        })
    }

    /// Wrap pre-encoded pair bytes, checking them against `count`
    pub fn from_parts(count: u8, data: Bytes) -> Result<Self, CodecError> {
        let consumed = scan_pairs(count, &data, 0)?;
        if consumed != data.len() {
            return Err(CodecError::InconsistentLength(consumed));
        }
        Ok(Self { count, data })
    }

    /// Pair count
    #[inline]
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Encoded pairs without a count prefix
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    /// Decode back into pairs
    pub fn decode(&self) -> Result<Vec<(u8, String)>, CodecError> {
        decode_pairs(self.count, &self.data)
    }
}

/// What the engine caches and returns per indicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRecord {
    count: u8,
    data: Bytes,
}

impl MergedRecord {
    /// Zero-count record, the "confirmed absent" answer
    pub fn empty() -> Self {
        Self {
            count: 0,
            data: Bytes::new(),
        }
    }

    /// Concatenate every present record in the given order.
    ///
    /// Absent entries contribute nothing. Fails instead of wrapping when the
    /// summed count would not fit in one byte.
    pub fn merge<'a, I>(records: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = Option<&'a PartialRecord>>,
    {
        let present: Vec<&PartialRecord> = records.into_iter().flatten().collect();
        let total: usize = present.iter().map(|r| r.count as usize).sum();
        if total > u8::MAX as usize {
            return Err(CodecError::TooManyPairs(total));
        }

        let mut buf = BytesMut::with_capacity(present.iter().map(|r| r.data.len()).sum());
        for record in &present {
            buf.put_slice(&record.data);
        }
        Ok(Self {
            count: total as u8,
            data: buf.freeze(),
        })
    }

    /// Like [`merge`](Self::merge) but keeps the leading records that fit
    /// and drops the rest, logging the overflow.
    pub fn merge_fitting<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = Option<&'a PartialRecord>>,
    {
        let mut total = 0usize;
        let mut dropped = 0usize;
        let mut buf = BytesMut::new();
        for record in records.into_iter().flatten() {
            if total + record.count as usize > u8::MAX as usize {
                dropped += record.count as usize;
                continue;
            }
            total += record.count as usize;
            buf.put_slice(&record.data);
        }
        if dropped > 0 {
            error!(
                "Merged record overflow, dropped {} of {} pairs",
                dropped,
                total + dropped
            );
        }
        Self {
            count: total as u8,
            data: buf.freeze(),
        }
    }

    /// Read one merged record from the front of `buf`, returning it and the
    /// number of bytes consumed
    pub fn parse_prefix(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let count = *buf.first().ok_or(CodecError::Truncated {
            offset: 0,
            needed: 1,
        })?;
        let end = scan_pairs(count, buf, 1)?;
        Ok((
            Self {
                count,
                data: Bytes::copy_from_slice(&buf[1..end]),
            },
            end,
        ))
    }

    /// Pair count
    #[inline]
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Encoded pairs without the count byte
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    /// Size on the wire
    pub fn encoded_len(&self) -> usize {
        1 + self.data.len()
    }

    /// Append the wire form to `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.count);
        buf.put_slice(&self.data);
    }

    /// Wire form
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Decode into pairs
    pub fn decode(&self) -> Result<Vec<(u8, String)>, CodecError> {
        decode_pairs(self.count, &self.data)
    }

    /// Human-readable form, field IDs resolved through `name_of`
    pub fn render<F>(&self, name_of: F) -> Result<Vec<RenderedPair>, CodecError>
    where
        F: Fn(u8) -> Option<String>,
    {
        Ok(self
            .decode()?
            .into_iter()
            .map(|(id, value)| RenderedPair {
                field: name_of(id).unwrap_or_else(|| format!("#{id}")),
                len: value.len(),
                value,
            })
            .collect())
    }
}

impl Default for MergedRecord {
    fn default() -> Self {
        Self::empty()
    }
}

/// One decoded pair for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedPair {
    /// Field name
    pub field: String,
    /// Value length in bytes
    pub len: usize,
    /// Value
    pub value: String,
}

/// Walk `count` pairs starting at `start`, returning the end offset
fn scan_pairs(count: u8, buf: &[u8], start: usize) -> Result<usize, CodecError> {
    let mut offset = start;
    for _ in 0..count {
        if buf.len() < offset + 2 {
            return Err(CodecError::Truncated { offset, needed: 2 });
        }
        let len = buf[offset + 1] as usize;
        if len == 0 {
            return Err(CodecError::InconsistentLength(offset));
        }
        let end = offset + 2 + len;
        if buf.len() < end {
            return Err(CodecError::Truncated {
                offset,
                needed: 2 + len,
            });
        }
        if buf[end - 1] != 0 {
            return Err(CodecError::InconsistentLength(offset));
        }
        offset = end;
    }
    Ok(offset)
}

fn decode_pairs(count: u8, buf: &[u8]) -> Result<Vec<(u8, String)>, CodecError> {
    let mut pairs = Vec::with_capacity(count as usize);
    let mut offset = 0;
    for _ in 0..count {
        if buf.len() < offset + 2 {
            return Err(CodecError::Truncated { offset, needed: 2 });
        }
        let id = buf[offset];
        let len = buf[offset + 1] as usize;
        if len == 0 {
            return Err(CodecError::InconsistentLength(offset));
        }
        let end = offset + 2 + len;
        if buf.len() < end {
            return Err(CodecError::Truncated {
                offset,
                needed: 2 + len,
            });
        }
        if buf[end - 1] != 0 {
            return Err(CodecError::InconsistentLength(offset));
        }
        let value = std::str::from_utf8(&buf[offset + 2..end - 1])
            .map_err(|_| CodecError::InvalidUtf8(id))?;
        pairs.push((id, value.to_string()));
        offset = end;
    }
    if offset != buf.len() {
        return Err(CodecError::InconsistentLength(offset));
    }
    Ok(pairs)
}
