//! `/get` and `/fields` wire formats
//!
//! Request: repeated `(type:u8, len:u16, value)` items until the body ends.
//! A type byte with the high bit set is followed by `type & 0x7f` bytes of
//! type name. Everything is big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;
use wise_common::IndicatorType;
use wise_core::{CodecError, FieldRegistry, Indicator, MergedRecord};

/// Response layout carrying the field table digest
pub const RESPONSE_V2: u32 = 2;

const NAMED_TYPE: u8 = 0x80;

/// Split a request body into indicators.
///
/// Items whose type or value cannot be understood stay in the list as
/// `None` so that response records line up with the request. A truncated
/// trailing item ends the parse.
pub fn parse_batch(body: &[u8]) -> Vec<Option<Indicator>> {
    let mut items = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let code = body[pos];
        pos += 1;

        let itype = if code & NAMED_TYPE != 0 {
            let n = (code & !NAMED_TYPE) as usize;
            let Some(name) = body.get(pos..pos + n) else {
                warn!("Truncated type name at offset {}", pos);
                break;
            };
            pos += n;
            match std::str::from_utf8(name).map(str::parse::<IndicatorType>) {
                Ok(Ok(itype)) => Some(itype),
                _ => {
                    warn!("Unknown type name {:?}", String::from_utf8_lossy(name));
                    None
                }
            }
        } else {
            match IndicatorType::from_code(code) {
                Ok(itype) => Some(itype),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            }
        };

        let Some(len) = body.get(pos..pos + 2) else {
            warn!("Truncated value length at offset {}", pos);
            break;
        };
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        pos += 2;
        let Some(value) = body.get(pos..pos + len) else {
            warn!("Truncated value at offset {}, wanted {} bytes", pos, len);
            break;
        };
        pos += len;

        let item = match (itype, std::str::from_utf8(value)) {
            (Some(itype), Ok(value)) => Some(Indicator::new(itype, value)),
            (Some(itype), Err(_)) => {
                warn!("Non UTF-8 {} value dropped", itype);
                None
            }
            (None, _) => None,
        };
        items.push(item);
    }

    items
}

/// Encode a request body, the inverse of [`parse_batch`]
pub fn encode_batch(items: &[Indicator]) -> Bytes {
    let mut buf = BytesMut::with_capacity(items.iter().map(|i| 3 + i.value.len()).sum());
    for item in items {
        let value = &item.value.as_bytes()[..item.value.len().min(u16::MAX as usize)];
        buf.put_u8(item.itype.code());
        buf.put_u16(value.len() as u16);
        buf.put_slice(value);
    }
    buf.freeze()
}

/// Plain response: `version:u32`, `0:u32`, records
pub fn encode_response(version: u32, records: &[MergedRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + records.iter().map(|r| r.encoded_len()).sum::<usize>());
    buf.put_u32(version);
    buf.put_u32(0);
    for record in records {
        record.write_to(&mut buf);
    }
    buf.freeze()
}

/// Digest response: `0:u32`, `2:u32`, 32-byte md5 hex, then the field table
/// unless the client already holds it (else `0:u16`), then records
pub fn encode_response_v2<S: AsRef<str>>(
    fields: &FieldRegistry,
    client_hashes: &[S],
    records: &[MergedRecord],
) -> Bytes {
    let (export, md5_hex) = fields.export_v1_with_md5();
    let known = client_hashes.iter().any(|h| h.as_ref() == md5_hex);

    let mut buf = BytesMut::with_capacity(
        44 + export.len() + records.iter().map(|r| r.encoded_len()).sum::<usize>(),
    );
    buf.put_u32(0);
    buf.put_u32(RESPONSE_V2);
    buf.put_slice(md5_hex.as_bytes());
    if known {
        buf.put_u16(0);
    } else {
        buf.put_slice(&export[8..]);
    }
    for record in records {
        record.write_to(&mut buf);
    }
    buf.freeze()
}

fn need(buf: &[u8], offset: usize, needed: usize) -> Result<(), CodecError> {
    if buf.len() < offset + needed {
        Err(CodecError::Truncated { offset, needed })
    } else {
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    need(buf, offset, 4)?;
    Ok(u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ]))
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    need(buf, offset, 2)?;
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

/// Decode a plain response into its field version and records
pub fn decode_response(body: &[u8]) -> Result<(u32, Vec<MergedRecord>), CodecError> {
    let version = read_u32(body, 0)?;
    let mut pos = 8;
    need(body, 0, pos)?;

    let mut records = Vec::new();
    while pos < body.len() {
        let (record, used) = MergedRecord::parse_prefix(&body[pos..]).map_err(|e| match e {
            CodecError::Truncated { offset, needed } => CodecError::Truncated {
                offset: pos + offset,
                needed,
            },
            other => other,
        })?;
        pos += used;
        records.push(record);
    }
    Ok((version, records))
}

/// Decode either `/fields` layout into its version and descriptors
pub fn decode_fields(body: &[u8]) -> Result<(u32, Vec<String>), CodecError> {
    let version = read_u32(body, 0)?;
    let layout = read_u32(body, 4)?;
    let (count, mut pos) = if layout == 0 {
        need(body, 8, 1)?;
        (body[8] as usize, 9)
    } else {
        (read_u16(body, 8)? as usize, 10)
    };

    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_u16(body, pos)? as usize;
        pos += 2;
        need(body, pos, len)?;
        let raw = &body[pos..pos + len];
        let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
        descriptors.push(String::from_utf8_lossy(raw).into_owned());
        pos += len;
    }
    Ok((version, descriptors))
}
